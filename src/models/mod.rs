pub mod issue;
pub mod metrics;
pub mod probe;
pub mod remediation;
pub mod result;
pub mod target;

pub use issue::{ConfidenceBand, Evidence, Issue, IssueCategories, IssueType};
pub use metrics::{Grade, PerformanceMetrics, ResourceSample};
pub use probe::{
    FunctionalProbe, LoadMode, PayloadClass, PerfOperation, PerformanceProbe, ProbeCategory,
    ProbeKind, ProbeSelection, ProbeSpec, SecurityProbe,
};
pub use remediation::{ActionRecord, RemediationPhase, RemediationResult, RemediationStatus, Strategy};
pub use result::{
    Fault, RawOutcome, RiskLevel, SecurityFinding, SuiteBuilder, SuiteState, TestResult,
    TestStatus, TestSuite, Verdict, VulnerabilityClass,
};
pub use target::{CredentialMode, HttpTarget, StdioTarget, Target, TargetTransport};
