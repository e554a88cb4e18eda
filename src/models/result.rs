use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::metrics::PerformanceMetrics;
use super::probe::ProbeCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Error,
    TimedOut,
    Skipped,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Error => "error",
            TestStatus::TimedOut => "timed_out",
            TestStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "passed" => Some(TestStatus::Passed),
            "failed" => Some(TestStatus::Failed),
            "error" => Some(TestStatus::Error),
            "timed_out" => Some(TestStatus::TimedOut),
            "skipped" => Some(TestStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_problem(&self) -> bool {
        matches!(self, TestStatus::Failed | TestStatus::Error | TestStatus::TimedOut)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a probe's observation compares to what it expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Exact,
    Partial,
    Mismatch,
    /// The target lacks the capability the probe needs
    NotApplicable,
}

impl Verdict {
    pub fn outcome_signal(&self) -> f64 {
        match self {
            Verdict::Exact => 1.0,
            Verdict::Partial => 0.5,
            Verdict::Mismatch | Verdict::NotApplicable => 0.0,
        }
    }
}

/// Faults that override the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fault {
    Timeout,
    Cancelled,
    /// Transport lost mid-probe (process exit, closed pipe, refused socket)
    Crash,
    ProtocolViolation,
    /// The probe task itself panicked
    Panic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Issue severity on the 1..=4 scale.
    pub fn severity(&self) -> u8 {
        match self {
            RiskLevel::Low => 1,
            RiskLevel::Medium => 2,
            RiskLevel::High => 3,
            RiskLevel::Critical => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VulnerabilityClass {
    MissingAuthentication,
    InvalidCredentialAcceptance,
    ExpiredCredentialAcceptance,
    PrivilegeEscalation,
    UnauthorizedResourceAccess,
    SqlInjection,
    CommandInjection,
    PathTraversal,
    MarkupInjection,
    NullByteInjection,
    UnicodeBypass,
    OversizedInput,
    XmlEntityExpansion,
}

impl VulnerabilityClass {
    pub fn recommended_fix(&self) -> &'static str {
        match self {
            VulnerabilityClass::MissingAuthentication => {
                "Require credentials before serving any request and fail the handshake when they are absent"
            }
            VulnerabilityClass::InvalidCredentialAcceptance => {
                "Verify credentials against the issuer instead of only checking that they are present"
            }
            VulnerabilityClass::ExpiredCredentialAcceptance => {
                "Validate token expiry (exp claim) and reject expired credentials"
            }
            VulnerabilityClass::PrivilegeEscalation => {
                "Reject calls to tools that are not advertised to the caller and enforce per-tool authorization"
            }
            VulnerabilityClass::UnauthorizedResourceAccess => {
                "Restrict resources/read to an allow-list of exposed URIs and canonicalize paths before access"
            }
            VulnerabilityClass::SqlInjection => {
                "Use parameterized queries and validate tool arguments against the input schema"
            }
            VulnerabilityClass::CommandInjection => {
                "Never pass tool arguments to a shell; invoke programs with explicit argument vectors"
            }
            VulnerabilityClass::PathTraversal => {
                "Canonicalize paths and confine them to an allowed root directory"
            }
            VulnerabilityClass::MarkupInjection => {
                "Escape or strip markup before echoing user input into responses"
            }
            VulnerabilityClass::NullByteInjection => {
                "Reject strings containing NUL bytes before using them as identifiers or paths"
            }
            VulnerabilityClass::UnicodeBypass => {
                "Normalize Unicode input and reject bidirectional control characters"
            }
            VulnerabilityClass::OversizedInput => {
                "Enforce maximum argument sizes and reject oversized input with a validation error"
            }
            VulnerabilityClass::XmlEntityExpansion => {
                "Disable DTD processing and entity expansion in XML parsers"
            }
        }
    }
}

/// What a security probe found, attached to its `TestResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityFinding {
    pub vulnerability_class: VulnerabilityClass,
    pub risk_level: RiskLevel,
    pub recommended_fix: String,
    pub evidence: String,
}

impl SecurityFinding {
    pub fn new(class: VulnerabilityClass, risk: RiskLevel, evidence: impl Into<String>) -> Self {
        Self {
            vulnerability_class: class,
            risk_level: risk,
            recommended_fix: class.recommended_fix().to_string(),
            evidence: evidence.into(),
        }
    }
}

/// Unscored observation of one probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawOutcome {
    /// A well-formed, non-error response arrived
    pub success: bool,
    /// Wall time of the probe
    pub elapsed: Duration,
    /// Response latency fed to the latency signal
    pub latency: Duration,
    pub payload: Option<Value>,
    pub error_text: Option<String>,
    pub fault: Option<Fault>,
    pub verdict: Verdict,
    /// Server stderr emitted while the probe ran
    pub stderr: Vec<String>,
    pub sub_metrics: BTreeMap<String, f64>,
    pub finding: Option<SecurityFinding>,
    pub performance: Option<PerformanceMetrics>,
    pub note: Option<String>,
}

impl RawOutcome {
    fn blank(elapsed: Duration) -> Self {
        Self {
            success: false,
            elapsed,
            latency: elapsed,
            payload: None,
            error_text: None,
            fault: None,
            verdict: Verdict::Mismatch,
            stderr: Vec::new(),
            sub_metrics: BTreeMap::new(),
            finding: None,
            performance: None,
            note: None,
        }
    }

    pub fn success(elapsed: Duration, payload: Value) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            ..Self::blank(elapsed)
        }
    }

    /// A well-formed error response from the server.
    pub fn rejected(elapsed: Duration, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            error_text: Some(message.into()),
            payload: data,
            ..Self::blank(elapsed)
        }
    }

    pub fn fault(fault: Fault, elapsed: Duration, message: impl Into<String>) -> Self {
        Self {
            fault: Some(fault),
            error_text: Some(message.into()),
            ..Self::blank(elapsed)
        }
    }

    pub fn timed_out(elapsed: Duration, limit: Duration) -> Self {
        Self::fault(
            Fault::Timeout,
            elapsed,
            format!("operation timed out after {}ms", limit.as_millis()),
        )
    }

    pub fn cancelled(elapsed: Duration) -> Self {
        Self::fault(Fault::Cancelled, elapsed, "probe cancelled")
    }

    pub fn not_applicable(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::NotApplicable,
            note: Some(reason.into()),
            ..Self::blank(Duration::ZERO)
        }
    }

    pub fn with_verdict(mut self, verdict: Verdict) -> Self {
        self.verdict = verdict;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn is_fault(&self, fault: Fault) -> bool {
        self.fault == Some(fault)
    }
}

/// Scored outcome of a single probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub id: Uuid,
    pub suite_id: Uuid,
    pub server: String,
    pub probe: String,
    pub category: ProbeCategory,
    pub status: TestStatus,
    /// 0..=100
    pub confidence: u8,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub error_message: Option<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    pub finding: Option<SecurityFinding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteState {
    Pending,
    Running,
    Completed,
    Aborted,
}

impl SuiteState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuiteState::Pending => "pending",
            SuiteState::Running => "running",
            SuiteState::Completed => "completed",
            SuiteState::Aborted => "aborted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(SuiteState::Pending),
            "running" => Some(SuiteState::Running),
            "completed" => Some(SuiteState::Completed),
            "aborted" => Some(SuiteState::Aborted),
            _ => None,
        }
    }
}

/// A sealed run of probes against one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSuite {
    pub id: Uuid,
    pub name: String,
    pub server: String,
    pub state: SuiteState,
    pub results: Vec<TestResult>,
    pub aggregate_confidence: f64,
    pub total_duration: Duration,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metrics: Vec<PerformanceMetrics>,
}

impl TestSuite {
    pub fn result(&self, probe: &str) -> Option<&TestResult> {
        self.results.iter().find(|r| r.probe == probe)
    }

    pub fn count(&self, status: TestStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

/// Mean member confidence with Error results counted as zero. Empty suites score 0.
pub fn aggregate_confidence(results: &[TestResult]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    let total: f64 = results
        .iter()
        .map(|r| match r.status {
            TestStatus::Error => 0.0,
            _ => f64::from(r.confidence),
        })
        .sum();
    total / results.len() as f64
}

/// Accumulates results until the suite is sealed.
#[derive(Debug)]
pub struct SuiteBuilder {
    id: Uuid,
    name: String,
    server: String,
    started_at: DateTime<Utc>,
    results: Vec<TestResult>,
    metrics: Vec<PerformanceMetrics>,
}

impl SuiteBuilder {
    pub fn new(name: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            server: server.into(),
            started_at: Utc::now(),
            results: Vec::new(),
            metrics: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn push(&mut self, mut result: TestResult) -> &TestResult {
        result.suite_id = self.id;
        let index = self.results.len();
        self.results.push(result);
        &self.results[index]
    }

    pub fn push_metrics(&mut self, metrics: PerformanceMetrics) {
        self.metrics.push(metrics);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn seal(self, state: SuiteState, total_duration: Duration) -> TestSuite {
        TestSuite {
            id: self.id,
            name: self.name,
            server: self.server,
            state,
            aggregate_confidence: aggregate_confidence(&self.results),
            results: self.results,
            total_duration,
            timestamp: self.started_at,
            metrics: self.metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: TestStatus, confidence: u8) -> TestResult {
        TestResult {
            id: Uuid::new_v4(),
            suite_id: Uuid::nil(),
            server: "srv".into(),
            probe: "ping".into(),
            category: ProbeCategory::Functional,
            status,
            confidence,
            duration: Duration::from_millis(10),
            timestamp: Utc::now(),
            message: String::new(),
            error_message: None,
            suggestions: Vec::new(),
            finding: None,
        }
    }

    #[test]
    fn test_aggregate_counts_errors_as_zero() {
        let results = vec![
            result(TestStatus::Passed, 100),
            result(TestStatus::Passed, 90),
            result(TestStatus::Error, 40),
        ];
        let aggregate = aggregate_confidence(&results);
        assert!((aggregate - 190.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_suite_scores_zero() {
        let suite = SuiteBuilder::new("empty", "srv").seal(SuiteState::Completed, Duration::ZERO);
        assert_eq!(suite.aggregate_confidence, 0.0);
        assert!(suite.results.is_empty());
    }

    #[test]
    fn test_builder_assigns_suite_id() {
        let mut builder = SuiteBuilder::new("run", "srv");
        builder.push(result(TestStatus::Passed, 100));
        let suite = builder.seal(SuiteState::Completed, Duration::from_secs(1));
        assert!(suite.results.iter().all(|r| r.suite_id == suite.id));
        assert_eq!(suite.count(TestStatus::Passed), 1);
    }

    #[test]
    fn test_risk_severity_scale() {
        assert_eq!(RiskLevel::Low.severity(), 1);
        assert_eq!(RiskLevel::Critical.severity(), 4);
        assert!(RiskLevel::High > RiskLevel::Medium);
    }
}
