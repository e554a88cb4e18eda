use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DoctorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeCategory {
    Functional,
    Security,
    Performance,
}

impl ProbeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeCategory::Functional => "functional",
            ProbeCategory::Security => "security",
            ProbeCategory::Performance => "performance",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "functional" => Some(ProbeCategory::Functional),
            "security" => Some(ProbeCategory::Security),
            "performance" => Some(ProbeCategory::Performance),
            _ => None,
        }
    }
}

impl fmt::Display for ProbeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, timed check against a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub name: String,
    pub timeout: Duration,
    /// Latency at or below which the latency signal is 1.0
    pub latency_threshold: Duration,
    pub kind: ProbeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "category", content = "probe", rename_all = "snake_case")]
pub enum ProbeKind {
    Functional(FunctionalProbe),
    Security(SecurityProbe),
    Performance(PerformanceProbe),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FunctionalProbe {
    /// Handshake produced a well-formed capability advertisement
    Connectivity,
    Ping,
    ToolDiscovery,
    /// Call a tool with schema-derived sample arguments (first tool when unnamed)
    ToolExecution {
        tool: Option<String>,
        arguments: Option<Value>,
    },
    ResourceDiscovery,
    ResourceRead { uri: Option<String> },
    PromptDiscovery,
    PromptGet { prompt: Option<String> },
    /// Static sanity check of the target descriptor
    ConfigurationValidation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProbe {
    NoCredentials,
    InvalidCredentials,
    ExpiredCredentials,
    /// Invoke privileged tools the server never advertised
    PrivilegeEscalation,
    /// Read resources outside anything the server exposes
    UnauthorizedResource,
    Injection(PayloadClass),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadClass {
    Sql,
    Command,
    PathTraversal,
    Markup,
    NullByte,
    UnicodeBypass,
    Oversized,
    XmlEntity,
}

impl PayloadClass {
    pub const ALL: [PayloadClass; 8] = [
        PayloadClass::Sql,
        PayloadClass::Command,
        PayloadClass::PathTraversal,
        PayloadClass::Markup,
        PayloadClass::NullByte,
        PayloadClass::UnicodeBypass,
        PayloadClass::Oversized,
        PayloadClass::XmlEntity,
    ];

    pub fn probe_name(&self) -> &'static str {
        match self {
            PayloadClass::Sql => "injection_sql",
            PayloadClass::Command => "injection_command",
            PayloadClass::PathTraversal => "injection_path_traversal",
            PayloadClass::Markup => "injection_markup",
            PayloadClass::NullByte => "input_null_byte",
            PayloadClass::UnicodeBypass => "input_unicode_bypass",
            PayloadClass::Oversized => "input_oversized",
            PayloadClass::XmlEntity => "input_xml_entity",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceProbe {
    pub operation: PerfOperation,
    pub mode: LoadMode,
}

/// The request a performance probe issues repeatedly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PerfOperation {
    Ping,
    ListTools,
    CallTool {
        tool: Option<String>,
        arguments: Option<Value>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Sequential requests over the suite's session
    Benchmark { iterations: u32 },
    /// `concurrency` workers issuing requests for `duration`
    Load { concurrency: u32, duration: Duration },
}

impl ProbeSpec {
    pub fn new(name: impl Into<String>, timeout: Duration, kind: ProbeKind) -> Self {
        Self {
            name: name.into(),
            timeout,
            latency_threshold: Duration::from_secs(2),
            kind,
        }
    }

    pub fn with_latency_threshold(mut self, threshold: Duration) -> Self {
        self.latency_threshold = threshold;
        self
    }

    pub fn category(&self) -> ProbeCategory {
        match self.kind {
            ProbeKind::Functional(_) => ProbeCategory::Functional,
            ProbeKind::Security(_) => ProbeCategory::Security,
            ProbeKind::Performance(_) => ProbeCategory::Performance,
        }
    }

    /// Reject malformed specs before any session is opened.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DoctorError::Validation("probe name must not be empty".into()));
        }
        if self.timeout.is_zero() {
            return Err(DoctorError::Validation(format!(
                "probe '{}' has a zero timeout",
                self.name
            )));
        }
        if self.latency_threshold.is_zero() {
            return Err(DoctorError::Validation(format!(
                "probe '{}' has a zero latency threshold",
                self.name
            )));
        }
        if let ProbeKind::Performance(perf) = &self.kind {
            match &perf.mode {
                LoadMode::Benchmark { iterations } if *iterations == 0 => {
                    return Err(DoctorError::Validation(format!(
                        "probe '{}' needs at least one iteration",
                        self.name
                    )));
                }
                LoadMode::Load {
                    concurrency,
                    duration,
                } => {
                    if *concurrency == 0 || *concurrency > 1000 {
                        return Err(DoctorError::Validation(format!(
                            "probe '{}' concurrency must be within 1..=1000, got {}",
                            self.name, concurrency
                        )));
                    }
                    if duration.is_zero() || *duration >= self.timeout {
                        return Err(DoctorError::Validation(format!(
                            "probe '{}' load window {:?} must be non-zero and shorter than its timeout {:?}",
                            self.name, duration, self.timeout
                        )));
                    }
                }
                LoadMode::Benchmark { .. } => {}
            }
        }
        Ok(())
    }
}

/// Which probes a suite runs. Empty lists mean "everything".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProbeSelection {
    #[serde(default)]
    pub categories: Vec<ProbeCategory>,
    #[serde(default)]
    pub names: Vec<String>,
}

impl ProbeSelection {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn categories(categories: &[ProbeCategory]) -> Self {
        Self {
            categories: categories.to_vec(),
            names: Vec::new(),
        }
    }

    pub fn names<S: AsRef<str>>(names: &[S]) -> Self {
        Self {
            categories: Vec::new(),
            names: names.iter().map(|n| n.as_ref().to_string()).collect(),
        }
    }

    pub fn includes(&self, spec: &ProbeSpec) -> bool {
        let category_ok =
            self.categories.is_empty() || self.categories.contains(&spec.category());
        let name_ok = self.names.is_empty() || self.names.iter().any(|n| n == &spec.name);
        category_ok && name_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_spec(concurrency: u32, duration: Duration, timeout: Duration) -> ProbeSpec {
        ProbeSpec::new(
            "load",
            timeout,
            ProbeKind::Performance(PerformanceProbe {
                operation: PerfOperation::Ping,
                mode: LoadMode::Load {
                    concurrency,
                    duration,
                },
            }),
        )
    }

    #[test]
    fn test_load_window_must_fit_timeout() {
        let ok = load_spec(10, Duration::from_secs(60), Duration::from_secs(90));
        assert!(ok.validate().is_ok());

        let too_long = load_spec(10, Duration::from_secs(60), Duration::from_secs(30));
        assert!(matches!(too_long.validate(), Err(DoctorError::Validation(_))));
    }

    #[test]
    fn test_concurrency_bounds() {
        let zero = load_spec(0, Duration::from_secs(1), Duration::from_secs(5));
        assert!(zero.validate().is_err());
        let huge = load_spec(5000, Duration::from_secs(1), Duration::from_secs(5));
        assert!(huge.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let spec = ProbeSpec::new(
            "ping",
            Duration::ZERO,
            ProbeKind::Functional(FunctionalProbe::Ping),
        );
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_selection_filters_by_category_and_name() {
        let ping = ProbeSpec::new(
            "ping",
            Duration::from_secs(5),
            ProbeKind::Functional(FunctionalProbe::Ping),
        );
        let sql = ProbeSpec::new(
            "injection_sql",
            Duration::from_secs(5),
            ProbeKind::Security(SecurityProbe::Injection(PayloadClass::Sql)),
        );

        assert!(ProbeSelection::all().includes(&ping));
        let security = ProbeSelection::categories(&[ProbeCategory::Security]);
        assert!(!security.includes(&ping));
        assert!(security.includes(&sql));
        assert!(ProbeSelection::names(&["ping"]).includes(&ping));
        assert!(!ProbeSelection::names(&["ping"]).includes(&sql));
    }
}
