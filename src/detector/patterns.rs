// ============================================
// Issue Patterns
// ============================================
//
// Patterns are plain data: an id, the issue they indicate and a predicate
// over either a result's error text or one PerformanceMetrics field. The
// registry compiles them once and evaluates them through one matcher.

use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{DoctorError, Result};
use crate::models::{IssueType, PerformanceMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Above,
    Below,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// Case-insensitive regexes; any match triggers
    ErrorText { any_of: Vec<String> },
    MetricThreshold {
        metric: String,
        comparison: Comparison,
        threshold: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuePattern {
    pub id: String,
    pub issue_type: IssueType,
    /// 1..=4
    pub severity: u8,
    pub predicate: Predicate,
    /// How often this pattern indicated a real problem, 0..=100
    pub reliability: u8,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// PerformanceMetrics fields a metric predicate may reference.
pub const METRICS: [&str; 8] = [
    "avg_latency_ms",
    "p95_latency_ms",
    "p99_latency_ms",
    "throughput",
    "error_rate",
    "memory_growth",
    "memory_leak_detected",
    "peak_cpu_percent",
];

pub fn metric_value(metrics: &PerformanceMetrics, name: &str) -> Option<f64> {
    let value = match name {
        "avg_latency_ms" => metrics.avg_latency_ms,
        "p95_latency_ms" => metrics.p95_latency_ms,
        "p99_latency_ms" => metrics.p99_latency_ms,
        "throughput" => metrics.throughput,
        "error_rate" => metrics.error_rate,
        "memory_growth" => metrics.memory_growth,
        "memory_leak_detected" => {
            if metrics.memory_leak_detected {
                1.0
            } else {
                0.0
            }
        }
        "peak_cpu_percent" => f64::from(metrics.peak_cpu_percent),
        _ => return None,
    };
    Some(value)
}

impl IssuePattern {
    fn text(
        id: &str,
        issue_type: IssueType,
        severity: u8,
        reliability: u8,
        any_of: &[&str],
        suggestions: &[&str],
    ) -> Self {
        Self {
            id: id.to_string(),
            issue_type,
            severity,
            predicate: Predicate::ErrorText {
                any_of: any_of.iter().map(|s| s.to_string()).collect(),
            },
            reliability,
            suggestions: suggestions.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn metric(
        id: &str,
        severity: u8,
        reliability: u8,
        metric: &str,
        comparison: Comparison,
        threshold: f64,
        suggestions: &[&str],
    ) -> Self {
        Self {
            id: id.to_string(),
            issue_type: IssueType::Performance,
            severity,
            predicate: Predicate::MetricThreshold {
                metric: metric.to_string(),
                comparison,
                threshold,
            },
            reliability,
            suggestions: suggestions.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(DoctorError::Validation("pattern id must not be empty".into()));
        }
        if !(1..=4).contains(&self.severity) {
            return Err(DoctorError::Validation(format!(
                "pattern '{}' severity must be within 1..=4, got {}",
                self.id, self.severity
            )));
        }
        if self.reliability > 100 {
            return Err(DoctorError::Validation(format!(
                "pattern '{}' reliability must be within 0..=100, got {}",
                self.id, self.reliability
            )));
        }
        match &self.predicate {
            Predicate::ErrorText { any_of } => {
                if any_of.is_empty() {
                    return Err(DoctorError::Validation(format!(
                        "pattern '{}' has no expressions",
                        self.id
                    )));
                }
                compile(&self.id, any_of)?;
            }
            Predicate::MetricThreshold {
                metric, threshold, ..
            } => {
                if !METRICS.contains(&metric.as_str()) {
                    return Err(DoctorError::Validation(format!(
                        "pattern '{}' references unknown metric '{}'",
                        self.id, metric
                    )));
                }
                if !threshold.is_finite() {
                    return Err(DoctorError::Validation(format!(
                        "pattern '{}' threshold must be finite",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }
}

fn compile(id: &str, expressions: &[String]) -> Result<Vec<Regex>> {
    expressions
        .iter()
        .map(|expr| {
            RegexBuilder::new(expr)
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    DoctorError::Validation(format!("pattern '{id}' has an invalid expression: {e}"))
                })
        })
        .collect()
}

/// Signatures of common MCP server problems.
pub fn builtin_patterns() -> Vec<IssuePattern> {
    use IssueType::*;
    vec![
        IssuePattern::text(
            "connection_refused",
            Connection,
            3,
            95,
            &[
                r"connection.*refused",
                r"no such file or directory",
                r"command not found",
                r"spawn failed",
                r"session (is closed|lost)",
                r"broken pipe",
                r"stdout closed",
            ],
            &[
                "Verify the server command path is correct",
                "Check that the server executable has execute permissions",
                "Ensure the server is installed and its working directory exists",
            ],
        ),
        IssuePattern::text(
            "timeout_error",
            Timeout,
            2,
            90,
            &[r"timed? ?out", r"did not answer"],
            &[
                "Increase the probe timeout",
                "Check server resource usage and blocking calls in handlers",
            ],
        ),
        IssuePattern::text(
            "authentication_bypass",
            Authentication,
            4,
            90,
            &[r"authentication bypass"],
            &[
                "Require and verify credentials before serving any request",
                "Reject expired tokens by checking their expiry claim",
            ],
        ),
        IssuePattern::text(
            "auth_error",
            Authentication,
            3,
            92,
            &[
                r"authentication failed",
                r"invalid credentials",
                r"\bunauthenticated\b",
                r"invalid (api )?key",
            ],
            &[
                "Verify the credentials in the target environment",
                "Check that API keys and tokens are current",
            ],
        ),
        IssuePattern::text(
            "authorization_breach",
            Authorization,
            4,
            90,
            &[r"privilege escalation", r"unauthorized access"],
            &[
                "Enforce per-tool authorization and reject unadvertised tools",
                "Restrict resource reads to an allow-list of exposed URIs",
            ],
        ),
        IssuePattern::text(
            "permission_denied",
            Authorization,
            3,
            88,
            &[r"permission denied", r"\bforbidden\b", r"access denied"],
            &[
                "Check file and process permissions of the server",
                "Review the server's authorization rules",
            ],
        ),
        IssuePattern::text(
            "security_vulnerability",
            Security,
            3,
            90,
            &[r"security vulnerability"],
            &["Validate and sanitize tool arguments against the input schema"],
        ),
        IssuePattern::text(
            "tool_execution_error",
            ToolExecution,
            2,
            85,
            &[
                r"tool execution failed",
                r"invalid (tool )?arguments",
                r"tool .*not found",
                r"unknown tool",
                r"tools/call",
            ],
            &[
                "Verify tool arguments against the advertised input schema",
                "Check the tool implementation for unhandled errors",
            ],
        ),
        IssuePattern::text(
            "resource_access_error",
            ResourceAccess,
            2,
            85,
            &[
                r"resource .*not found",
                r"unknown resource",
                r"resources/read",
            ],
            &["Check that advertised resource URIs can be read"],
        ),
        IssuePattern::text(
            "config_error",
            Configuration,
            3,
            88,
            &[
                r"configuration (error|warning)",
                r"invalid configuration",
                r"missing required (parameter|argument)",
            ],
            &[
                "Review the target descriptor (command, args, env, cwd)",
                "Check that all required parameters are provided",
            ],
        ),
        IssuePattern::text(
            "dependency_missing",
            Configuration,
            3,
            91,
            &[
                r"module not found",
                r"modulenotfounderror",
                r"cannot find module",
                r"import error",
            ],
            &[
                "Install the server's missing dependencies",
                "Verify the runtime environment the server starts in",
            ],
        ),
        IssuePattern::text(
            "protocol_error",
            Protocol,
            2,
            87,
            &[
                r"protocol (error|violation)",
                r"invalid json-rpc",
                r"malformed",
                r"protocol version mismatch",
                r"unparseable",
            ],
            &[
                "Check MCP protocol version compatibility",
                "Verify the server writes only JSON-RPC frames to stdout",
            ],
        ),
        IssuePattern::text(
            "resource_exhaustion",
            Performance,
            4,
            93,
            &[
                r"out of memory",
                r"memory error",
                r"resource exhausted",
                r"too many open files",
            ],
            &[
                "Increase available memory or file descriptor limits",
                "Check the server for leaks",
            ],
        ),
        IssuePattern::metric(
            "high_latency",
            2,
            80,
            "p95_latency_ms",
            Comparison::Above,
            5_000.0,
            &["Profile slow handlers and add caching where responses repeat"],
        ),
        IssuePattern::metric(
            "high_error_rate",
            3,
            85,
            "error_rate",
            Comparison::Above,
            0.05,
            &["Inspect failed operations under load for shared-state contention"],
        ),
        IssuePattern::metric(
            "memory_leak",
            3,
            75,
            "memory_leak_detected",
            Comparison::Above,
            0.5,
            &["Look for caches or buffers that grow with every request"],
        ),
        IssuePattern::metric(
            "low_throughput",
            2,
            70,
            "throughput",
            Comparison::Below,
            1.0,
            &["Check for serialized request handling in the server"],
        ),
    ]
}

// ============================================
// Registry
// ============================================

#[derive(Debug, Clone)]
pub(crate) enum Matcher {
    Text(Vec<Regex>),
    Metric {
        metric: String,
        comparison: Comparison,
        threshold: f64,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct CompiledPattern {
    pub pattern: IssuePattern,
    pub matcher: Matcher,
}

impl CompiledPattern {
    fn new(pattern: IssuePattern) -> Result<Self> {
        pattern.validate()?;
        let matcher = match &pattern.predicate {
            Predicate::ErrorText { any_of } => Matcher::Text(compile(&pattern.id, any_of)?),
            Predicate::MetricThreshold {
                metric,
                comparison,
                threshold,
            } => Matcher::Metric {
                metric: metric.clone(),
                comparison: *comparison,
                threshold: *threshold,
            },
        };
        Ok(Self { pattern, matcher })
    }

    pub fn matches_text(&self, text: &str) -> bool {
        match &self.matcher {
            Matcher::Text(regexes) => regexes.iter().any(|re| re.is_match(text)),
            Matcher::Metric { .. } => false,
        }
    }

    /// The breaching value, if this is a metric pattern and it fires.
    pub fn breach(&self, metrics: &PerformanceMetrics) -> Option<(String, f64)> {
        let Matcher::Metric {
            metric,
            comparison,
            threshold,
        } = &self.matcher
        else {
            return None;
        };
        let value = metric_value(metrics, metric)?;
        let fired = match comparison {
            Comparison::Above => value > *threshold,
            Comparison::Below => value < *threshold,
        };
        fired.then(|| (metric.clone(), value))
    }
}

/// Read-mostly pattern set; writes only come from custom patterns and
/// feedback adjustments.
#[derive(Debug, Default)]
pub struct PatternRegistry {
    patterns: RwLock<Vec<CompiledPattern>>,
}

impl PatternRegistry {
    pub fn new(patterns: Vec<IssuePattern>) -> Result<Self> {
        let compiled = patterns
            .into_iter()
            .map(CompiledPattern::new)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            patterns: RwLock::new(compiled),
        })
    }

    pub fn builtin() -> Self {
        let compiled = builtin_patterns()
            .into_iter()
            .filter_map(|p| match CompiledPattern::new(p) {
                Ok(compiled) => Some(compiled),
                Err(e) => {
                    tracing::error!("Skipping built-in pattern: {}", e);
                    None
                }
            })
            .collect();
        Self {
            patterns: RwLock::new(compiled),
        }
    }

    /// Add or replace a pattern by id.
    pub fn insert(&self, pattern: IssuePattern) -> Result<()> {
        let compiled = CompiledPattern::new(pattern)?;
        let mut patterns = self.patterns.write();
        match patterns.iter_mut().find(|p| p.pattern.id == compiled.pattern.id) {
            Some(existing) => *existing = compiled,
            None => patterns.push(compiled),
        }
        Ok(())
    }

    /// Shift a pattern's reliability by `delta`, clamped to 0..=100.
    pub fn adjust_reliability(&self, id: &str, delta: i32) -> Result<u8> {
        let mut patterns = self.patterns.write();
        let compiled = patterns
            .iter_mut()
            .find(|p| p.pattern.id == id)
            .ok_or_else(|| DoctorError::Validation(format!("unknown pattern '{id}'")))?;
        let updated = (i32::from(compiled.pattern.reliability) + delta).clamp(0, 100) as u8;
        compiled.pattern.reliability = updated;
        Ok(updated)
    }

    pub fn get(&self, id: &str) -> Option<IssuePattern> {
        self.patterns
            .read()
            .iter()
            .find(|p| p.pattern.id == id)
            .map(|p| p.pattern.clone())
    }

    pub fn list(&self) -> Vec<IssuePattern> {
        self.patterns.read().iter().map(|p| p.pattern.clone()).collect()
    }

    pub(crate) fn snapshot(&self) -> Vec<CompiledPattern> {
        self.patterns.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_patterns_are_valid() {
        for pattern in builtin_patterns() {
            assert!(pattern.validate().is_ok(), "{} is invalid", pattern.id);
        }
        assert_eq!(PatternRegistry::builtin().list().len(), builtin_patterns().len());
    }

    #[test]
    fn test_text_match_is_case_insensitive() {
        let registry = PatternRegistry::builtin();
        let timeout = registry
            .snapshot()
            .into_iter()
            .find(|p| p.pattern.id == "timeout_error")
            .unwrap();
        assert!(timeout.matches_text("Operation Timed Out after 30000ms"));
        assert!(!timeout.matches_text("tool returned 3 items"));
    }

    #[test]
    fn test_reliability_is_clamped() {
        let registry = PatternRegistry::builtin();
        assert_eq!(registry.adjust_reliability("timeout_error", 50).unwrap(), 100);
        assert_eq!(registry.adjust_reliability("timeout_error", -250).unwrap(), 0);
        assert!(registry.adjust_reliability("nope", 1).is_err());
    }

    #[test]
    fn test_invalid_custom_patterns_rejected() {
        let registry = PatternRegistry::builtin();
        let bad_regex = IssuePattern::text("bad", IssueType::Protocol, 2, 50, &["(unclosed"], &[]);
        assert!(registry.insert(bad_regex).is_err());
        let bad_metric = IssuePattern::metric("bad", 2, 50, "latency", Comparison::Above, 1.0, &[]);
        assert!(registry.insert(bad_metric).is_err());
        let bad_severity = IssuePattern::text("bad", IssueType::Protocol, 7, 50, &["x"], &[]);
        assert!(registry.insert(bad_severity).is_err());
    }

    #[test]
    fn test_patterns_deserialize_from_json() {
        let pattern: IssuePattern = serde_json::from_str(
            r#"{
                "id": "rate_limited",
                "issue_type": "performance",
                "severity": 2,
                "reliability": 70,
                "predicate": {"kind": "error_text", "any_of": ["rate limit"]}
            }"#,
        )
        .unwrap();
        assert!(pattern.validate().is_ok());
        assert!(pattern.suggestions.is_empty());
    }
}
