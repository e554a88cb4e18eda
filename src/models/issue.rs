use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Connection,
    Timeout,
    Authentication,
    Authorization,
    ToolExecution,
    ResourceAccess,
    Configuration,
    Performance,
    Security,
    Protocol,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::Connection => "connection",
            IssueType::Timeout => "timeout",
            IssueType::Authentication => "authentication",
            IssueType::Authorization => "authorization",
            IssueType::ToolExecution => "tool_execution",
            IssueType::ResourceAccess => "resource_access",
            IssueType::Configuration => "configuration",
            IssueType::Performance => "performance",
            IssueType::Security => "security",
            IssueType::Protocol => "protocol",
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What triggered an issue: a result, a metric, or a connection attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub probe: Option<String>,
    pub result_id: Option<Uuid>,
    pub metric: Option<String>,
    pub detail: String,
}

/// A diagnosed problem. Issues are immutable once emitted; later findings
/// produce new records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: Uuid,
    pub issue_type: IssueType,
    /// 1 (low) ..= 4 (critical)
    pub severity: u8,
    pub description: String,
    /// 0..=100
    pub confidence: u8,
    pub server: String,
    pub timestamp: DateTime<Utc>,
    pub pattern_id: Option<String>,
    /// sha256 of server and type, stable across runs
    pub signature: String,
    pub evidence: Vec<Evidence>,
    pub suggestions: Vec<String>,
}

impl Issue {
    /// Probe names referenced by this issue's evidence, deduplicated.
    pub fn probes(&self) -> Vec<String> {
        let mut probes: Vec<String> = self
            .evidence
            .iter()
            .filter_map(|e| e.probe.clone())
            .collect();
        probes.sort();
        probes.dedup();
        probes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    /// >= 90
    High,
    /// 70..90
    Medium,
    /// < 70
    Low,
}

impl ConfidenceBand {
    pub fn of(confidence: u8) -> Self {
        match confidence {
            90..=u8::MAX => ConfidenceBand::High,
            70..=89 => ConfidenceBand::Medium,
            _ => ConfidenceBand::Low,
        }
    }
}

/// Issues bucketed for reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueCategories {
    pub by_type: BTreeMap<IssueType, Vec<Uuid>>,
    pub by_severity: BTreeMap<u8, Vec<Uuid>>,
    pub by_confidence: BTreeMap<ConfidenceBand, Vec<Uuid>>,
    /// Issues whose signature has been seen more than twice
    pub recurring: Vec<Uuid>,
}
