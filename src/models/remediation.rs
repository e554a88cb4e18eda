use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A corrective action the engine knows how to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Reconnect,
    RestartProcess,
    ClearCache,
    ReduceConcurrency,
    IncreaseTimeout,
    ResetToDefaults,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Reconnect => "reconnect",
            Strategy::RestartProcess => "restart_process",
            Strategy::ClearCache => "clear_cache",
            Strategy::ReduceConcurrency => "reduce_concurrency",
            Strategy::IncreaseTimeout => "increase_timeout",
            Strategy::ResetToDefaults => "reset_to_defaults",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationStatus {
    /// The first strategy fixed the issue
    Success,
    /// A later strategy fixed the issue
    PartialSuccess,
    Failed,
}

impl RemediationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemediationStatus::Success => "success",
            RemediationStatus::PartialSuccess => "partial_success",
            RemediationStatus::Failed => "failed",
        }
    }
}

/// State-machine phases, recorded in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RemediationPhase {
    Attempting { strategy: Strategy, attempt: u32 },
    Validating { strategy: Strategy, attempt: u32 },
    Succeeded { strategy: Strategy },
    NextStrategy { from: Strategy },
    Exhausted,
}

/// One application of a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub strategy: Strategy,
    pub attempt: u32,
    /// Wait before this attempt
    pub backoff: Duration,
    pub applied: bool,
    pub validated: bool,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationResult {
    pub id: Uuid,
    pub issue_id: Uuid,
    pub status: RemediationStatus,
    pub actions_taken: Vec<ActionRecord>,
    pub phases: Vec<RemediationPhase>,
    pub manual_steps: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl RemediationResult {
    pub fn succeeded(&self) -> bool {
        self.status != RemediationStatus::Failed
    }
}
