// ============================================
// Result Store
// ============================================
//
// Durable history of suites, results, issues and remediation attempts.
// Writes are idempotent by id, so a retried write never duplicates a record.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Issue, RemediationResult, TestResult, TestStatus, TestSuite};

pub mod memory;
pub mod sqlite;
pub mod write_buffer;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use write_buffer::{StoreRecord, WriteBuffer, WriteBufferHandle};

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persist one result. Saving the same id twice keeps a single record.
    async fn save_result(&self, result: &TestResult) -> Result<Uuid>;

    /// Persist a sealed suite together with its results.
    async fn save_suite(&self, suite: &TestSuite) -> Result<Uuid>;

    /// Most recent results of a server, newest first.
    async fn query(&self, server: &str, limit: usize) -> Result<Vec<TestResult>>;

    async fn statistics(&self, server: Option<&str>) -> Result<StoreStatistics>;

    /// Delete records older than `days`; returns how many records were removed.
    async fn purge_older_than(&self, days: u32) -> Result<u64>;

    async fn get_suite(&self, id: Uuid) -> Result<Option<TestSuite>>;

    async fn latest_suites(&self, server: &str, limit: usize) -> Result<Vec<TestSuite>>;

    async fn save_issue(&self, issue: &Issue) -> Result<Uuid>;

    /// Append a remediation attempt to an issue's audit trail.
    async fn save_remediation(&self, result: &RemediationResult) -> Result<Uuid>;

    async fn remediations_for(&self, issue_id: Uuid) -> Result<Vec<RemediationResult>>;
}

// ============================================
// Statistics
// ============================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerStatistics {
    pub results: u64,
    pub suites: u64,
    pub by_status: BTreeMap<String, u64>,
    pub average_confidence: f64,
    pub pass_rate: f64,
    pub last_result_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStatistics {
    pub total_results: u64,
    pub total_suites: u64,
    pub by_status: BTreeMap<String, u64>,
    pub average_confidence: f64,
    pub pass_rate: f64,
    pub servers: BTreeMap<String, ServerStatistics>,
}

/// Results of one server with one status, pre-aggregated by the backend.
#[derive(Debug, Clone)]
pub(crate) struct StatusGroup {
    pub server: String,
    pub status: String,
    pub count: u64,
    pub confidence_sum: f64,
    pub last: Option<DateTime<Utc>>,
}

impl StoreStatistics {
    pub(crate) fn from_groups(groups: Vec<StatusGroup>, suites: Vec<(String, u64)>) -> Self {
        let mut stats = StoreStatistics::default();
        let mut confidence_total = 0.0;
        let mut server_confidence: BTreeMap<String, f64> = BTreeMap::new();

        for group in groups {
            let server = stats.servers.entry(group.server.clone()).or_default();
            server.results += group.count;
            *server.by_status.entry(group.status.clone()).or_default() += group.count;
            server.last_result_at = server.last_result_at.max(group.last);
            *server_confidence.entry(group.server).or_default() += group.confidence_sum;

            stats.total_results += group.count;
            *stats.by_status.entry(group.status).or_default() += group.count;
            confidence_total += group.confidence_sum;
        }
        for (name, count) in suites {
            stats.servers.entry(name).or_default().suites += count;
            stats.total_suites += count;
        }

        let passed = TestStatus::Passed.as_str();
        for (name, server) in stats.servers.iter_mut() {
            if server.results > 0 {
                let sum = server_confidence.get(name).copied().unwrap_or(0.0);
                server.average_confidence = sum / server.results as f64;
                server.pass_rate = server.by_status.get(passed).copied().unwrap_or(0) as f64
                    / server.results as f64;
            }
        }
        if stats.total_results > 0 {
            stats.average_confidence = confidence_total / stats.total_results as f64;
            stats.pass_rate = stats.by_status.get(passed).copied().unwrap_or(0) as f64
                / stats.total_results as f64;
        }
        stats
    }
}
