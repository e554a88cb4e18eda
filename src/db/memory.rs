// In-process result store for tests and ephemeral runs

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{ResultStore, StatusGroup, StoreStatistics};
use crate::error::Result;
use crate::models::{Issue, RemediationResult, TestResult, TestSuite};

#[derive(Default)]
struct Tables {
    results: HashMap<Uuid, TestResult>,
    suites: HashMap<Uuid, TestSuite>,
    issues: HashMap<Uuid, Issue>,
    remediations: HashMap<Uuid, RemediationResult>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn result_count(&self) -> usize {
        self.tables.read().results.len()
    }

    pub fn issue_count(&self) -> usize {
        self.tables.read().issues.len()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn save_result(&self, result: &TestResult) -> Result<Uuid> {
        self.tables
            .write()
            .results
            .entry(result.id)
            .or_insert_with(|| result.clone());
        Ok(result.id)
    }

    async fn save_suite(&self, suite: &TestSuite) -> Result<Uuid> {
        let mut tables = self.tables.write();
        for result in &suite.results {
            tables
                .results
                .entry(result.id)
                .or_insert_with(|| result.clone());
        }
        tables
            .suites
            .entry(suite.id)
            .or_insert_with(|| suite.clone());
        Ok(suite.id)
    }

    async fn query(&self, server: &str, limit: usize) -> Result<Vec<TestResult>> {
        let tables = self.tables.read();
        let mut results: Vec<TestResult> = tables
            .results
            .values()
            .filter(|r| r.server == server)
            .cloned()
            .collect();
        results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        results.truncate(limit);
        Ok(results)
    }

    async fn statistics(&self, server: Option<&str>) -> Result<StoreStatistics> {
        let tables = self.tables.read();
        let mut groups: BTreeMap<(String, String), StatusGroup> = BTreeMap::new();
        for result in tables
            .results
            .values()
            .filter(|r| server.is_none_or(|s| r.server == s))
        {
            let key = (result.server.clone(), result.status.as_str().to_string());
            let group = groups.entry(key).or_insert_with(|| StatusGroup {
                server: result.server.clone(),
                status: result.status.as_str().to_string(),
                count: 0,
                confidence_sum: 0.0,
                last: None,
            });
            group.count += 1;
            group.confidence_sum += f64::from(result.confidence);
            group.last = group.last.max(Some(result.timestamp));
        }

        let mut suites: BTreeMap<String, u64> = BTreeMap::new();
        for suite in tables
            .suites
            .values()
            .filter(|s| server.is_none_or(|name| s.server == name))
        {
            *suites.entry(suite.server.clone()).or_default() += 1;
        }
        Ok(StoreStatistics::from_groups(
            groups.into_values().collect(),
            suites.into_iter().collect(),
        ))
    }

    async fn purge_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let mut tables = self.tables.write();
        let before = tables.results.len()
            + tables.suites.len()
            + tables.issues.len()
            + tables.remediations.len();
        tables.results.retain(|_, r| r.timestamp >= cutoff);
        tables.suites.retain(|_, s| s.timestamp >= cutoff);
        tables.issues.retain(|_, i| i.timestamp >= cutoff);
        tables.remediations.retain(|_, r| r.started_at >= cutoff);
        let after = tables.results.len()
            + tables.suites.len()
            + tables.issues.len()
            + tables.remediations.len();
        Ok((before - after) as u64)
    }

    async fn get_suite(&self, id: Uuid) -> Result<Option<TestSuite>> {
        Ok(self.tables.read().suites.get(&id).cloned())
    }

    async fn latest_suites(&self, server: &str, limit: usize) -> Result<Vec<TestSuite>> {
        let tables = self.tables.read();
        let mut suites: Vec<TestSuite> = tables
            .suites
            .values()
            .filter(|s| s.server == server)
            .cloned()
            .collect();
        suites.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        suites.truncate(limit);
        Ok(suites)
    }

    async fn save_issue(&self, issue: &Issue) -> Result<Uuid> {
        self.tables
            .write()
            .issues
            .entry(issue.id)
            .or_insert_with(|| issue.clone());
        Ok(issue.id)
    }

    async fn save_remediation(&self, result: &RemediationResult) -> Result<Uuid> {
        self.tables
            .write()
            .remediations
            .entry(result.id)
            .or_insert_with(|| result.clone());
        Ok(result.id)
    }

    async fn remediations_for(&self, issue_id: Uuid) -> Result<Vec<RemediationResult>> {
        let tables = self.tables.read();
        let mut found: Vec<RemediationResult> = tables
            .remediations
            .values()
            .filter(|r| r.issue_id == issue_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(found)
    }
}
