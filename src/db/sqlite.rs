// SQLite-backed result store

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use uuid::Uuid;

use super::{ResultStore, StatusGroup, StoreStatistics};
use crate::error::{DoctorError, Result};
use crate::models::{
    Issue, ProbeCategory, RemediationResult, SuiteState, TestResult, TestStatus, TestSuite,
};

const RESULT_COLUMNS: &str = "id, suite_id, server_name, probe_name, category, status, confidence, \
     duration_ns, message, error_message, suggestions, finding, created_at";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // Every connection to an in-memory database sees its own empty copy
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(if in_memory { None } else { Some(Duration::from_secs(300)) })
            .max_lifetime(if in_memory { None } else { Some(Duration::from_secs(1800)) })
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!("Result store ready at {}", url);

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn results_of_suite(&self, suite_id: Uuid) -> Result<Vec<TestResult>> {
        let rows = sqlx::query(&format!(
            "SELECT {RESULT_COLUMNS} FROM test_results WHERE suite_id = ? ORDER BY rowid ASC"
        ))
        .bind(suite_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(result_from_row).collect()
    }
}

// ============================================
// Column Encoding
// ============================================

fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DoctorError::Store(format!("bad timestamp '{value}': {e}")))
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| DoctorError::Store(format!("bad id '{value}': {e}")))
}

fn nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

fn from_nanos(value: i64) -> Duration {
    Duration::from_nanos(u64::try_from(value).unwrap_or(0))
}

fn result_from_row(row: &SqliteRow) -> Result<TestResult> {
    let category: String = row.try_get("category")?;
    let status: String = row.try_get("status")?;
    let confidence: i64 = row.try_get("confidence")?;
    let suggestions: String = row.try_get("suggestions")?;
    let finding: Option<String> = row.try_get("finding")?;

    Ok(TestResult {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        suite_id: parse_uuid(&row.try_get::<String, _>("suite_id")?)?,
        server: row.try_get("server_name")?,
        probe: row.try_get("probe_name")?,
        category: ProbeCategory::parse(&category)
            .ok_or_else(|| DoctorError::Store(format!("unknown category '{category}'")))?,
        status: TestStatus::parse(&status)
            .ok_or_else(|| DoctorError::Store(format!("unknown status '{status}'")))?,
        confidence: u8::try_from(confidence)
            .map_err(|_| DoctorError::Store(format!("confidence {confidence} out of range")))?,
        duration: from_nanos(row.try_get("duration_ns")?),
        timestamp: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        message: row.try_get("message")?,
        error_message: row.try_get("error_message")?,
        suggestions: serde_json::from_str(&suggestions)?,
        finding: finding.map(|f| serde_json::from_str(&f)).transpose()?,
    })
}

async fn insert_result(tx: &mut Transaction<'_, Sqlite>, result: &TestResult) -> Result<()> {
    sqlx::query(&format!(
        "INSERT OR IGNORE INTO test_results ({RESULT_COLUMNS}) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(result.id.to_string())
    .bind(result.suite_id.to_string())
    .bind(&result.server)
    .bind(&result.probe)
    .bind(result.category.as_str())
    .bind(result.status.as_str())
    .bind(i64::from(result.confidence))
    .bind(nanos(result.duration))
    .bind(&result.message)
    .bind(&result.error_message)
    .bind(serde_json::to_string(&result.suggestions)?)
    .bind(result.finding.as_ref().map(serde_json::to_string).transpose()?)
    .bind(timestamp(&result.timestamp))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl ResultStore for SqliteStore {
    async fn save_result(&self, result: &TestResult) -> Result<Uuid> {
        let mut tx = self.pool.begin().await?;
        insert_result(&mut tx, result).await?;
        tx.commit().await?;
        Ok(result.id)
    }

    async fn save_suite(&self, suite: &TestSuite) -> Result<Uuid> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO test_suites (
                id, name, server_name, state, aggregate_confidence,
                total_duration_ns, metrics, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(suite.id.to_string())
        .bind(&suite.name)
        .bind(&suite.server)
        .bind(suite.state.as_str())
        .bind(suite.aggregate_confidence)
        .bind(nanos(suite.total_duration))
        .bind(serde_json::to_string(&suite.metrics)?)
        .bind(timestamp(&suite.timestamp))
        .execute(&mut *tx)
        .await?;

        for result in &suite.results {
            insert_result(&mut tx, result).await?;
        }
        tx.commit().await?;

        tracing::debug!(
            suite = %suite.id,
            server = %suite.server,
            results = suite.results.len(),
            "Suite persisted"
        );
        Ok(suite.id)
    }

    async fn query(&self, server: &str, limit: usize) -> Result<Vec<TestResult>> {
        let rows = sqlx::query(&format!(
            "SELECT {RESULT_COLUMNS} FROM test_results \
             WHERE server_name = ? ORDER BY created_at DESC LIMIT ?"
        ))
        .bind(server)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(result_from_row).collect()
    }

    async fn statistics(&self, server: Option<&str>) -> Result<StoreStatistics> {
        let rows = sqlx::query(
            r#"
            SELECT server_name, status, COUNT(*) AS n,
                   CAST(SUM(confidence) AS REAL) AS confidence_sum,
                   MAX(created_at) AS last_at
            FROM test_results
            WHERE (?1 IS NULL OR server_name = ?1)
            GROUP BY server_name, status
            "#,
        )
        .bind(server)
        .fetch_all(&self.pool)
        .await?;

        let mut groups = Vec::with_capacity(rows.len());
        for row in &rows {
            let last: Option<String> = row.try_get("last_at")?;
            groups.push(StatusGroup {
                server: row.try_get("server_name")?,
                status: row.try_get("status")?,
                count: u64::try_from(row.try_get::<i64, _>("n")?).unwrap_or(0),
                confidence_sum: row.try_get("confidence_sum")?,
                last: last.as_deref().map(parse_timestamp).transpose()?,
            });
        }

        let suite_rows = sqlx::query(
            r#"
            SELECT server_name, COUNT(*) AS n
            FROM test_suites
            WHERE (?1 IS NULL OR server_name = ?1)
            GROUP BY server_name
            "#,
        )
        .bind(server)
        .fetch_all(&self.pool)
        .await?;
        let mut suites = Vec::with_capacity(suite_rows.len());
        for row in &suite_rows {
            suites.push((
                row.try_get::<String, _>("server_name")?,
                u64::try_from(row.try_get::<i64, _>("n")?).unwrap_or(0),
            ));
        }

        Ok(StoreStatistics::from_groups(groups, suites))
    }

    async fn purge_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = timestamp(&(Utc::now() - chrono::Duration::days(i64::from(days))));
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for table in ["test_results", "test_suites", "issues", "remediations"] {
            removed += sqlx::query(&format!("DELETE FROM {table} WHERE created_at < ?"))
                .bind(&cutoff)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        tracing::info!("Purged {} records older than {} days", removed, days);
        Ok(removed)
    }

    async fn get_suite(&self, id: Uuid) -> Result<Option<TestSuite>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, server_name, state, aggregate_confidence,
                   total_duration_ns, metrics, created_at
            FROM test_suites
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let state: String = row.try_get("state")?;
        let metrics: String = row.try_get("metrics")?;
        Ok(Some(TestSuite {
            id,
            name: row.try_get("name")?,
            server: row.try_get("server_name")?,
            state: SuiteState::parse(&state)
                .ok_or_else(|| DoctorError::Store(format!("unknown suite state '{state}'")))?,
            results: self.results_of_suite(id).await?,
            aggregate_confidence: row.try_get("aggregate_confidence")?,
            total_duration: from_nanos(row.try_get("total_duration_ns")?),
            timestamp: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
            metrics: serde_json::from_str(&metrics)?,
        }))
    }

    async fn latest_suites(&self, server: &str, limit: usize) -> Result<Vec<TestSuite>> {
        let rows = sqlx::query(
            "SELECT id FROM test_suites WHERE server_name = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(server)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut suites = Vec::with_capacity(rows.len());
        for row in &rows {
            let id = parse_uuid(&row.try_get::<String, _>("id")?)?;
            if let Some(suite) = self.get_suite(id).await? {
                suites.push(suite);
            }
        }
        Ok(suites)
    }

    async fn save_issue(&self, issue: &Issue) -> Result<Uuid> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO issues (
                id, server_name, issue_type, severity, confidence, body, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(issue.id.to_string())
        .bind(&issue.server)
        .bind(issue.issue_type.as_str())
        .bind(i64::from(issue.severity))
        .bind(i64::from(issue.confidence))
        .bind(serde_json::to_string(issue)?)
        .bind(timestamp(&issue.timestamp))
        .execute(&self.pool)
        .await?;
        Ok(issue.id)
    }

    async fn save_remediation(&self, result: &RemediationResult) -> Result<Uuid> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO remediations (id, issue_id, status, body, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(result.id.to_string())
        .bind(result.issue_id.to_string())
        .bind(result.status.as_str())
        .bind(serde_json::to_string(result)?)
        .bind(timestamp(&result.started_at))
        .execute(&self.pool)
        .await?;
        Ok(result.id)
    }

    async fn remediations_for(&self, issue_id: Uuid) -> Result<Vec<RemediationResult>> {
        let rows = sqlx::query(
            "SELECT body FROM remediations WHERE issue_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(issue_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<RemediationResult> {
                let body: String = row.try_get("body")?;
                Ok(serde_json::from_str(&body)?)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_round_trip_keeps_nanos() {
        let now = Utc::now();
        assert_eq!(parse_timestamp(&timestamp(&now)).unwrap(), now);
    }

    #[test]
    fn test_duration_encoding() {
        let d = Duration::new(3, 123_456_789);
        assert_eq!(from_nanos(nanos(d)), d);
        assert_eq!(from_nanos(-5), Duration::ZERO);
    }
}
