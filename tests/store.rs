mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use common::{FakeFactory, FakeServer, NoSampler, Reply, target};
use mcp_doctor::Engine;
use mcp_doctor::config::EngineConfig;
use mcp_doctor::db::{ResultStore, SqliteStore};
use mcp_doctor::models::{
    Evidence, Issue, IssueType, ProbeCategory, ProbeSelection, RemediationPhase,
    RemediationResult, RemediationStatus, RiskLevel, SecurityFinding, SuiteBuilder, SuiteState,
    TestResult, TestStatus, VulnerabilityClass,
};
use mcp_doctor::orchestrator::SuiteOptions;

async fn store() -> SqliteStore {
    SqliteStore::connect("sqlite::memory:").await.unwrap()
}

fn result(server: &str, probe: &str, status: TestStatus, confidence: u8) -> TestResult {
    TestResult {
        id: Uuid::new_v4(),
        suite_id: Uuid::nil(),
        server: server.to_string(),
        probe: probe.to_string(),
        category: ProbeCategory::Functional,
        status,
        confidence,
        duration: Duration::from_nanos(12_345_678),
        timestamp: Utc::now(),
        message: format!("{probe} {status}"),
        error_message: (status != TestStatus::Passed).then(|| "boom".to_string()),
        suggestions: vec!["Check the server logs".to_string()],
        finding: None,
    }
}

#[tokio::test]
async fn test_save_result_twice_keeps_one_record() {
    let store = store().await;
    let result = result("srv", "ping", TestStatus::Passed, 100);
    store.save_result(&result).await.unwrap();
    let count = store.query("srv", 10).await.unwrap().len();
    store.save_result(&result).await.unwrap();
    assert_eq!(store.query("srv", 10).await.unwrap().len(), count);
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_suite_round_trip_preserves_results() {
    let store = store().await;
    let mut builder = SuiteBuilder::new("diagnostics", "srv");
    builder.push(result("srv", "connectivity", TestStatus::Passed, 100));
    builder.push(result("srv", "ping", TestStatus::TimedOut, 0));
    let mut insecure = result("srv", "injection_sql", TestStatus::Failed, 50);
    insecure.category = ProbeCategory::Security;
    insecure.finding = Some(SecurityFinding::new(
        VulnerabilityClass::SqlInjection,
        RiskLevel::High,
        "payload echoed",
    ));
    builder.push(insecure);
    builder.push(result("srv", "tool_execution", TestStatus::Error, 20));
    let suite = builder.seal(SuiteState::Completed, Duration::from_millis(4_321));

    store.save_suite(&suite).await.unwrap();
    // At-least-once delivery may repeat the write
    store.save_suite(&suite).await.unwrap();

    let loaded = store.get_suite(suite.id).await.unwrap().unwrap();
    assert_eq!(loaded, suite);
    for (stored, original) in loaded.results.iter().zip(&suite.results) {
        assert_eq!(stored.status, original.status);
        assert_eq!(stored.confidence, original.confidence);
        assert_eq!(stored.duration, original.duration);
        assert_eq!(stored.timestamp, original.timestamp);
    }

    let latest = store.latest_suites("srv", 5).await.unwrap();
    assert_eq!(latest.len(), 1);
    assert!(store.get_suite(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_statistics_per_server() {
    let store = store().await;
    store.save_result(&result("a", "ping", TestStatus::Passed, 100)).await.unwrap();
    store.save_result(&result("a", "tools", TestStatus::Failed, 40)).await.unwrap();
    store.save_result(&result("b", "ping", TestStatus::Passed, 90)).await.unwrap();

    let all = store.statistics(None).await.unwrap();
    assert_eq!(all.total_results, 3);
    assert_eq!(all.servers.len(), 2);
    assert!((all.average_confidence - 230.0 / 3.0).abs() < 1e-9);

    let a = store.statistics(Some("a")).await.unwrap();
    assert_eq!(a.total_results, 2);
    assert!((a.pass_rate - 0.5).abs() < 1e-9);
    assert_eq!(a.by_status.get("failed"), Some(&1));
}

#[tokio::test]
async fn test_remediation_audit_trail() {
    let store = store().await;
    let issue = Issue {
        id: Uuid::new_v4(),
        issue_type: IssueType::Connection,
        severity: 3,
        description: "3 consecutive connection failures".into(),
        confidence: 95,
        server: "srv".into(),
        timestamp: Utc::now(),
        pattern_id: Some("consecutive_connection_failures".into()),
        signature: "abc".into(),
        evidence: vec![Evidence {
            probe: None,
            result_id: None,
            metric: Some("connection_attempt".into()),
            detail: "connection refused".into(),
        }],
        suggestions: vec![],
    };
    store.save_issue(&issue).await.unwrap();
    store.save_issue(&issue).await.unwrap();

    for status in [RemediationStatus::Failed, RemediationStatus::Success] {
        let attempt = RemediationResult {
            id: Uuid::new_v4(),
            issue_id: issue.id,
            status,
            actions_taken: vec![],
            phases: vec![RemediationPhase::Exhausted],
            manual_steps: vec![],
            started_at: Utc::now(),
            duration: Duration::from_millis(1500),
        };
        store.save_remediation(&attempt).await.unwrap();
    }

    let trail = store.remediations_for(issue.id).await.unwrap();
    assert_eq!(trail.len(), 2);
    assert_eq!(trail[0].status, RemediationStatus::Failed);
    assert_eq!(trail[1].status, RemediationStatus::Success);
}

#[tokio::test]
async fn test_purge_keeps_recent_records() {
    let store = store().await;
    let mut old = result("srv", "ping", TestStatus::Passed, 100);
    old.timestamp = Utc::now() - chrono::Duration::days(120);
    store.save_result(&old).await.unwrap();
    store.save_result(&result("srv", "ping", TestStatus::Passed, 100)).await.unwrap();

    assert_eq!(store.purge_older_than(90).await.unwrap(), 1);
    assert_eq!(store.query("srv", 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_engine_persists_suites_and_issues() {
    let store: Arc<dyn ResultStore> = Arc::new(store().await);
    let factory = FakeFactory::new(FakeServer::new("srv").on("ping", Reply::Disconnect));
    let engine = Engine::builder(EngineConfig::default())
        .factory(factory)
        .sampler(Arc::new(NoSampler))
        .store(store.clone())
        .build()
        .unwrap();

    let suite = engine
        .run_suite(
            target("srv"),
            &ProbeSelection::names(&["connectivity", "ping"]),
            &SuiteOptions::from_config(engine.config()),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let issues = engine.detect_issues(&suite, &suite.metrics);
    assert!(!issues.is_empty());
    assert_eq!(engine.shutdown().await.unwrap(), 0);

    let stored = store.get_suite(suite.id).await.unwrap().unwrap();
    assert_eq!(stored.results.len(), 2);
    let stats = store.statistics(Some("srv")).await.unwrap();
    assert_eq!(stats.total_suites, 1);
    assert_eq!(stats.total_results, 2);
}
