mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use common::{
    CountingSampler, FakeFactory, FakeServer, GrowingSampler, NoSampler, Reply, query_argument,
    target, text, tool_error,
};
use mcp_doctor::Engine;
use mcp_doctor::config::EngineConfig;
use mcp_doctor::error::DoctorError;
use mcp_doctor::models::{
    FunctionalProbe, IssueType, LoadMode, PayloadClass, PerfOperation, PerformanceProbe,
    ProbeKind, ProbeSelection, ProbeSpec, RemediationStatus, RiskLevel,
    SuiteState, TestStatus,
};
use mcp_doctor::orchestrator::SuiteOptions;
use mcp_doctor::probes::{ProbeCatalog, ResourceSampler};

fn functional(name: &str, timeout: Duration, probe: FunctionalProbe) -> ProbeSpec {
    ProbeSpec::new(name, timeout, ProbeKind::Functional(probe))
}

fn load(concurrency: u32, duration: Duration) -> ProbeSpec {
    ProbeSpec::new(
        "load",
        Duration::from_secs(90),
        ProbeKind::Performance(PerformanceProbe {
            operation: PerfOperation::Ping,
            mode: LoadMode::Load {
                concurrency,
                duration,
            },
        }),
    )
}

fn catalog(specs: Vec<ProbeSpec>) -> ProbeCatalog {
    let mut catalog = ProbeCatalog::empty();
    for spec in specs {
        catalog.register(spec).unwrap();
    }
    catalog
}

fn engine_with(
    factory: Arc<FakeFactory>,
    catalog: Option<ProbeCatalog>,
    sampler: Arc<dyn ResourceSampler>,
) -> Engine {
    let mut builder = Engine::builder(EngineConfig::default())
        .factory(factory)
        .sampler(sampler);
    if let Some(catalog) = catalog {
        builder = builder.catalog(catalog);
    }
    builder.build().unwrap()
}

fn options(engine: &Engine) -> SuiteOptions {
    SuiteOptions::from_config(engine.config())
}

async fn run(engine: &Engine, name: &str, probes: &[&str]) -> mcp_doctor::models::TestSuite {
    engine
        .run_suite(
            target(name),
            &ProbeSelection::names(probes),
            &options(engine),
            CancellationToken::new(),
        )
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_hanging_probe_times_out_at_declared_timeout() {
    let factory = FakeFactory::new(FakeServer::new("slow").on("ping", Reply::Hang));
    let engine = engine_with(
        factory.clone(),
        Some(catalog(vec![functional("ping", Duration::from_secs(30), FunctionalProbe::Ping)])),
        Arc::new(NoSampler),
    );

    let started = Instant::now();
    let suite = run(&engine, "slow", &["ping"]).await;
    let elapsed = started.elapsed();

    let result = suite.result("ping").unwrap();
    assert_eq!(result.status, TestStatus::TimedOut);
    assert_eq!(result.confidence, 0);
    assert!(elapsed >= Duration::from_secs(30), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(31), "returned late: {elapsed:?}");
    assert_eq!(suite.state, SuiteState::Completed);
    assert_eq!(factory.open_transports(), 0);
}

#[tokio::test]
async fn test_sql_payload_rejected_with_validation_error_passes() {
    let server = FakeServer::new("strict")
        .on_tool_call(|_| Reply::Ok(tool_error("Invalid input: q must be alphanumeric")));
    let engine = engine_with(FakeFactory::new(server), None, Arc::new(NoSampler));

    let probe = PayloadClass::Sql.probe_name();
    let suite = run(&engine, "strict", &[probe]).await;
    let result = suite.result(probe).unwrap();
    assert_eq!(result.status, TestStatus::Passed);
    assert!(result.finding.is_none());
}

#[tokio::test]
async fn test_sql_payload_echoed_fails_with_high_risk() {
    let server = FakeServer::new("echo").on_tool_call(|params| {
        Reply::Ok(text(&format!("No results for {}", query_argument(params))))
    });
    let engine = engine_with(FakeFactory::new(server), None, Arc::new(NoSampler));

    let probe = PayloadClass::Sql.probe_name();
    let suite = run(&engine, "echo", &[probe]).await;
    let result = suite.result(probe).unwrap();
    assert_eq!(result.status, TestStatus::Failed);
    let finding = result.finding.as_ref().unwrap();
    assert_eq!(finding.risk_level, RiskLevel::High);

    let issues = engine.detect_issues(&suite, &suite.metrics);
    let security = issues
        .iter()
        .find(|i| i.issue_type == IssueType::Security)
        .unwrap();
    assert!(security.severity >= 3);
    assert!(security.probes().contains(&probe.to_string()));
}

#[tokio::test]
async fn test_error_probe_does_not_abort_suite() {
    let factory = FakeFactory::new(FakeServer::new("flaky").on("ping", Reply::Disconnect));
    let engine = engine_with(
        factory.clone(),
        Some(catalog(vec![
            functional("ping", Duration::from_secs(5), FunctionalProbe::Ping),
            functional("tool_discovery", Duration::from_secs(5), FunctionalProbe::ToolDiscovery),
        ])),
        Arc::new(NoSampler),
    );

    let suite = run(&engine, "flaky", &["ping", "tool_discovery"]).await;
    assert_eq!(suite.state, SuiteState::Completed);
    assert_eq!(suite.result("ping").unwrap().status, TestStatus::Error);
    assert_eq!(suite.result("tool_discovery").unwrap().status, TestStatus::Passed);
    // The lost session was reopened for the second probe
    assert_eq!(factory.opened(), 2);
}

#[tokio::test]
async fn test_fail_fast_aborts_and_keeps_collected_results() {
    let factory = FakeFactory::new(FakeServer::new("flaky").on("ping", Reply::Disconnect));
    let engine = engine_with(
        factory,
        Some(catalog(vec![
            functional("ping", Duration::from_secs(5), FunctionalProbe::Ping),
            functional("tool_discovery", Duration::from_secs(5), FunctionalProbe::ToolDiscovery),
        ])),
        Arc::new(NoSampler),
    );
    let mut options = options(&engine);
    options.fail_fast = true;

    let suite = engine
        .run_suite(
            target("flaky"),
            &ProbeSelection::all(),
            &options,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(suite.state, SuiteState::Aborted);
    assert_eq!(suite.results.len(), 1);
    assert_eq!(suite.results[0].status, TestStatus::Error);
}

#[tokio::test]
async fn test_aggregate_confidence_counts_errors_as_zero() {
    let engine = engine_with(
        FakeFactory::new(FakeServer::new("half").on("ping", Reply::Disconnect)),
        Some(catalog(vec![
            functional("connectivity", Duration::from_secs(5), FunctionalProbe::Connectivity),
            functional("ping", Duration::from_secs(5), FunctionalProbe::Ping),
        ])),
        Arc::new(NoSampler),
    );

    let suite = run(&engine, "half", &["connectivity", "ping"]).await;
    let connectivity = suite.result("connectivity").unwrap();
    assert_eq!(connectivity.status, TestStatus::Passed);
    assert_eq!(suite.result("ping").unwrap().status, TestStatus::Error);
    let expected = f64::from(connectivity.confidence) / 2.0;
    assert!((suite.aggregate_confidence - expected).abs() < 1e-9);
}

#[tokio::test]
async fn test_panicking_probe_becomes_error() {
    let engine = engine_with(
        FakeFactory::new(FakeServer::new("buggy").on("ping", Reply::Panic)),
        Some(catalog(vec![
            functional("ping", Duration::from_secs(5), FunctionalProbe::Ping),
            functional("tool_discovery", Duration::from_secs(5), FunctionalProbe::ToolDiscovery),
        ])),
        Arc::new(NoSampler),
    );

    let suite = run(&engine, "buggy", &["ping", "tool_discovery"]).await;
    let ping = suite.result("ping").unwrap();
    assert_eq!(ping.status, TestStatus::Error);
    assert!(ping.error_message.as_deref().unwrap_or_default().contains("panicked"));
    assert_eq!(suite.result("tool_discovery").unwrap().status, TestStatus::Passed);
}

#[tokio::test(start_paused = true)]
async fn test_load_with_growing_memory_reports_leak() {
    let factory = FakeFactory::new(FakeServer::new("leaky").latency(Duration::from_millis(100)));
    let engine = engine_with(
        factory.clone(),
        Some(catalog(vec![load(10, Duration::from_secs(60))])),
        Arc::new(GrowingSampler::default()),
    );

    let suite = run(&engine, "leaky", &["load"]).await;
    assert_eq!(suite.metrics.len(), 1);
    let metrics = &suite.metrics[0];
    assert_eq!(metrics.concurrency, 10);
    assert!(metrics.memory_leak_detected);
    assert!(metrics.total_operations > 0);
    assert_eq!(metrics.failed_operations, 0);

    let issues = engine.detect_issues(&suite, &suite.metrics);
    assert!(issues.iter().any(|i| i.issue_type == IssueType::Performance));
    // Suite session plus one per worker, all closed
    assert_eq!(factory.opened(), 11);
    assert_eq!(factory.open_transports(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_load_stops_resource_sampling() {
    let factory = FakeFactory::new(FakeServer::new("busy").latency(Duration::from_millis(100)));
    let sampler = Arc::new(CountingSampler::default());
    let engine = engine_with(
        factory.clone(),
        Some(catalog(vec![load(2, Duration::from_secs(60))])),
        sampler.clone(),
    );

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            cancel.cancel();
        })
    };
    let suite = engine
        .run_suite(target("busy"), &ProbeSelection::names(&["load"]), &options(&engine), cancel)
        .await
        .unwrap();
    canceller.await.unwrap();
    assert_eq!(suite.state, SuiteState::Aborted);

    let at_return = sampler.readings();
    assert!(at_return > 0);
    tokio::time::sleep(Duration::from_secs(600)).await;
    // At most the closing reading taken when sampling stops
    assert!(
        sampler.readings() <= at_return + 1,
        "sampling continued after cancel: {} -> {}",
        at_return,
        sampler.readings()
    );
}

#[tokio::test]
async fn test_three_connection_failures_raise_one_issue() {
    let factory = FakeFactory::new(
        FakeServer::new("down").on("initialize", Reply::Err(-32603, "database unavailable".into())),
    );
    let engine = engine_with(factory, None, Arc::new(NoSampler));

    for _ in 0..3 {
        let err = engine
            .run_suite(
                target("down"),
                &ProbeSelection::all(),
                &options(&engine),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            DoctorError::Connection { server, message } => {
                assert_eq!(server, "down");
                assert!(message.contains("database unavailable"));
            }
            other => panic!("expected connection error, got {other:?}"),
        }
    }

    let issues = engine.take_connection_issues();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].issue_type, IssueType::Connection);
    assert!(issues[0].severity >= 3);
    assert_eq!(issues[0].evidence.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_remediation_reconnects_once_server_is_back() {
    let factory = FakeFactory::new(FakeServer::new("bouncy"));
    let engine = engine_with(factory.clone(), None, Arc::new(NoSampler));

    factory.refuse(true);
    for _ in 0..3 {
        let _ = run_all(&engine, "bouncy").await;
    }
    let issue = engine.take_connection_issues().pop().unwrap();

    factory.refuse(false);
    let result = engine.remediate(&issue, &CancellationToken::new()).await;
    assert_eq!(result.status, RemediationStatus::Success);
    assert_eq!(result.actions_taken.len(), 1);
    assert!(result.actions_taken[0].validated);
    assert!(result.manual_steps.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_remediation_exhausts_with_backoff_while_server_stays_down() {
    let factory = FakeFactory::new(FakeServer::new("gone"));
    let engine = engine_with(factory.clone(), None, Arc::new(NoSampler));
    factory.refuse(true);
    for _ in 0..3 {
        let _ = run_all(&engine, "gone").await;
    }
    let issue = engine.take_connection_issues().pop().unwrap();

    let started = Instant::now();
    let result = engine.remediate(&issue, &CancellationToken::new()).await;
    let elapsed = started.elapsed();

    assert_eq!(result.status, RemediationStatus::Failed);
    // Two strategies, three attempts each
    assert_eq!(result.actions_taken.len(), 6);
    assert!(result.actions_taken.iter().all(|a| !a.validated));
    assert!(!result.manual_steps.is_empty());
    // 500ms + 1000ms of backoff per strategy
    assert_eq!(elapsed, Duration::from_millis(3000));
    assert_eq!(engine.remediation().history(Some(issue.id)).len(), 1);
}

async fn run_all(engine: &Engine, name: &str) -> mcp_doctor::Result<mcp_doctor::models::TestSuite> {
    engine
        .run_suite(
            target(name),
            &ProbeSelection::all(),
            &options(engine),
            CancellationToken::new(),
        )
        .await
}
