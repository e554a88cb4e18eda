// ============================================
// Test Orchestrator
// ============================================
//
// Runs a selection of probes against one target and seals the results into
// a TestSuite. Suite lifecycle: Pending -> Running -> {Completed, Aborted}.
//
// - Functional and security probes run one at a time on the suite's session,
//   in submission order.
// - Performance probes run afterwards, concurrently, each holding as many
//   worker permits as it drives connections.
// - Every probe runs in its own task under min(probe timeout, remaining
//   suite time); a timeout, panic or cancellation becomes an outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::db::{StoreRecord, WriteBufferHandle};
use crate::error::{DoctorError, Result};
use crate::models::{
    Fault, LoadMode, PerformanceMetrics, ProbeCategory, ProbeKind, ProbeSpec, RawOutcome,
    SuiteBuilder, SuiteState, Target, TestResult, TestStatus, TestSuite,
};
use crate::probes::{self, ProbeContext, ResourceSampler};
use crate::scoring::Scorer;
use crate::transport::{Session, SessionFactory};

/// Per-run knobs, defaulting to the engine configuration.
#[derive(Debug, Clone)]
pub struct SuiteOptions {
    pub name: String,
    pub fail_fast: bool,
    pub suite_timeout: Duration,
    /// Times a lost session may be reopened during the run
    pub retries: u32,
    /// Queue the sealed suite for the result store
    pub persist: bool,
}

impl SuiteOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            name: "diagnostics".to_string(),
            fail_fast: config.fail_fast,
            suite_timeout: config.suite_timeout(),
            retries: config.retries,
            persist: true,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Why the run stopped scheduling probes early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    FailFast,
    Cancelled,
    SuiteTimeout,
}

pub struct Orchestrator {
    config: Arc<EngineConfig>,
    scorer: Scorer,
    factory: Arc<dyn SessionFactory>,
    sampler: Arc<dyn ResourceSampler>,
    write_buffer: Option<WriteBufferHandle>,
    /// Orchestrator-wide cap on load workers
    workers: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<EngineConfig>,
        factory: Arc<dyn SessionFactory>,
        sampler: Arc<dyn ResourceSampler>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_workers.max(1) as usize));
        Self {
            scorer: Scorer::from_config(&config),
            config,
            factory,
            sampler,
            write_buffer: None,
            workers,
        }
    }

    /// Queue every sealed suite for persistence.
    pub fn with_write_buffer(mut self, write_buffer: WriteBufferHandle) -> Self {
        self.write_buffer = Some(write_buffer);
        self
    }

    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    /// Run `specs` against `target`.
    ///
    /// Fails only on invalid specs (before any session is opened), when the
    /// first session cannot be established, or when cancelled before the
    /// session is up. Everything after that ends in a sealed suite.
    pub async fn run_suite(
        &self,
        target: Arc<Target>,
        specs: &[Arc<ProbeSpec>],
        options: &SuiteOptions,
        cancel: CancellationToken,
    ) -> Result<TestSuite> {
        for spec in specs {
            spec.validate()?;
        }
        if options.suite_timeout.is_zero() {
            return Err(DoctorError::Validation("suite timeout must be non-zero".into()));
        }

        let started = Instant::now();
        let deadline = started + options.suite_timeout;
        let mut builder = SuiteBuilder::new(&options.name, &target.name);
        tracing::info!(
            suite = %builder.id(),
            server = %target.name,
            probes = specs.len(),
            state = SuiteState::Pending.as_str(),
            "Suite scheduled"
        );

        let session = tokio::select! {
            opened = self.factory.open(&target, self.config.timeout()) => opened?,
            _ = cancel.cancelled() => return Err(DoctorError::Cancelled),
        };
        let mut session = Arc::new(session);
        tracing::info!(
            suite = %builder.id(),
            server = %target.name,
            state = SuiteState::Running.as_str(),
            "Suite running"
        );

        let mut reopens = 0u32;
        let mut halt: Option<Halt> = None;
        let (sequential, concurrent): (Vec<_>, Vec<_>) = specs
            .iter()
            .cloned()
            .partition(|spec| spec.category() != ProbeCategory::Performance);

        for spec in &sequential {
            if halt.is_none() {
                halt = self.check_halt(deadline, &cancel);
            }
            if let Some(reason) = halt {
                self.record_unstarted(&mut builder, spec, &target.name, reason);
                continue;
            }

            if !session.is_connected() && reopens < options.retries {
                reopens += 1;
                session = self.reopen(&target, session, reopens).await;
            }

            let ctx = self.context(&session, &target, &cancel);
            let outcome = run_probe(spec.clone(), ctx, deadline, &cancel).await;
            let cancelled = outcome.is_fault(Fault::Cancelled);
            let result = self.scorer.score(spec, &target.name, &outcome);
            log_result(&result);
            if result.status == TestStatus::Passed && session.mark_ready() {
                tracing::info!(server = %target.name, probe = %spec.name, "Degraded session revalidated");
            }
            let failed_hard = result.status == TestStatus::Error;
            builder.push(result);

            if cancelled {
                halt = Some(Halt::Cancelled);
            } else if failed_hard && options.fail_fast {
                tracing::warn!(
                    suite = %builder.id(),
                    probe = %spec.name,
                    "Probe errored with fail_fast set, aborting suite"
                );
                halt = Some(Halt::FailFast);
            }
        }

        if halt.is_none() && !concurrent.is_empty() {
            if !session.is_connected() && reopens < options.retries {
                session = self.reopen(&target, session, reopens + 1).await;
            }
            let results = self
                .run_concurrent(&concurrent, &session, &target, deadline, &cancel)
                .await;
            for (result, metrics) in results {
                if let Some(metrics) = metrics {
                    builder.push_metrics(metrics);
                }
                if options.fail_fast && result.status == TestStatus::Error {
                    halt = Some(Halt::FailFast);
                }
                builder.push(result);
            }
            if cancel.is_cancelled() {
                halt = Some(Halt::Cancelled);
            }
        } else if let Some(reason) = halt {
            for spec in &concurrent {
                self.record_unstarted(&mut builder, spec, &target.name, reason);
            }
        }

        session.close().await;

        let state = match halt {
            Some(Halt::FailFast) | Some(Halt::Cancelled) => SuiteState::Aborted,
            Some(Halt::SuiteTimeout) | None => SuiteState::Completed,
        };
        let suite = builder.seal(state, started.elapsed());
        tracing::info!(
            suite = %suite.id,
            server = %suite.server,
            state = suite.state.as_str(),
            results = suite.results.len(),
            passed = suite.count(TestStatus::Passed),
            failed = suite.count(TestStatus::Failed),
            errors = suite.count(TestStatus::Error),
            "Suite sealed in {}ms (aggregate confidence {:.1})",
            suite.total_duration.as_millis(),
            suite.aggregate_confidence
        );

        if let Some(write_buffer) = self.write_buffer.as_ref().filter(|_| options.persist) {
            if let Err(e) = write_buffer
                .queue_blocking(StoreRecord::Suite(suite.clone()))
                .await
            {
                tracing::error!(suite = %suite.id, "Failed to queue suite for persistence: {}", e);
            }
        }
        Ok(suite)
    }

    fn check_halt(&self, deadline: Instant, cancel: &CancellationToken) -> Option<Halt> {
        if cancel.is_cancelled() {
            Some(Halt::Cancelled)
        } else if Instant::now() >= deadline {
            Some(Halt::SuiteTimeout)
        } else {
            None
        }
    }

    /// Unstarted probes are dropped on abort and recorded as timed out when
    /// the suite ran out of time.
    fn record_unstarted(
        &self,
        builder: &mut SuiteBuilder,
        spec: &ProbeSpec,
        server: &str,
        reason: Halt,
    ) {
        if reason != Halt::SuiteTimeout {
            tracing::debug!(probe = %spec.name, ?reason, "Probe not started");
            return;
        }
        let mut outcome = RawOutcome::fault(
            Fault::Timeout,
            Duration::ZERO,
            "suite timeout elapsed before the probe started",
        );
        outcome.latency = Duration::ZERO;
        let result = self.scorer.score(spec, server, &outcome);
        log_result(&result);
        builder.push(result);
    }

    fn context(
        &self,
        session: &Arc<Session>,
        target: &Arc<Target>,
        cancel: &CancellationToken,
    ) -> ProbeContext {
        ProbeContext {
            session: session.clone(),
            target: target.clone(),
            factory: self.factory.clone(),
            sampler: self.sampler.clone(),
            config: self.config.clone(),
            cancel: cancel.child_token(),
        }
    }

    /// Replace a lost session. Keeps the old one when reopening fails so the
    /// remaining probes record the loss themselves.
    async fn reopen(&self, target: &Target, lost: Arc<Session>, attempt: u32) -> Arc<Session> {
        tracing::warn!(server = %target.name, attempt, "Session lost, reopening");
        lost.terminate().await;
        match self.factory.open(target, self.config.timeout()).await {
            Ok(session) => Arc::new(session),
            Err(e) => {
                tracing::error!(server = %target.name, "Reopening session failed: {}", e);
                lost
            }
        }
    }

    async fn run_concurrent(
        &self,
        specs: &[Arc<ProbeSpec>],
        session: &Arc<Session>,
        target: &Arc<Target>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Vec<(TestResult, Option<PerformanceMetrics>)> {
        let mut set = JoinSet::new();
        for (index, spec) in specs.iter().enumerate() {
            let permits = self.permits_for(spec);
            let workers = self.workers.clone();
            let ctx = self.context(session, target, cancel);
            let spec = spec.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let _permits = tokio::select! {
                    acquired = workers.acquire_many_owned(permits) => acquired.ok(),
                    _ = cancel.cancelled() => None,
                };
                if cancel.is_cancelled() {
                    return (index, spec, RawOutcome::cancelled(Duration::ZERO));
                }
                let outcome = run_probe(spec.clone(), ctx, deadline, &cancel).await;
                (index, spec, outcome)
            });
        }

        let mut finished = Vec::with_capacity(specs.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, spec, outcome)) => {
                    let result = self.scorer.score(&spec, &target.name, &outcome);
                    log_result(&result);
                    finished.push((index, result, outcome.performance));
                }
                Err(e) => tracing::error!("Performance probe task failed: {}", e),
            }
        }
        finished.sort_by_key(|(index, _, _)| *index);
        finished
            .into_iter()
            .map(|(_, result, metrics)| (result, metrics))
            .collect()
    }

    fn permits_for(&self, spec: &ProbeSpec) -> u32 {
        match &spec.kind {
            ProbeKind::Performance(perf) => match perf.mode {
                LoadMode::Load { concurrency, .. } => {
                    concurrency.min(self.config.max_workers).max(1)
                }
                LoadMode::Benchmark { .. } => 1,
            },
            _ => 1,
        }
    }
}

/// Run one probe in its own task, bounded by its timeout, the suite deadline
/// and the cancellation token.
async fn run_probe(
    spec: Arc<ProbeSpec>,
    ctx: ProbeContext,
    deadline: Instant,
    cancel: &CancellationToken,
) -> RawOutcome {
    let limit = spec
        .timeout
        .min(deadline.saturating_duration_since(Instant::now()));
    let probe_cancel = ctx.cancel.clone();
    let started = Instant::now();
    tracing::debug!(probe = %spec.name, limit_ms = limit.as_millis() as u64, "Probe started");

    let mut handle = tokio::spawn(probes::execute(spec.clone(), ctx));
    tokio::select! {
        joined = &mut handle => match joined {
            Ok(outcome) => outcome,
            Err(e) => join_failure(&spec.name, e, started.elapsed()),
        },
        _ = tokio::time::sleep(limit) => {
            probe_cancel.cancel();
            handle.abort();
            tracing::warn!(probe = %spec.name, "Probe timed out after {}ms", limit.as_millis());
            RawOutcome::timed_out(started.elapsed(), limit)
        }
        _ = cancel.cancelled() => {
            probe_cancel.cancel();
            handle.abort();
            tracing::info!(probe = %spec.name, "Probe cancelled");
            RawOutcome::cancelled(started.elapsed())
        }
    }
}

fn join_failure(probe: &str, err: JoinError, elapsed: Duration) -> RawOutcome {
    if !err.is_panic() {
        return RawOutcome::cancelled(elapsed);
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!(probe = %probe, "Probe panicked: {}", message);
    RawOutcome::fault(Fault::Panic, elapsed, format!("probe panicked: {message}"))
}

fn log_result(result: &TestResult) {
    tracing::info!(
        probe = %result.probe,
        status = result.status.as_str(),
        confidence = result.confidence,
        "Probe finished in {}ms",
        result.duration.as_millis()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FunctionalProbe, PerfOperation, PerformanceProbe};

    struct NoSessions;

    #[async_trait::async_trait]
    impl SessionFactory for NoSessions {
        async fn open(&self, target: &Target, _timeout: Duration) -> Result<Session> {
            Err(DoctorError::connection(&target.name, "spawn failed: No such file or directory"))
        }
    }

    struct NoSampler;

    impl ResourceSampler for NoSampler {
        fn sample(&self, _pids: &[u32]) -> Option<crate::models::ResourceSample> {
            None
        }
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            Arc::new(EngineConfig::default()),
            Arc::new(NoSessions),
            Arc::new(NoSampler),
        )
    }

    fn target() -> Arc<Target> {
        Arc::new(Target::stdio("weather", "weather-server", Vec::new()))
    }

    #[tokio::test]
    async fn test_invalid_spec_rejected_before_connecting() {
        let bad = Arc::new(ProbeSpec::new(
            "ping",
            Duration::ZERO,
            ProbeKind::Functional(FunctionalProbe::Ping),
        ));
        let options = SuiteOptions::from_config(&EngineConfig::default());
        let err = orchestrator()
            .run_suite(target(), &[bad], &options, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DoctorError::Validation(_)));
    }

    #[tokio::test]
    async fn test_connection_failure_propagates() {
        let ping = Arc::new(ProbeSpec::new(
            "ping",
            Duration::from_secs(5),
            ProbeKind::Functional(FunctionalProbe::Ping),
        ));
        let options = SuiteOptions::from_config(&EngineConfig::default());
        let err = orchestrator()
            .run_suite(target(), &[ping], &options, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DoctorError::Connection { .. }));
    }

    #[test]
    fn test_load_permits_capped_by_max_workers() {
        let orchestrator = orchestrator();
        let load = ProbeSpec::new(
            "load",
            Duration::from_secs(90),
            ProbeKind::Performance(PerformanceProbe {
                operation: PerfOperation::Ping,
                mode: LoadMode::Load {
                    concurrency: 500,
                    duration: Duration::from_secs(60),
                },
            }),
        );
        assert_eq!(orchestrator.permits_for(&load), 16);
        let ping = ProbeSpec::new(
            "ping",
            Duration::from_secs(5),
            ProbeKind::Functional(FunctionalProbe::Ping),
        );
        assert_eq!(orchestrator.permits_for(&ping), 1);
    }

    #[tokio::test]
    async fn test_panicking_task_becomes_panic_fault() {
        let handle = tokio::spawn(async {
            panic!("index out of bounds");
        });
        let err = handle.await.unwrap_err();
        let outcome = join_failure("ping", err, Duration::from_millis(1));
        assert!(outcome.is_fault(Fault::Panic));
        assert_eq!(
            outcome.error_text.as_deref(),
            Some("probe panicked: index out of bounds")
        );
    }
}
