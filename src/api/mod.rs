// ============================================
// Engine
// ============================================
//
// Caller-facing entry point. Owns the probe catalog, orchestrator, issue
// detector, remediation engine and the optional result store, and wires
// them together: run a suite, detect issues, remediate them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::db::{ResultStore, SqliteStore, StoreRecord, WriteBuffer, WriteBufferHandle};
use crate::detector::{IssueDetector, IssuePattern, PatternRegistry};
use crate::error::{DoctorError, Result};
use crate::models::{
    Issue, IssueCategories, LoadMode, PerformanceMetrics, ProbeKind, ProbeSelection, ProbeSpec,
    RemediationResult, Strategy, Target, TestStatus, TestSuite,
};
use crate::orchestrator::{Orchestrator, SuiteOptions};
use crate::probes::{ProbeCatalog, ResourceSampler, SysinfoSampler};
use crate::remediation::{RemediationContext, RemediationEngine};
use crate::transport::{SessionFactory, TransportFactory};

/// Probe re-run when an issue names no probe of its own
const FALLBACK_VALIDATION_PROBE: &str = "connectivity";

/// Upper bound on the timeout multiplier applied by IncreaseTimeout
const MAX_TIMEOUT_SCALE: u32 = 8;

/// Upper bound on the concurrency divisor applied by ReduceConcurrency
const MAX_CONCURRENCY_DIVISOR: u32 = 64;

/// Everything one `diagnose` call produced.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnosis {
    pub suite: TestSuite,
    pub issues: Vec<Issue>,
    pub categories: IssueCategories,
    pub remediations: Vec<RemediationResult>,
}

// ============================================
// Builder
// ============================================

pub struct EngineBuilder {
    config: EngineConfig,
    factory: Option<Arc<dyn SessionFactory>>,
    sampler: Option<Arc<dyn ResourceSampler>>,
    store: Option<Arc<dyn ResultStore>>,
    catalog: Option<ProbeCatalog>,
    patterns: Vec<IssuePattern>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            factory: None,
            sampler: None,
            store: None,
            catalog: None,
            patterns: Vec::new(),
        }
    }

    pub fn factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn sampler(mut self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Persist suites, issues and remediation results through a write buffer.
    pub fn store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the standard catalog.
    pub fn catalog(mut self, catalog: ProbeCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Register a custom pattern next to the built-in ones.
    pub fn pattern(mut self, pattern: IssuePattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    /// Validate the configuration and assemble the engine. Must be called
    /// inside a tokio runtime when a store is set.
    pub fn build(self) -> Result<Engine> {
        self.config.check()?;
        let config = Arc::new(self.config);

        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(TransportFactory::new(config.teardown_grace())));
        let sampler = self
            .sampler
            .unwrap_or_else(|| Arc::new(SysinfoSampler::new()));
        let catalog = self
            .catalog
            .unwrap_or_else(|| ProbeCatalog::standard(&config));

        let registry = PatternRegistry::builtin();
        for pattern in self.patterns {
            registry.insert(pattern)?;
        }
        let detector = IssueDetector::new(registry, config.monitoring_window());

        let write_buffer = self.store.as_ref().map(|store| WriteBuffer::spawn(store.clone()));
        let mut orchestrator = Orchestrator::new(config.clone(), factory.clone(), sampler);
        let mut remediation = RemediationEngine::new(config.remediation.clone());
        if let Some(write_buffer) = &write_buffer {
            orchestrator = orchestrator.with_write_buffer(write_buffer.clone());
            remediation = remediation.with_write_buffer(write_buffer.clone());
        }

        tracing::info!(
            probes = catalog.len(),
            patterns = detector.registry().list().len(),
            persistent = write_buffer.is_some(),
            "Engine ready"
        );

        Ok(Engine {
            config,
            catalog,
            orchestrator,
            detector,
            remediation,
            factory,
            store: self.store,
            write_buffer,
            targets: RwLock::new(HashMap::new()),
            connection_issues: Mutex::new(Vec::new()),
        })
    }
}

// ============================================
// Engine
// ============================================

pub struct Engine {
    config: Arc<EngineConfig>,
    catalog: ProbeCatalog,
    orchestrator: Orchestrator,
    detector: IssueDetector,
    remediation: RemediationEngine,
    factory: Arc<dyn SessionFactory>,
    store: Option<Arc<dyn ResultStore>>,
    write_buffer: Option<WriteBufferHandle>,
    /// Targets seen by `run_suite`, by server name, for remediation
    targets: RwLock<HashMap<String, Arc<Target>>>,
    /// Connection issues raised by failed suite starts, not yet collected
    connection_issues: Mutex<Vec<Issue>>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Real transports backed by the SQLite store at `config.database_url`.
    pub async fn from_config(config: EngineConfig) -> Result<Self> {
        config.check()?;
        let store = SqliteStore::connect(&config.database_url).await?;
        tracing::info!("Connected to result store");

        let purged = store.purge_older_than(config.retention_days).await?;
        if purged > 0 {
            tracing::info!(
                "Purged {} records older than {} days",
                purged,
                config.retention_days
            );
        }
        EngineBuilder::new(config).store(Arc::new(store)).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &ProbeCatalog {
        &self.catalog
    }

    pub fn detector(&self) -> &IssueDetector {
        &self.detector
    }

    pub fn remediation(&self) -> &RemediationEngine {
        &self.remediation
    }

    pub fn store(&self) -> Option<&Arc<dyn ResultStore>> {
        self.store.as_ref()
    }

    /// Run the selected probes against `target`.
    ///
    /// Connection failures feed the per-server failure window; the
    /// Connection issue it may raise is persisted and kept for
    /// `take_connection_issues`.
    pub async fn run_suite(
        &self,
        target: Target,
        selection: &ProbeSelection,
        options: &SuiteOptions,
        cancel: CancellationToken,
    ) -> Result<TestSuite> {
        let specs = self.catalog.select(selection)?;
        let target = Arc::new(target);
        self.targets
            .write()
            .insert(target.name.clone(), target.clone());

        match self
            .orchestrator
            .run_suite(target.clone(), &specs, options, cancel)
            .await
        {
            Ok(suite) => {
                self.detector.observe_connection(&target.name, true, "");
                Ok(suite)
            }
            Err(err @ DoctorError::Connection { .. }) => {
                if let Some(issue) =
                    self.detector
                        .observe_connection(&target.name, false, &err.to_string())
                {
                    self.persist_issue(&issue);
                    self.connection_issues.lock().push(issue);
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Issues found in a sealed suite and the given metrics.
    pub fn detect_issues(&self, suite: &TestSuite, metrics: &[PerformanceMetrics]) -> Vec<Issue> {
        let issues = self.detector.analyze(suite, metrics);
        for issue in &issues {
            self.persist_issue(issue);
        }
        issues
    }

    pub fn categorize(&self, issues: &[Issue]) -> IssueCategories {
        self.detector.categorize(issues)
    }

    /// Connection issues raised since the last call.
    pub fn take_connection_issues(&self) -> Vec<Issue> {
        std::mem::take(&mut *self.connection_issues.lock())
    }

    /// Try the issue's strategies against the live server it came from.
    pub async fn remediate(&self, issue: &Issue, cancel: &CancellationToken) -> RemediationResult {
        let target = self.targets.read().get(&issue.server).cloned();
        let Some(target) = target else {
            return self.remediation.unresolvable(
                issue,
                &format!("Server '{}' has not been run by this engine", issue.server),
            );
        };
        let ctx = LiveContext::new(self, target, cancel.clone());
        self.remediation.remediate(issue, &ctx, cancel).await
    }

    /// Run, detect and, when `auto_remediate` is set, remediate.
    pub async fn diagnose(
        &self,
        target: Target,
        selection: &ProbeSelection,
        cancel: CancellationToken,
    ) -> Result<Diagnosis> {
        let options = SuiteOptions::from_config(&self.config);
        let suite = self
            .run_suite(target, selection, &options, cancel.clone())
            .await?;
        let issues = self.detect_issues(&suite, &suite.metrics);
        let categories = self.categorize(&issues);

        let mut remediations = Vec::new();
        if self.config.auto_remediate {
            for issue in &issues {
                if cancel.is_cancelled() {
                    tracing::warn!("Cancelled, skipping remaining remediations");
                    break;
                }
                remediations.push(self.remediate(issue, &cancel).await);
            }
        }

        Ok(Diagnosis {
            suite,
            issues,
            categories,
            remediations,
        })
    }

    /// Flush pending store writes. Returns how many records are still unwritten.
    pub async fn shutdown(&self) -> Result<usize> {
        match &self.write_buffer {
            Some(write_buffer) => {
                let pending = write_buffer.flush().await?;
                if pending > 0 {
                    tracing::warn!("{} records were not persisted", pending);
                }
                Ok(pending)
            }
            None => Ok(0),
        }
    }

    fn persist_issue(&self, issue: &Issue) {
        if let Some(write_buffer) = &self.write_buffer {
            write_buffer.queue(StoreRecord::Issue(issue.clone()));
        }
    }
}

// ============================================
// Live Remediation Context
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tuning {
    timeout_scale: u32,
    concurrency_divisor: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            timeout_scale: 1,
            concurrency_divisor: 1,
        }
    }
}

/// Applies strategies to the real server and validates by re-running the
/// issue's probes with the accumulated tuning.
struct LiveContext<'a> {
    engine: &'a Engine,
    target: Arc<Target>,
    tuning: Mutex<Tuning>,
    cancel: CancellationToken,
}

impl<'a> LiveContext<'a> {
    fn new(engine: &'a Engine, target: Arc<Target>, cancel: CancellationToken) -> Self {
        Self {
            engine,
            target,
            tuning: Mutex::new(Tuning::default()),
            cancel,
        }
    }

    fn timeout(&self) -> Duration {
        self.engine.config.timeout() * self.tuning.lock().timeout_scale
    }

    fn tuned(&self, spec: &ProbeSpec) -> ProbeSpec {
        let tuning = *self.tuning.lock();
        let mut spec = spec.clone();
        spec.timeout *= tuning.timeout_scale;
        if let ProbeKind::Performance(perf) = &mut spec.kind {
            if let LoadMode::Load { concurrency, .. } = &mut perf.mode {
                *concurrency = (*concurrency / tuning.concurrency_divisor).max(1);
            }
        }
        spec
    }

    fn validation_specs(&self, issue: &Issue) -> Vec<Arc<ProbeSpec>> {
        let catalog = &self.engine.catalog;
        let mut specs: Vec<_> = issue
            .probes()
            .iter()
            .filter_map(|name| catalog.get(name))
            .collect();
        if specs.is_empty() {
            specs.extend(catalog.get(FALLBACK_VALIDATION_PROBE));
        }
        specs.iter().map(|spec| Arc::new(self.tuned(spec))).collect()
    }
}

#[async_trait]
impl RemediationContext for LiveContext<'_> {
    async fn apply(&self, issue: &Issue, strategy: Strategy) -> Result<()> {
        let factory = &self.engine.factory;
        match strategy {
            Strategy::Reconnect => {
                let session = factory.open(&self.target, self.timeout()).await?;
                session.close().await;
            }
            Strategy::RestartProcess => {
                let session = factory.open(&self.target, self.timeout()).await?;
                session.terminate().await;
                let session = factory.open(&self.target, self.timeout()).await?;
                session.close().await;
            }
            Strategy::ClearCache => {
                let session = factory.open(&self.target, self.timeout()).await?;
                let refreshed = session.refresh_discovery(self.timeout()).await;
                session.close().await;
                let discovery = refreshed?;
                tracing::debug!(
                    server = %issue.server,
                    tools = discovery.tools.len(),
                    "Discovery cache refreshed"
                );
            }
            Strategy::ReduceConcurrency => {
                let mut tuning = self.tuning.lock();
                tuning.concurrency_divisor =
                    (tuning.concurrency_divisor * 2).min(MAX_CONCURRENCY_DIVISOR);
            }
            Strategy::IncreaseTimeout => {
                let mut tuning = self.tuning.lock();
                tuning.timeout_scale = (tuning.timeout_scale * 2).min(MAX_TIMEOUT_SCALE);
            }
            Strategy::ResetToDefaults => {
                *self.tuning.lock() = Tuning::default();
            }
        }
        let tuning = *self.tuning.lock();
        tracing::debug!(
            server = %issue.server,
            strategy = strategy.as_str(),
            ?tuning,
            "Strategy applied"
        );
        Ok(())
    }

    async fn validate(&self, issue: &Issue) -> Result<bool> {
        let specs = self.validation_specs(issue);
        if specs.is_empty() {
            return Err(DoctorError::Validation(format!(
                "no probe available to validate issue {}",
                issue.id
            )));
        }
        let mut options = SuiteOptions::from_config(&self.engine.config)
            .named(format!("remediation-{}", issue.id));
        options.fail_fast = false;
        options.persist = false;

        let suite = match self
            .engine
            .orchestrator
            .run_suite(self.target.clone(), &specs, &options, self.cancel.child_token())
            .await
        {
            Ok(suite) => suite,
            Err(DoctorError::Connection { message, .. }) => {
                tracing::debug!(server = %issue.server, "Validation could not connect: {}", message);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        Ok(!suite.results.is_empty()
            && suite
                .results
                .iter()
                .all(|r| matches!(r.status, TestStatus::Passed | TestStatus::Skipped)))
    }
}
