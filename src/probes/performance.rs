// Benchmark and load probes

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{ProbeContext, is_error_result, sample_arguments};
use crate::models::metrics::{GradeLimits, LoadObservations};
use crate::models::{
    Fault, LoadMode, PerfOperation, PerformanceMetrics, PerformanceProbe, ProbeSpec, RawOutcome,
    ResourceSample, Verdict,
};
use crate::transport::Session;

pub async fn run(probe: &PerformanceProbe, spec: &ProbeSpec, ctx: &ProbeContext) -> RawOutcome {
    let Some(request) = Request::resolve(&probe.operation, &ctx.session) else {
        return RawOutcome::not_applicable(format!(
            "server cannot serve {}",
            probe.operation.describe()
        ));
    };
    match probe.mode {
        LoadMode::Benchmark { iterations } => benchmark(request, iterations, spec, ctx).await,
        LoadMode::Load {
            concurrency,
            duration,
        } => load(request, concurrency, duration, spec, ctx).await,
    }
}

impl PerfOperation {
    fn describe(&self) -> String {
        match self {
            PerfOperation::Ping => "ping".to_string(),
            PerfOperation::ListTools => "tools/list".to_string(),
            PerfOperation::CallTool { tool, .. } => format!(
                "tools/call '{}'",
                tool.as_deref().unwrap_or("first listed tool")
            ),
        }
    }
}

/// The JSON-RPC call repeated by a performance probe.
#[derive(Debug, Clone)]
struct Request {
    method: &'static str,
    params: Option<Value>,
}

impl Request {
    fn resolve(operation: &PerfOperation, session: &Session) -> Option<Self> {
        match operation {
            PerfOperation::Ping => Some(Self {
                method: "ping",
                params: None,
            }),
            PerfOperation::ListTools => session.capabilities().tools.then_some(Self {
                method: "tools/list",
                params: None,
            }),
            PerfOperation::CallTool { tool, arguments } => {
                let discovery = session.discovery();
                let info = match tool {
                    Some(name) => discovery.tool(name)?,
                    None => discovery.tools.first()?,
                };
                let arguments = arguments
                    .clone()
                    .unwrap_or_else(|| sample_arguments(&info.input_schema));
                Some(Self {
                    method: "tools/call",
                    params: Some(json!({ "name": info.name, "arguments": arguments })),
                })
            }
        }
    }
}

/// What one worker (or the benchmark loop) saw.
#[derive(Debug, Default)]
struct Tally {
    latencies: Vec<Duration>,
    failures: u64,
    stderr: Vec<String>,
    lost: Option<String>,
}

impl Tally {
    fn record(&mut self, outcome: RawOutcome, session: &Session) {
        let ok = outcome.success
            && !outcome.payload.as_ref().is_some_and(is_error_result);
        if ok {
            self.latencies.push(outcome.latency);
        } else {
            self.failures += 1;
        }
        let crashed = matches!(
            outcome.fault,
            Some(Fault::Crash) | Some(Fault::ProtocolViolation)
        );
        if crashed && !session.is_connected() {
            self.lost = outcome.error_text.clone();
        }
        self.stderr.extend(outcome.stderr);
    }

    fn merge(&mut self, other: Tally) {
        self.latencies.extend(other.latencies);
        self.failures += other.failures;
        self.stderr.extend(other.stderr);
        if self.lost.is_none() {
            self.lost = other.lost;
        }
    }
}

fn operation_timeout(spec: &ProbeSpec, ctx: &ProbeContext) -> Duration {
    ctx.config.timeout().min(spec.timeout)
}

fn grade_limits(spec: &ProbeSpec, ctx: &ProbeContext) -> GradeLimits {
    GradeLimits {
        max_latency: spec.latency_threshold,
        min_success_rate: ctx.config.min_success_rate,
    }
}

fn process_ids(sessions: &[Arc<Session>]) -> Vec<u32> {
    sessions
        .iter()
        .filter_map(|s| s.process_id())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

// ============================================
// Benchmark
// ============================================

async fn benchmark(request: Request, iterations: u32, spec: &ProbeSpec, ctx: &ProbeContext) -> RawOutcome {
    let timeout = operation_timeout(spec, ctx);
    let pids = process_ids(std::slice::from_ref(&ctx.session));
    let started = Instant::now();
    let mut tally = Tally::default();
    let mut samples: Vec<ResourceSample> = ctx.sampler.sample(&pids).into_iter().collect();

    for _ in 0..iterations {
        if ctx.cancel.is_cancelled() {
            return RawOutcome::cancelled(started.elapsed());
        }
        let outcome = ctx
            .session
            .invoke(request.method, request.params.clone(), timeout)
            .await;
        tally.record(outcome, &ctx.session);
        samples.extend(ctx.sampler.sample(&pids));
        if tally.lost.is_some() {
            break;
        }
    }

    let observations = LoadObservations {
        latencies: std::mem::take(&mut tally.latencies),
        failures: tally.failures,
        elapsed: started.elapsed(),
        samples,
    };
    let metrics = PerformanceMetrics::compute(
        &spec.name,
        ctx.session.server(),
        1,
        &observations,
        ctx.config.warmup_samples,
        grade_limits(spec, ctx),
    );
    finish(metrics, tally, observations.elapsed, spec, ctx.config.min_success_rate)
}

// ============================================
// Load
// ============================================

async fn load(
    request: Request,
    concurrency: u32,
    window: Duration,
    spec: &ProbeSpec,
    ctx: &ProbeContext,
) -> RawOutcome {
    let workers = concurrency.min(ctx.config.max_workers).max(1) as usize;
    let timeout = operation_timeout(spec, ctx);
    let started = Instant::now();

    // One pipelined session carries every stream; otherwise each worker gets its own.
    let (sessions, owned, open_failures) = if ctx.session.supports_pipelining() || workers == 1 {
        (vec![ctx.session.clone()], Vec::new(), 0u64)
    } else {
        open_sessions(ctx, workers, timeout).await
    };
    tracing::info!(
        probe = %spec.name,
        server = %ctx.session.server(),
        workers,
        sessions = sessions.len(),
        open_failures,
        "Starting load window of {}s",
        window.as_secs()
    );

    // Aborting the probe drops this future; the guard stops the sampler with it
    let stop_sampling = ctx.cancel.child_token();
    let _sampling_guard = stop_sampling.clone().drop_guard();
    let sampling = {
        let sampler = ctx.sampler.clone();
        let pids = process_ids(&sessions);
        let interval = ctx.config.sample_interval();
        let stop = stop_sampling.clone();
        tokio::spawn(async move {
            let mut samples = Vec::new();
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => samples.extend(sampler.sample(&pids)),
                }
            }
            samples.extend(sampler.sample(&pids));
            samples
        })
    };

    let deadline = started + window;
    let mut tally = Tally {
        failures: open_failures,
        ..Tally::default()
    };
    if !sessions.is_empty() {
        let mut set = JoinSet::new();
        for worker in 0..workers {
            let session = sessions[worker % sessions.len()].clone();
            let request = request.clone();
            let cancel = ctx.cancel.clone();
            set.spawn(run_worker(session, request, timeout, deadline, cancel));
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(worker_tally) => tally.merge(worker_tally),
                Err(e) => {
                    tracing::warn!(probe = %spec.name, "Load worker failed: {}", e);
                    tally.failures += 1;
                }
            }
        }
    }
    let elapsed = started.elapsed();

    stop_sampling.cancel();
    let samples = sampling.await.unwrap_or_default();
    futures::future::join_all(owned.iter().map(|s| s.close())).await;

    if ctx.cancel.is_cancelled() {
        return RawOutcome::cancelled(elapsed);
    }

    let observations = LoadObservations {
        latencies: std::mem::take(&mut tally.latencies),
        failures: tally.failures,
        elapsed,
        samples,
    };
    let metrics = PerformanceMetrics::compute(
        &spec.name,
        ctx.session.server(),
        workers as u32,
        &observations,
        ctx.config.warmup_samples,
        grade_limits(spec, ctx),
    );
    finish(metrics, tally, elapsed, spec, ctx.config.min_success_rate)
}

/// Open `count` dedicated sessions. Returns (usable, owned, failed opens).
async fn open_sessions(
    ctx: &ProbeContext,
    count: usize,
    timeout: Duration,
) -> (Vec<Arc<Session>>, Vec<Arc<Session>>, u64) {
    let opened = futures::future::join_all(
        (0..count).map(|_| ctx.factory.open(&ctx.target, timeout)),
    )
    .await;
    let mut sessions = Vec::with_capacity(count);
    let mut failures = 0u64;
    for result in opened {
        match result {
            Ok(session) => sessions.push(Arc::new(session)),
            Err(e) => {
                tracing::warn!(server = %ctx.target.name, "Load session failed to open: {}", e);
                failures += 1;
            }
        }
    }
    (sessions.clone(), sessions, failures)
}

async fn run_worker(
    session: Arc<Session>,
    request: Request,
    timeout: Duration,
    deadline: Instant,
    cancel: CancellationToken,
) -> Tally {
    let mut tally = Tally::default();
    while Instant::now() < deadline {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = session.invoke(request.method, request.params.clone(), timeout) => outcome,
        };
        tally.record(outcome, &session);
        if tally.lost.is_some() {
            break;
        }
    }
    tally
}

// ============================================
// Verdict
// ============================================

fn finish(
    metrics: PerformanceMetrics,
    tally: Tally,
    elapsed: Duration,
    spec: &ProbeSpec,
    min_rate: f64,
) -> RawOutcome {
    let threshold_ms = spec.latency_threshold.as_secs_f64() * 1000.0;

    let (verdict, problem) = if metrics.total_operations == 0 {
        (Verdict::Mismatch, Some("performance: no operations completed".to_string()))
    } else if metrics.success_rate() < min_rate {
        (
            Verdict::Mismatch,
            Some(format!(
                "performance: success rate {:.1}% below {:.1}%",
                metrics.success_rate() * 100.0,
                min_rate * 100.0
            )),
        )
    } else if metrics.memory_leak_detected {
        (
            Verdict::Partial,
            Some(format!(
                "memory leak detected: growth {:.2} over {} samples",
                metrics.memory_growth, metrics.sample_count
            )),
        )
    } else if metrics.p95_latency_ms > threshold_ms {
        (
            Verdict::Partial,
            Some(format!(
                "performance: p95 latency {:.0}ms exceeds {:.0}ms",
                metrics.p95_latency_ms, threshold_ms
            )),
        )
    } else if metrics.failed_operations > 0 {
        (
            Verdict::Partial,
            Some(format!(
                "performance: {} of {} operations failed",
                metrics.failed_operations, metrics.total_operations
            )),
        )
    } else {
        (Verdict::Exact, None)
    };

    let mut outcome = match &tally.lost {
        Some(reason) => RawOutcome::fault(
            Fault::Crash,
            elapsed,
            format!("session lost during {}: {}", spec.name, reason),
        ),
        None => {
            let payload = serde_json::to_value(&metrics).unwrap_or(Value::Null);
            let mut outcome = RawOutcome::success(elapsed, payload).with_verdict(verdict);
            outcome.success = metrics.successful_operations > 0;
            outcome.error_text = problem;
            outcome
        }
    };
    outcome.latency = Duration::from_secs_f64(metrics.avg_latency_ms / 1000.0);
    outcome.stderr = tally.stderr;
    outcome.sub_metrics.extend([
        ("throughput".to_string(), metrics.throughput),
        ("avg_latency_ms".to_string(), metrics.avg_latency_ms),
        ("p95_latency_ms".to_string(), metrics.p95_latency_ms),
        ("p99_latency_ms".to_string(), metrics.p99_latency_ms),
        ("error_rate".to_string(), metrics.error_rate),
        ("memory_growth".to_string(), metrics.memory_growth),
        ("peak_cpu_percent".to_string(), f64::from(metrics.peak_cpu_percent)),
    ]);
    outcome.note = Some(format!(
        "grade {:?}, {:.1} ops/s, p95 {:.0}ms",
        metrics.grade, metrics.throughput, metrics.p95_latency_ms
    ));
    outcome.performance = Some(metrics);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Grade, ProbeKind};

    fn metrics(latencies_ms: &[u64], failures: u64, memory: &[u64]) -> PerformanceMetrics {
        let observations = LoadObservations {
            latencies: latencies_ms.iter().map(|&ms| Duration::from_millis(ms)).collect(),
            failures,
            elapsed: Duration::from_secs(1),
            samples: memory
                .iter()
                .map(|&memory_bytes| ResourceSample {
                    memory_bytes,
                    cpu_percent: 1.0,
                })
                .collect(),
        };
        PerformanceMetrics::compute(
            "load",
            "srv",
            2,
            &observations,
            1,
            GradeLimits {
                max_latency: Duration::from_millis(2000),
                min_success_rate: 0.95,
            },
        )
    }

    fn spec() -> ProbeSpec {
        ProbeSpec::new(
            "load",
            Duration::from_secs(60),
            ProbeKind::Performance(PerformanceProbe {
                operation: PerfOperation::Ping,
                mode: LoadMode::Load {
                    concurrency: 2,
                    duration: Duration::from_secs(10),
                },
            }),
        )
    }

    fn verdict_of(metrics: PerformanceMetrics) -> RawOutcome {
        finish(metrics, Tally::default(), Duration::from_secs(1), &spec(), 0.95)
    }

    #[test]
    fn test_clean_run_is_exact() {
        let outcome = verdict_of(metrics(&[10, 12, 11, 9], 0, &[100, 100, 100]));
        assert_eq!(outcome.verdict, Verdict::Exact);
        assert!(outcome.error_text.is_none());
        assert_eq!(outcome.performance.as_ref().map(|m| m.grade), Some(Grade::A));
        assert!(outcome.latency > Duration::from_millis(10));
    }

    #[test]
    fn test_leak_is_partial() {
        let outcome = verdict_of(metrics(&[10, 10, 10], 0, &[900, 100, 200, 300, 400]));
        assert_eq!(outcome.verdict, Verdict::Partial);
        assert!(outcome.error_text.unwrap().contains("memory leak detected"));
    }

    #[test]
    fn test_low_success_rate_is_mismatch() {
        let outcome = verdict_of(metrics(&[10, 10], 8, &[]));
        assert_eq!(outcome.verdict, Verdict::Mismatch);
        assert!(outcome.error_text.unwrap().contains("success rate"));
    }

    #[test]
    fn test_no_operations_is_mismatch() {
        let outcome = verdict_of(metrics(&[], 0, &[]));
        assert_eq!(outcome.verdict, Verdict::Mismatch);
        assert!(!outcome.success);
    }

    #[test]
    fn test_lost_session_is_crash() {
        let tally = Tally {
            lost: Some("process exited".into()),
            ..Tally::default()
        };
        let outcome = finish(metrics(&[10], 1, &[]), tally, Duration::from_secs(1), &spec(), 0.95);
        assert!(outcome.is_fault(Fault::Crash));
        assert!(outcome.performance.is_some());
    }
}
