use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One resource reading of the target process(es).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

/// Latency, throughput and resource statistics of one performance probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub probe: String,
    pub server: String,
    pub concurrency: u32,
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    /// Successful operations per second
    pub throughput: f64,
    /// Failed / total, 0..=1
    pub error_rate: f64,
    pub peak_memory_bytes: u64,
    pub avg_memory_bytes: u64,
    pub peak_cpu_percent: f32,
    pub avg_cpu_percent: f32,
    /// Least-squares slope over the window relative to mean memory
    pub memory_growth: f64,
    pub memory_leak_detected: bool,
    pub sample_count: usize,
    pub grade: Grade,
    pub bottlenecks: Vec<String>,
}

/// Raw observations collected by a performance probe.
#[derive(Debug, Clone, Default)]
pub struct LoadObservations {
    pub latencies: Vec<Duration>,
    pub failures: u64,
    pub elapsed: Duration,
    pub samples: Vec<ResourceSample>,
}

/// Thresholds used for grading.
#[derive(Debug, Clone, Copy)]
pub struct GradeLimits {
    pub max_latency: Duration,
    pub min_success_rate: f64,
}

/// Nearest-rank style percentile on a sorted slice: `sorted[floor(q * n)]`.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((q * sorted.len() as f64) as usize).min(sorted.len() - 1);
    sorted[index]
}

/// Memory strictly increasing across every sample after the warm-up.
pub fn detect_leak(samples: &[ResourceSample], warmup: usize) -> bool {
    let steady: Vec<u64> = samples
        .iter()
        .skip(warmup)
        .map(|s| s.memory_bytes)
        .collect();
    steady.len() >= 3 && steady.windows(2).all(|pair| pair[1] > pair[0])
}

/// Slope of a least-squares fit times sample count, relative to the mean.
pub fn memory_growth(samples: &[ResourceSample]) -> f64 {
    let n = samples.len();
    if n < 2 {
        return 0.0;
    }
    let ys: Vec<f64> = samples.iter().map(|s| s.memory_bytes as f64).collect();
    let n_f = n as f64;
    let mean_x = (n_f - 1.0) / 2.0;
    let mean_y = ys.iter().sum::<f64>() / n_f;
    if mean_y <= 0.0 {
        return 0.0;
    }
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, y) in ys.iter().enumerate() {
        let dx = i as f64 - mean_x;
        numerator += dx * (y - mean_y);
        denominator += dx * dx;
    }
    if denominator == 0.0 {
        return 0.0;
    }
    (numerator / denominator) * n_f / mean_y
}

impl PerformanceMetrics {
    pub fn compute(
        probe: &str,
        server: &str,
        concurrency: u32,
        observations: &LoadObservations,
        warmup: usize,
        limits: GradeLimits,
    ) -> Self {
        let mut millis: Vec<f64> = observations
            .latencies
            .iter()
            .map(|d| d.as_secs_f64() * 1000.0)
            .collect();
        millis.sort_by(|a, b| a.total_cmp(b));

        let successes = millis.len() as u64;
        let total = successes + observations.failures;
        let avg = if millis.is_empty() {
            0.0
        } else {
            millis.iter().sum::<f64>() / millis.len() as f64
        };
        let elapsed = observations.elapsed.as_secs_f64();
        let throughput = if elapsed > 0.0 {
            successes as f64 / elapsed
        } else {
            0.0
        };
        let error_rate = if total == 0 {
            0.0
        } else {
            observations.failures as f64 / total as f64
        };

        let samples = &observations.samples;
        let peak_memory = samples.iter().map(|s| s.memory_bytes).max().unwrap_or(0);
        let avg_memory = if samples.is_empty() {
            0
        } else {
            samples.iter().map(|s| s.memory_bytes).sum::<u64>() / samples.len() as u64
        };
        let peak_cpu = samples.iter().map(|s| s.cpu_percent).fold(0.0f32, f32::max);
        let avg_cpu = if samples.is_empty() {
            0.0
        } else {
            samples.iter().map(|s| s.cpu_percent).sum::<f32>() / samples.len() as f32
        };

        let mut metrics = Self {
            probe: probe.to_string(),
            server: server.to_string(),
            concurrency,
            total_operations: total,
            successful_operations: successes,
            failed_operations: observations.failures,
            avg_latency_ms: avg,
            min_latency_ms: millis.first().copied().unwrap_or(0.0),
            max_latency_ms: millis.last().copied().unwrap_or(0.0),
            p95_latency_ms: percentile(&millis, 0.95),
            p99_latency_ms: percentile(&millis, 0.99),
            throughput,
            error_rate,
            peak_memory_bytes: peak_memory,
            avg_memory_bytes: avg_memory,
            peak_cpu_percent: peak_cpu,
            avg_cpu_percent: avg_cpu,
            memory_growth: memory_growth(samples),
            memory_leak_detected: detect_leak(samples, warmup),
            sample_count: samples.len(),
            grade: Grade::F,
            bottlenecks: Vec::new(),
        };
        metrics.grade = metrics.grade_against(limits);
        metrics.bottlenecks = metrics.find_bottlenecks(limits);
        metrics
    }

    pub fn success_rate(&self) -> f64 {
        1.0 - self.error_rate
    }

    fn grade_against(&self, limits: GradeLimits) -> Grade {
        if self.total_operations == 0 {
            return Grade::F;
        }
        let max_ms = limits.max_latency.as_secs_f64() * 1000.0;
        let mut score = 100.0;
        if self.avg_latency_ms > max_ms {
            score -= 20.0;
        } else if self.avg_latency_ms > max_ms * 0.8 {
            score -= 10.0;
        }
        if self.success_rate() < limits.min_success_rate {
            score -= 30.0;
        } else if self.success_rate() < 0.98 {
            score -= 15.0;
        }
        if self.p95_latency_ms > max_ms * 1.5 {
            score -= 15.0;
        }
        match score {
            s if s >= 90.0 => Grade::A,
            s if s >= 80.0 => Grade::B,
            s if s >= 70.0 => Grade::C,
            s if s >= 60.0 => Grade::D,
            _ => Grade::F,
        }
    }

    fn find_bottlenecks(&self, limits: GradeLimits) -> Vec<String> {
        let max_ms = limits.max_latency.as_secs_f64() * 1000.0;
        let mut found = Vec::new();
        if self.avg_latency_ms > max_ms {
            found.push(format!(
                "high average latency: {:.0}ms exceeds {:.0}ms",
                self.avg_latency_ms, max_ms
            ));
        }
        if self.success_rate() < limits.min_success_rate {
            found.push(format!(
                "low success rate: {:.1}% below {:.1}%",
                self.success_rate() * 100.0,
                limits.min_success_rate * 100.0
            ));
        }
        if self.avg_latency_ms > 0.0 && self.p95_latency_ms > self.avg_latency_ms * 3.0 {
            found.push(format!(
                "high latency variability: p95 {:.0}ms vs average {:.0}ms",
                self.p95_latency_ms, self.avg_latency_ms
            ));
        }
        if self.total_operations > 0 && self.throughput < 1.0 {
            found.push(format!("low throughput: {:.2} ops/s", self.throughput));
        }
        if self.memory_leak_detected {
            found.push("memory grew on every sample after warm-up".to_string());
        }
        found
    }
}
