// ============================================
// Confidence Scoring
// ============================================
//
// Pure functions from a RawOutcome to a scored TestResult. No I/O, no clock
// reads beyond stamping the result.

use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use uuid::Uuid;

use crate::config::{EngineConfig, ScoringWeights};
use crate::models::{Fault, ProbeSpec, RawOutcome, TestResult, TestStatus, Verdict};
use crate::utils::truncate;

/// Confidence of a probe skipped for a missing capability
pub const SKIPPED_CONFIDENCE: u8 = 95;

/// Known warning signatures; each distinct match costs 0.25 stability
const WARNING_PATTERNS: [&str; 5] = [
    r"(?i)\bwarn(ing)?\b",
    r"(?i)deprecat",
    r"(?i)traceback",
    r"(?i)unhandled",
    r"(?i)\bpanic(ked)?\b",
];

const STABILITY_PENALTY: f64 = 0.25;

#[derive(Debug, Clone)]
pub struct Scorer {
    weights: ScoringWeights,
    threshold: u8,
    warnings: Vec<Regex>,
}

impl Scorer {
    pub fn new(weights: ScoringWeights, threshold: u8) -> Self {
        let warnings = WARNING_PATTERNS
            .iter()
            .filter_map(|pattern| Regex::new(pattern).ok())
            .collect();
        Self {
            weights,
            threshold: threshold.min(100),
            warnings,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.scoring, config.confidence_threshold)
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// 1.0 at or under the threshold, falling linearly to 0.0 at 3x.
    pub fn latency_signal(elapsed: Duration, threshold: Duration) -> f64 {
        if threshold.is_zero() {
            return if elapsed.is_zero() { 1.0 } else { 0.0 };
        }
        let ratio = elapsed.as_secs_f64() / threshold.as_secs_f64();
        if ratio <= 1.0 {
            1.0
        } else {
            (1.0 - (ratio - 1.0) / 2.0).clamp(0.0, 1.0)
        }
    }

    /// 1.0 minus 0.25 per distinct warning pattern found in stderr or the payload.
    pub fn stability_signal(&self, outcome: &RawOutcome) -> f64 {
        let payload = outcome
            .payload
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_default();
        let matched = self
            .warnings
            .iter()
            .filter(|re| re.is_match(&payload) || outcome.stderr.iter().any(|line| re.is_match(line)))
            .count();
        (1.0 - STABILITY_PENALTY * matched as f64).max(0.0)
    }

    /// round(100 * (w_o * outcome + w_l * latency + w_s * stability))
    pub fn confidence(&self, outcome: &RawOutcome, latency_threshold: Duration) -> u8 {
        let weighted = self.weights.outcome * outcome.verdict.outcome_signal()
            + self.weights.latency * Self::latency_signal(outcome.latency, latency_threshold)
            + self.weights.stability * self.stability_signal(outcome);
        (100.0 * weighted).round().clamp(0.0, 100.0) as u8
    }

    /// Status and confidence, in precedence order: timeout, hard failure,
    /// skip, threshold.
    pub fn classify(&self, outcome: &RawOutcome, latency_threshold: Duration) -> (TestStatus, u8) {
        if matches!(outcome.fault, Some(Fault::Timeout) | Some(Fault::Cancelled)) {
            return (TestStatus::TimedOut, 0);
        }
        let confidence = self.confidence(outcome, latency_threshold);
        let hard_failure = matches!(
            outcome.fault,
            Some(Fault::Crash) | Some(Fault::ProtocolViolation) | Some(Fault::Panic)
        );
        if hard_failure && outcome.verdict.outcome_signal() == 0.0 {
            return (TestStatus::Error, confidence);
        }
        if outcome.verdict == Verdict::NotApplicable {
            return (TestStatus::Skipped, SKIPPED_CONFIDENCE);
        }
        if confidence >= self.threshold {
            (TestStatus::Passed, confidence)
        } else {
            (TestStatus::Failed, confidence)
        }
    }

    pub fn score(&self, spec: &ProbeSpec, server: &str, outcome: &RawOutcome) -> TestResult {
        let (status, confidence) = self.classify(outcome, spec.latency_threshold);
        let message = match status {
            TestStatus::Passed => outcome
                .note
                .clone()
                .unwrap_or_else(|| format!("{} passed", spec.name)),
            TestStatus::Skipped => outcome
                .note
                .clone()
                .unwrap_or_else(|| "not applicable to this server".to_string()),
            _ => outcome
                .error_text
                .as_deref()
                .map(|text| truncate(text, 500))
                .or_else(|| outcome.note.clone())
                .unwrap_or_else(|| format!("{} {}", spec.name, status)),
        };
        let error_message = match status {
            TestStatus::Passed | TestStatus::Skipped => None,
            _ => outcome.error_text.clone(),
        };

        TestResult {
            id: Uuid::new_v4(),
            suite_id: Uuid::nil(),
            server: server.to_string(),
            probe: spec.name.clone(),
            category: spec.category(),
            status,
            confidence,
            duration: outcome.elapsed,
            timestamp: Utc::now(),
            message,
            error_message,
            suggestions: suggestions(status, outcome),
            finding: outcome.finding.clone(),
        }
    }

    /// Result for a probe that never started.
    pub fn skipped(&self, spec: &ProbeSpec, server: &str, reason: &str) -> TestResult {
        let mut outcome = RawOutcome::not_applicable(reason);
        outcome.latency = Duration::ZERO;
        self.score(spec, server, &outcome)
    }
}

fn suggestions(status: TestStatus, outcome: &RawOutcome) -> Vec<String> {
    let mut found = Vec::new();
    if let Some(finding) = &outcome.finding {
        found.push(finding.recommended_fix.clone());
    }
    match status {
        TestStatus::TimedOut => {
            found.push("Increase the probe timeout or check server responsiveness".to_string());
        }
        TestStatus::Error => {
            found.push("Check the server logs for a crash or protocol error".to_string());
        }
        _ => {}
    }
    if let Some(metrics) = &outcome.performance {
        found.extend(metrics.bottlenecks.iter().cloned());
    }
    found
}
