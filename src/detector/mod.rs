// ============================================
// Issue Detector
// ============================================
//
// Evaluates the pattern table against a sealed suite and its performance
// metrics. Matches of the same (server, type) are merged into one Issue.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::models::{
    ConfidenceBand, Evidence, Issue, IssueCategories, IssueType, PerformanceMetrics, TestResult,
    TestStatus, TestSuite,
};
use crate::utils::{fingerprint, truncate};

pub mod patterns;
pub mod window;

pub use patterns::{Comparison, IssuePattern, PatternRegistry, Predicate};
pub use window::FailureWindow;

/// Reliability of the fallback issue for errors no pattern recognizes
const UNRECOGNIZED_RELIABILITY: u8 = 60;

/// Confidence added per merged duplicate
const DUPLICATE_BOOST: u32 = 5;

/// Issues below this confidence carry a note asking for manual confirmation
const LOW_CONFIDENCE: u8 = 80;

/// Signatures seen more often than this are recurring
const RECURRENCE_THRESHOLD: u32 = 2;

/// Distinct signatures tracked before the least recently seen is forgotten
const SIGNATURE_LIMIT: usize = 4096;

/// Emission counts per signature, bounded by evicting the stalest entry.
#[derive(Debug)]
struct SignatureHistory {
    /// signature -> (times emitted, tick of last emission)
    seen: HashMap<String, (u32, u64)>,
    tick: u64,
    limit: usize,
}

impl SignatureHistory {
    fn new(limit: usize) -> Self {
        Self {
            seen: HashMap::new(),
            tick: 0,
            limit: limit.max(1),
        }
    }

    fn count(&self, signature: &str) -> u32 {
        self.seen.get(signature).map_or(0, |(count, _)| *count)
    }

    fn remember(&mut self, signature: &str) {
        self.tick += 1;
        if let Some(entry) = self.seen.get_mut(signature) {
            entry.0 += 1;
            entry.1 = self.tick;
            return;
        }
        if self.seen.len() >= self.limit {
            let stalest = self
                .seen
                .iter()
                .min_by_key(|(_, (_, last))| *last)
                .map(|(signature, _)| signature.clone());
            if let Some(stalest) = stalest {
                self.seen.remove(&stalest);
            }
        }
        self.seen.insert(signature.to_string(), (1, self.tick));
    }
}

/// One pattern firing on one result or metrics record.
#[derive(Debug, Clone)]
struct Candidate {
    issue_type: IssueType,
    severity: u8,
    confidence: u8,
    pattern_id: String,
    evidence: Evidence,
    suggestions: Vec<String>,
}

pub struct IssueDetector {
    registry: PatternRegistry,
    window: FailureWindow,
    history: Mutex<SignatureHistory>,
}

impl IssueDetector {
    pub fn new(registry: PatternRegistry, monitoring_window: Duration) -> Self {
        Self {
            registry,
            window: FailureWindow::new(monitoring_window),
            history: Mutex::new(SignatureHistory::new(SIGNATURE_LIMIT)),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(PatternRegistry::builtin(), config.monitoring_window())
    }

    pub fn registry(&self) -> &PatternRegistry {
        &self.registry
    }

    pub fn add_custom_pattern(&self, pattern: IssuePattern) -> Result<()> {
        let id = pattern.id.clone();
        self.registry.insert(pattern)?;
        tracing::info!(pattern = %id, "Custom issue pattern registered");
        Ok(())
    }

    /// Feedback adjustment of a pattern's reliability, bounded to 0..=100.
    pub fn update_pattern_confidence(&self, pattern_id: &str, delta: i32) -> Result<u8> {
        let updated = self.registry.adjust_reliability(pattern_id, delta)?;
        tracing::info!(pattern = %pattern_id, delta, reliability = updated, "Pattern reliability updated");
        Ok(updated)
    }

    /// Record a connection attempt for the health window.
    pub fn observe_connection(&self, server: &str, ok: bool, detail: &str) -> Option<Issue> {
        let issue = self.window.observe(server, ok, detail)?;
        self.remember(&issue.signature);
        Some(issue)
    }

    pub fn analyze(&self, suite: &TestSuite, metrics: &[PerformanceMetrics]) -> Vec<Issue> {
        let patterns = self.registry.snapshot();
        let mut candidates = Vec::new();

        for result in suite.results.iter().filter(|r| needs_diagnosis(r)) {
            let text = diagnostic_text(result);
            let mut matched = false;
            for compiled in patterns.iter().filter(|p| p.matches_text(&text)) {
                matched = true;
                let pattern = &compiled.pattern;
                let severity = result
                    .finding
                    .as_ref()
                    .map(|f| f.risk_level.severity().max(pattern.severity))
                    .unwrap_or(pattern.severity);
                candidates.push(Candidate {
                    issue_type: pattern.issue_type,
                    severity,
                    confidence: average(pattern.reliability, result.confidence),
                    pattern_id: pattern.id.clone(),
                    evidence: result_evidence(result),
                    suggestions: pattern.suggestions.clone(),
                });
            }
            if !matched && result.status == TestStatus::Error {
                candidates.push(Candidate {
                    issue_type: IssueType::Protocol,
                    severity: 2,
                    confidence: average(UNRECOGNIZED_RELIABILITY, result.confidence),
                    pattern_id: "unrecognized_error".to_string(),
                    evidence: result_evidence(result),
                    suggestions: vec![
                        "Inspect the server logs around the failing probe".to_string(),
                    ],
                });
            }
        }

        for record in metrics {
            let triggering = suite.result(&record.probe);
            for compiled in &patterns {
                let Some((metric, value)) = compiled.breach(record) else {
                    continue;
                };
                let pattern = &compiled.pattern;
                let confidence = triggering
                    .map(|r| average(pattern.reliability, r.confidence))
                    .unwrap_or(pattern.reliability);
                candidates.push(Candidate {
                    issue_type: pattern.issue_type,
                    severity: pattern.severity,
                    confidence,
                    pattern_id: pattern.id.clone(),
                    evidence: Evidence {
                        probe: Some(record.probe.clone()),
                        result_id: triggering.map(|r| r.id),
                        metric: Some(metric.clone()),
                        detail: format!("{metric} = {value:.3}"),
                    },
                    suggestions: pattern.suggestions.clone(),
                });
            }
        }

        let issues = merge(&suite.server, candidates);
        for issue in &issues {
            self.remember(&issue.signature);
            tracing::warn!(
                server = %issue.server,
                issue_type = issue.issue_type.as_str(),
                severity = issue.severity,
                confidence = issue.confidence,
                pattern = issue.pattern_id.as_deref().unwrap_or("none"),
                "Issue detected"
            );
        }
        issues
    }

    /// Bucket issues by type, severity and confidence band, and flag
    /// signatures seen more than twice.
    pub fn categorize(&self, issues: &[Issue]) -> IssueCategories {
        let history = self.history.lock();
        let mut categories = IssueCategories::default();
        for issue in issues {
            categories
                .by_type
                .entry(issue.issue_type)
                .or_default()
                .push(issue.id);
            categories
                .by_severity
                .entry(issue.severity)
                .or_default()
                .push(issue.id);
            categories
                .by_confidence
                .entry(ConfidenceBand::of(issue.confidence))
                .or_default()
                .push(issue.id);
            if history.count(&issue.signature) > RECURRENCE_THRESHOLD {
                categories.recurring.push(issue.id);
            }
        }
        categories
    }

    fn remember(&self, signature: &str) {
        self.history.lock().remember(signature);
    }
}

fn needs_diagnosis(result: &TestResult) -> bool {
    result.status.is_problem() || result.finding.is_some()
}

fn diagnostic_text(result: &TestResult) -> String {
    let mut text = result.message.clone();
    if let Some(error) = &result.error_message {
        if error != &result.message {
            text.push('\n');
            text.push_str(error);
        }
    }
    if let Some(finding) = &result.finding {
        text.push('\n');
        text.push_str(&finding.evidence);
    }
    text
}

fn result_evidence(result: &TestResult) -> Evidence {
    Evidence {
        probe: Some(result.probe.clone()),
        result_id: Some(result.id),
        metric: None,
        detail: truncate(
            result.error_message.as_deref().unwrap_or(&result.message),
            300,
        ),
    }
}

fn average(reliability: u8, confidence: u8) -> u8 {
    ((u32::from(reliability) + u32::from(confidence) + 1) / 2).min(100) as u8
}

/// One Issue per issue type; duplicates raise confidence.
fn merge(server: &str, candidates: Vec<Candidate>) -> Vec<Issue> {
    let mut groups: BTreeMap<IssueType, Vec<Candidate>> = BTreeMap::new();
    for candidate in candidates {
        groups.entry(candidate.issue_type).or_default().push(candidate);
    }

    groups
        .into_iter()
        .map(|(issue_type, mut group)| {
            group.sort_by(|a, b| b.confidence.cmp(&a.confidence));
            let primary = group[0].clone();
            let duplicates = group.len() as u32 - 1;
            let confidence =
                (u32::from(primary.confidence) + DUPLICATE_BOOST * duplicates).min(100) as u8;
            let severity = group.iter().map(|c| c.severity).max().unwrap_or(primary.severity);

            let mut pattern_ids: Vec<&str> = group.iter().map(|c| c.pattern_id.as_str()).collect();
            pattern_ids.sort();
            pattern_ids.dedup();

            let mut suggestions: Vec<String> = Vec::new();
            for suggestion in group.iter().flat_map(|c| c.suggestions.iter()) {
                if !suggestions.contains(suggestion) {
                    suggestions.push(suggestion.clone());
                }
            }
            if confidence < LOW_CONFIDENCE {
                suggestions.push(format!(
                    "Low confidence ({confidence}%): confirm this issue manually before acting on it"
                ));
            }

            let mut description = format!(
                "{} issue on '{}': {}",
                issue_type, server, primary.evidence.detail
            );
            if pattern_ids.len() > 1 {
                description.push_str(&format!(" (matched {})", pattern_ids.join(", ")));
            }

            Issue {
                id: Uuid::new_v4(),
                issue_type,
                severity,
                description,
                confidence,
                server: server.to_string(),
                timestamp: Utc::now(),
                pattern_id: Some(primary.pattern_id),
                signature: fingerprint(&[server, issue_type.as_str()]),
                evidence: group.into_iter().map(|c| c.evidence).collect(),
                suggestions,
            }
        })
        .collect()
}
