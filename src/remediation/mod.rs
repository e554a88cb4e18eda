// ============================================
// Remediation Engine
// ============================================
//
// Issue type -> ordered strategies, each retried with exponential backoff
// and re-validated by re-running the probes behind the issue. Phases:
// Attempting -> Validating -> {Succeeded, NextStrategy, Exhausted}.
// Issues are never modified; every run appends a RemediationResult.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::db::{StoreRecord, WriteBufferHandle};
use crate::error::Result;
use crate::models::{
    ActionRecord, Issue, IssueType, RemediationPhase, RemediationResult, RemediationStatus,
    Strategy,
};

/// Runs kept in memory; the full trail lives in the result store
const HISTORY_LIMIT: usize = 512;

/// Applies strategies and re-checks the issue against the live server.
#[async_trait]
pub trait RemediationContext: Send + Sync {
    async fn apply(&self, issue: &Issue, strategy: Strategy) -> Result<()>;

    /// Re-run whatever produced the issue; true when it now passes.
    async fn validate(&self, issue: &Issue) -> Result<bool>;
}

/// Strategies tried for an issue type, in order. Empty means manual only.
pub fn strategies_for(issue_type: IssueType) -> &'static [Strategy] {
    match issue_type {
        IssueType::Connection => &[Strategy::Reconnect, Strategy::RestartProcess],
        IssueType::Timeout => &[Strategy::IncreaseTimeout, Strategy::Reconnect],
        IssueType::ToolExecution | IssueType::ResourceAccess => &[Strategy::Reconnect],
        IssueType::Configuration => &[Strategy::ResetToDefaults],
        IssueType::Performance => &[Strategy::ClearCache, Strategy::ReduceConcurrency],
        IssueType::Protocol => &[Strategy::RestartProcess],
        IssueType::Authentication | IssueType::Authorization | IssueType::Security => &[],
    }
}

fn manual_steps_for(issue: &Issue) -> Vec<String> {
    let mut steps = vec![format!(
        "Automated remediation could not resolve the {} issue on '{}'",
        issue.issue_type, issue.server
    )];
    let specific: &[&str] = match issue.issue_type {
        IssueType::Connection => &[
            "Start the server command by hand and check that it answers the initialize request",
            "Check the server's stderr for startup errors",
        ],
        IssueType::Timeout => &["Profile the slow handler and raise the probe timeout if it is legitimately slow"],
        IssueType::Authentication => &["Fix credential verification in the server; this cannot be remediated from the client"],
        IssueType::Authorization => &["Restrict tools and resources per caller; this cannot be remediated from the client"],
        IssueType::Security => &["Fix input validation in the affected tool and re-run the security probes"],
        IssueType::Configuration => &["Review the target descriptor (command, args, env, cwd)"],
        IssueType::Performance => &["Reduce load on the server or scale it before re-running the load probe"],
        IssueType::Protocol => &["Check that the server writes only JSON-RPC frames to stdout"],
        IssueType::ToolExecution | IssueType::ResourceAccess => &["Review the failing handler's logs"],
    };
    steps.extend(specific.iter().map(|s| s.to_string()));
    for suggestion in &issue.suggestions {
        if !steps.contains(suggestion) {
            steps.push(suggestion.clone());
        }
    }
    steps
}

pub struct RemediationEngine {
    policy: RetryPolicy,
    history: Mutex<VecDeque<RemediationResult>>,
    history_limit: usize,
    write_buffer: Option<WriteBufferHandle>,
}

impl RemediationEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            history: Mutex::new(VecDeque::new()),
            history_limit: HISTORY_LIMIT,
            write_buffer: None,
        }
    }

    pub fn with_write_buffer(mut self, write_buffer: WriteBufferHandle) -> Self {
        self.write_buffer = Some(write_buffer);
        self
    }

    pub async fn remediate(
        &self,
        issue: &Issue,
        ctx: &dyn RemediationContext,
        cancel: &CancellationToken,
    ) -> RemediationResult {
        let started_at = Utc::now();
        let started = Instant::now();
        let mut run = Run::default();
        let strategies = strategies_for(issue.issue_type);

        tracing::info!(
            issue = %issue.id,
            issue_type = issue.issue_type.as_str(),
            server = %issue.server,
            strategies = strategies.len(),
            "Starting remediation"
        );

        let mut status = RemediationStatus::Failed;
        'strategies: for (index, strategy) in strategies.iter().copied().enumerate() {
            for attempt in 1..=self.policy.max_attempts.max(1) {
                let backoff = self.backoff_before(attempt);
                if !backoff.is_zero() {
                    tracing::debug!(
                        issue = %issue.id,
                        strategy = strategy.as_str(),
                        attempt,
                        "Backing off {}ms",
                        backoff.as_millis()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => {
                            run.cancelled = true;
                            break 'strategies;
                        }
                    }
                }

                if self.attempt(issue, ctx, strategy, attempt, backoff, &mut run).await {
                    run.phases.push(RemediationPhase::Succeeded { strategy });
                    status = if index == 0 {
                        RemediationStatus::Success
                    } else {
                        RemediationStatus::PartialSuccess
                    };
                    break 'strategies;
                }
                if cancel.is_cancelled() {
                    run.cancelled = true;
                    break 'strategies;
                }
            }
            if index + 1 < strategies.len() {
                run.phases.push(RemediationPhase::NextStrategy { from: strategy });
            }
        }

        let mut manual = Vec::new();
        if status == RemediationStatus::Failed {
            run.phases.push(RemediationPhase::Exhausted);
            manual = manual_steps_for(issue);
            if run.cancelled {
                manual.insert(0, "Remediation was cancelled before it finished".to_string());
            }
        }

        let result = RemediationResult {
            id: Uuid::new_v4(),
            issue_id: issue.id,
            status,
            actions_taken: run.actions,
            phases: run.phases,
            manual_steps: manual,
            started_at,
            duration: started.elapsed(),
        };

        match result.status {
            RemediationStatus::Failed => tracing::warn!(
                issue = %issue.id,
                attempts = result.actions_taken.len(),
                "Remediation exhausted, manual steps required"
            ),
            _ => tracing::info!(
                issue = %issue.id,
                status = result.status.as_str(),
                attempts = result.actions_taken.len(),
                "Remediation succeeded"
            ),
        }

        self.record(&result);
        result
    }

    /// One Attempting -> Validating pass. True when validation passed.
    async fn attempt(
        &self,
        issue: &Issue,
        ctx: &dyn RemediationContext,
        strategy: Strategy,
        attempt: u32,
        backoff: Duration,
        run: &mut Run,
    ) -> bool {
        run.phases.push(RemediationPhase::Attempting { strategy, attempt });
        let mut record = ActionRecord {
            strategy,
            attempt,
            backoff,
            applied: false,
            validated: false,
            error: None,
            at: Utc::now(),
        };

        match ctx.apply(issue, strategy).await {
            Ok(()) => {
                record.applied = true;
                run.phases.push(RemediationPhase::Validating { strategy, attempt });
                match ctx.validate(issue).await {
                    Ok(passed) => record.validated = passed,
                    Err(e) => record.error = Some(format!("validation failed: {e}")),
                }
            }
            Err(e) => record.error = Some(e.to_string()),
        }

        tracing::info!(
            issue = %issue.id,
            strategy = strategy.as_str(),
            attempt,
            applied = record.applied,
            validated = record.validated,
            "Remediation attempt finished"
        );
        let validated = record.validated;
        run.actions.push(record);
        validated
    }

    /// No wait before the first attempt; base * 2^(n-2) before attempt n.
    fn backoff_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let delay = self.policy.delay_for(attempt - 2);
        if !self.policy.jitter {
            return delay;
        }
        let spread = (delay.as_millis() as u64) / 2;
        let jittered = delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread));
        jittered.min(Duration::from_millis(self.policy.max_delay_ms))
    }

    fn record(&self, result: &RemediationResult) {
        {
            let mut history = self.history.lock();
            if history.len() == self.history_limit {
                history.pop_front();
            }
            history.push_back(result.clone());
        }
        if let Some(write_buffer) = &self.write_buffer {
            write_buffer.queue(StoreRecord::Remediation(result.clone()));
        }
    }

    /// Record a run that could not start, e.g. because the server is unknown.
    pub fn unresolvable(&self, issue: &Issue, reason: &str) -> RemediationResult {
        let mut manual_steps = vec![reason.to_string()];
        manual_steps.extend(manual_steps_for(issue));
        let result = RemediationResult {
            id: Uuid::new_v4(),
            issue_id: issue.id,
            status: RemediationStatus::Failed,
            actions_taken: Vec::new(),
            phases: vec![RemediationPhase::Exhausted],
            manual_steps,
            started_at: Utc::now(),
            duration: Duration::ZERO,
        };
        tracing::warn!(issue = %issue.id, "Remediation not attempted: {}", reason);
        self.record(&result);
        result
    }

    /// Most recent runs, optionally for one issue. Older runs are only in the store.
    pub fn history(&self, issue_id: Option<Uuid>) -> Vec<RemediationResult> {
        self.history
            .lock()
            .iter()
            .filter(|r| issue_id.is_none_or(|id| r.issue_id == id))
            .cloned()
            .collect()
    }

    /// Share of the retained runs that did not fail.
    pub fn success_rate(&self) -> f64 {
        let history = self.history.lock();
        if history.is_empty() {
            return 0.0;
        }
        history.iter().filter(|r| r.succeeded()).count() as f64 / history.len() as f64
    }
}

#[derive(Default)]
struct Run {
    actions: Vec<ActionRecord>,
    phases: Vec<RemediationPhase>,
    cancelled: bool,
}
