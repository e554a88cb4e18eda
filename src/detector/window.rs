// ============================================
// Connection Failure Window
// ============================================
//
// Per-server consecutive-failure counter. Reaching the threshold inside the
// monitoring window opens an episode and emits one Connection issue; further
// failures in the same episode stay quiet until a success closes it.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::{Evidence, Issue, IssueType};
use crate::utils::fingerprint;

/// Consecutive failures that open an episode
pub const FAILURE_THRESHOLD: u32 = 3;

const EPISODE_SEVERITY: u8 = 3;
const EPISODE_CONFIDENCE: u8 = 95;

#[derive(Debug)]
struct Episode {
    consecutive: u32,
    first_failure: Instant,
    reported: bool,
    details: Vec<String>,
}

impl Episode {
    fn start(detail: String) -> Self {
        Self {
            consecutive: 1,
            first_failure: Instant::now(),
            reported: false,
            details: vec![detail],
        }
    }
}

#[derive(Debug)]
pub struct FailureWindow {
    window: Duration,
    servers: Mutex<HashMap<String, Episode>>,
}

impl FailureWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Record one connection attempt. Returns the episode's issue exactly once.
    pub fn observe(&self, server: &str, ok: bool, detail: &str) -> Option<Issue> {
        let mut servers = self.servers.lock();
        if ok {
            if servers.remove(server).is_some() {
                tracing::info!(server = %server, "Connection recovered, failure episode closed");
            }
            return None;
        }

        let episode = servers
            .entry(server.to_string())
            .and_modify(|episode| {
                if !episode.reported && episode.first_failure.elapsed() > self.window {
                    // Failures spread wider than the window do not correlate
                    *episode = Episode::start(detail.to_string());
                } else {
                    episode.consecutive += 1;
                    if episode.details.len() < FAILURE_THRESHOLD as usize {
                        episode.details.push(detail.to_string());
                    }
                }
            })
            .or_insert_with(|| Episode::start(detail.to_string()));

        if episode.reported || episode.consecutive < FAILURE_THRESHOLD {
            return None;
        }
        episode.reported = true;
        tracing::warn!(
            server = %server,
            failures = episode.consecutive,
            "Consecutive connection failures within {}s",
            self.window.as_secs()
        );
        Some(connection_issue(server, episode))
    }

    pub fn consecutive_failures(&self, server: &str) -> u32 {
        self.servers
            .lock()
            .get(server)
            .map(|e| e.consecutive)
            .unwrap_or(0)
    }
}

fn connection_issue(server: &str, episode: &Episode) -> Issue {
    let evidence = episode
        .details
        .iter()
        .map(|detail| Evidence {
            probe: None,
            result_id: None,
            metric: Some("connection_attempt".to_string()),
            detail: detail.clone(),
        })
        .collect();
    Issue {
        id: Uuid::new_v4(),
        issue_type: IssueType::Connection,
        severity: EPISODE_SEVERITY,
        description: format!(
            "{} consecutive connection failures to '{}'; last error: {}",
            episode.consecutive,
            server,
            episode.details.last().map(String::as_str).unwrap_or("unknown")
        ),
        confidence: EPISODE_CONFIDENCE,
        server: server.to_string(),
        timestamp: Utc::now(),
        pattern_id: Some("consecutive_connection_failures".to_string()),
        signature: fingerprint(&[server, IssueType::Connection.as_str()]),
        evidence,
        suggestions: vec![
            "Verify the server command path and that it starts outside the doctor".to_string(),
            "Check the server's stderr for startup errors".to_string(),
        ],
    }
}
