// Configuration module

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::{DoctorError, Result};

/// Environment variable prefix, e.g. `MCP_DOCTOR_TIMEOUT_SECS=10` or
/// `MCP_DOCTOR_SCORING__OUTCOME=0.6` for nested keys.
const ENV_PREFIX: &str = "MCP_DOCTOR";

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EngineConfig {
    /// Default per-probe timeout
    #[validate(range(min = 1, max = 3600))]
    pub timeout_secs: u64,
    /// How many times a suite may reopen a lost session before giving up on it
    #[validate(range(max = 10))]
    pub retries: u32,
    /// Minimum confidence for a probe to count as Passed
    #[validate(range(max = 100))]
    pub confidence_threshold: u8,
    /// Default concurrency of the load probe
    #[validate(range(min = 1, max = 1000))]
    pub concurrent_connections: u32,
    /// Default load window
    #[validate(range(min = 1, max = 86400))]
    pub test_duration_secs: u64,
    pub auto_remediate: bool,
    pub fail_fast: bool,
    #[validate(range(min = 1))]
    pub suite_timeout_secs: u64,
    /// Orchestrator-wide cap on concurrently running load workers
    #[validate(range(min = 1, max = 1000))]
    pub max_workers: u32,
    #[validate(range(min = 1))]
    pub latency_threshold_ms: u64,
    /// Time a stdio server gets to exit after stdin closes before it is killed
    pub teardown_grace_ms: u64,
    #[validate(range(min = 10))]
    pub sample_interval_ms: u64,
    pub warmup_samples: usize,
    #[validate(range(min = 0.0, max = 1.0))]
    pub min_success_rate: f64,
    /// Window in which consecutive connection failures are correlated
    #[validate(range(min = 1))]
    pub monitoring_window_secs: u64,
    #[validate(nested)]
    pub scoring: ScoringWeights,
    #[validate(nested)]
    pub remediation: RetryPolicy,
    pub database_url: String,
    #[validate(range(min = 1))]
    pub retention_days: u32,
}

/// Weights of the three confidence signals. Must sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
#[validate(schema(function = "validate_weight_sum"))]
pub struct ScoringWeights {
    #[validate(range(min = 0.0, max = 1.0))]
    pub outcome: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub latency: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub stability: f64,
}

fn validate_weight_sum(weights: &ScoringWeights) -> std::result::Result<(), ValidationError> {
    let sum = weights.outcome + weights.latency + weights.stability;
    if (sum - 1.0).abs() > 1e-6 {
        let mut err = ValidationError::new("weight_sum");
        err.message = Some(format!("scoring weights must sum to 1.0, got {sum:.3}").into());
        return Err(err);
    }
    Ok(())
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            outcome: 0.5,
            latency: 0.3,
            stability: 0.2,
        }
    }
}

/// Retry policy of each remediation strategy.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    #[validate(range(min = 1, max = 10))]
    pub max_attempts: u32,
    #[validate(range(min = 1))]
    pub base_delay_ms: u64,
    #[validate(range(min = 1))]
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (0-based): base * 2^attempt, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let millis = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            retries: 1,
            confidence_threshold: 80,
            concurrent_connections: 10,
            test_duration_secs: 60,
            auto_remediate: false,
            fail_fast: false,
            suite_timeout_secs: 600,
            max_workers: 16,
            latency_threshold_ms: 2_000,
            teardown_grace_ms: 2_000,
            sample_interval_ms: 1_000,
            warmup_samples: 1,
            min_success_rate: 0.95,
            monitoring_window_secs: 300,
            scoring: ScoringWeights::default(),
            remediation: RetryPolicy::default(),
            database_url: "sqlite://mcp-doctor.db".to_string(),
            retention_days: 90,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `MCP_DOCTOR_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Config::try_from(&EngineConfig::default())?)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: EngineConfig = config.try_deserialize()?;
        config.check()?;
        Ok(config)
    }

    /// Validate field ranges and the weight sum.
    pub fn check(&self) -> Result<()> {
        self.validate().map_err(DoctorError::from)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn suite_timeout(&self) -> Duration {
        Duration::from_secs(self.suite_timeout_secs)
    }

    pub fn latency_threshold(&self) -> Duration {
        Duration::from_millis(self.latency_threshold_ms)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn test_duration(&self) -> Duration {
        Duration::from_secs(self.test_duration_secs)
    }

    pub fn monitoring_window(&self) -> Duration {
        Duration::from_secs(self.monitoring_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.check().is_ok());
        assert_eq!(config.confidence_threshold, 80);
        assert_eq!(config.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let config = EngineConfig {
            scoring: ScoringWeights {
                outcome: 0.6,
                latency: 0.3,
                stability: 0.2,
            },
            ..EngineConfig::default()
        };
        let err = config.check().unwrap_err();
        assert!(matches!(err, DoctorError::Validation(_)));
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let config = EngineConfig {
            confidence_threshold: 120,
            ..EngineConfig::default()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 3_000,
            jitter: false,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(3_000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(3_000));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"timeout_secs": 5, "fail_fast": true}"#).unwrap();
        assert_eq!(config.timeout_secs, 5);
        assert!(config.fail_fast);
        assert_eq!(config.max_workers, 16);
    }
}
