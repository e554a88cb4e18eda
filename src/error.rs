// Error taxonomy for the diagnostics engine

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the engine's public operations.
///
/// Probe-level failures never show up here: a probe that times out, crashes
/// its session or trips a protocol violation is recorded as a `TestResult`
/// instead. These variants cover what cannot be turned into a result.
#[derive(Debug, Error)]
pub enum DoctorError {
    #[error("connection to '{server}' failed: {message}")]
    Connection { server: String, message: String },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("result store error: {0}")]
    Store(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DoctorError {
    pub fn connection(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            server: server.into(),
            message: message.into(),
        }
    }

    /// Transport-level faults that mean the session is gone.
    pub fn is_session_loss(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Io(_) | Self::Connection { .. })
    }
}

impl From<sqlx::Error> for DoctorError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for DoctorError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Store(format!("migration failed: {err}"))
    }
}

impl From<reqwest::Error> for DoctorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Transport(format!("HTTP request timed out: {err}"))
        } else if err.is_decode() {
            Self::ProtocolViolation(format!("undecodable HTTP response: {err}"))
        } else {
            Self::Transport(format!("HTTP request failed: {err}"))
        }
    }
}

impl From<validator::ValidationErrors> for DoctorError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<config::ConfigError> for DoctorError {
    fn from(err: config::ConfigError) -> Self {
        Self::Validation(format!("configuration: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, DoctorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = DoctorError::connection("weather", "spawn failed: No such file or directory");
        assert_eq!(
            err.to_string(),
            "connection to 'weather' failed: spawn failed: No such file or directory"
        );
    }

    #[test]
    fn test_session_loss_classification() {
        assert!(DoctorError::Transport("stdout closed".into()).is_session_loss());
        assert!(!DoctorError::ProtocolViolation("bad frame".into()).is_session_loss());
        assert!(!DoctorError::Cancelled.is_session_loss());
    }

    #[test]
    fn test_serde_error_conversion() {
        let err: DoctorError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert!(matches!(err, DoctorError::Serialization(_)));
    }
}
