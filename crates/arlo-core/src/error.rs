// ── Core error types ──
//
// Errors surfaced by the synchronization runtime. Transport failures from
// arlo-api are translated into domain variants by `From<arlo_api::Error>`;
// storage and task failures keep their own types so callers can tell a
// failed save from a failed refresh.

use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("No two-factor code received within {waited_secs}s")]
    TwoFactorTimeout { waited_secs: u64 },

    #[error("Not connected")]
    NotConnected,

    /// The session was rejected mid-run; the push channel logs in again.
    #[error("Session expired")]
    SessionExpired,

    #[error("Request failed: {message}")]
    Request {
        message: String,
        /// HTTP status code (if applicable).
        status: Option<u16>,
    },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Event stream error: {message}")]
    Stream { message: String },

    // ── Startup ──────────────────────────────────────────────────────
    #[error("Initial setup did not complete within {waited_secs}s")]
    StartupTimeout { waited_secs: u64 },

    // ── Runtime ──────────────────────────────────────────────────────
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Persistence failures. Memory stays authoritative when these occur.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("State file I/O failed at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State snapshot encoding failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("State file {} is corrupt: {message}", path.display())]
    Corrupt { path: PathBuf, message: String },

    #[error("State snapshot version {found} is not supported (expected {expected})")]
    IncompatibleVersion { found: u64, expected: u64 },
}

/// Failure of one scheduled task execution.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("panicked: {0}")]
    Panicked(String),
}

impl From<CoreError> for TaskError {
    fn from(err: CoreError) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<arlo_api::Error> for TaskError {
    fn from(err: arlo_api::Error) -> Self {
        Self::Failed(err.to_string())
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<arlo_api::Error> for CoreError {
    fn from(err: arlo_api::Error) -> Self {
        match err {
            arlo_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            arlo_api::Error::TwoFactorTimeout { waited_secs } => {
                CoreError::TwoFactorTimeout { waited_secs }
            }
            arlo_api::Error::TwoFactorUnavailable(message) => {
                CoreError::AuthenticationFailed { message }
            }
            arlo_api::Error::SessionExpired => CoreError::SessionExpired,
            arlo_api::Error::NotAuthenticated => CoreError::NotConnected,
            arlo_api::Error::Request(ref e) => CoreError::Request {
                message: e.to_string(),
                status: e.status().map(|s| s.as_u16()),
            },
            arlo_api::Error::RequestTimeout { timeout_secs } => {
                CoreError::Timeout { timeout_secs }
            }
            arlo_api::Error::Api { status, message } => CoreError::Request { message, status },
            arlo_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            arlo_api::Error::Deserialization { message, body: _ } => CoreError::Request {
                message: format!("Unexpected response: {message}"),
                status: None,
            },
            arlo_api::Error::StreamConnect(message) => CoreError::Stream { message },
            arlo_api::Error::StreamIdle { idle_secs } => CoreError::Stream {
                message: format!("idle for {idle_secs}s"),
            },
            arlo_api::Error::PacketParse { message } => CoreError::Stream {
                message: format!("malformed packet: {message}"),
            },
        }
    }
}

impl CoreError {
    /// Errors that keep the runtime from becoming usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed { .. }
                | Self::TwoFactorTimeout { .. }
                | Self::StartupTimeout { .. }
                | Self::Config { .. }
        )
    }
}

// ── Last error slot ──────────────────────────────────────────────────

/// The most recent non-fatal error, shared by every component.
///
/// Degraded operation (failed refresh, failed save, dropped connection)
/// is only observable here and in the logs.
#[derive(Debug, Clone, Default)]
pub struct LastError(Arc<ArcSwapOption<String>>);

impl LastError {
    pub fn record(&self, err: impl Display) {
        self.0.store(Some(Arc::new(err.to_string())));
    }

    pub fn get(&self) -> Option<Arc<String>> {
        self.0.load_full()
    }

    pub fn clear(&self) {
        self.0.store(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_to_domain() {
        let err: CoreError = arlo_api::Error::RequestTimeout { timeout_secs: 60 }.into();
        assert!(matches!(err, CoreError::Timeout { timeout_secs: 60 }));
        assert!(!err.is_fatal());

        let err: CoreError = arlo_api::Error::Authentication {
            message: "bad password".into(),
        }
        .into();
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "Authentication failed: bad password");

        let err: CoreError = arlo_api::Error::Api {
            status: Some(500),
            message: "boom".into(),
        }
        .into();
        assert!(matches!(err, CoreError::Request { status: Some(500), .. }));
    }

    #[test]
    fn expired_session_is_recoverable() {
        let err: CoreError = arlo_api::Error::SessionExpired.into();
        assert!(matches!(err, CoreError::SessionExpired));
        assert!(!err.is_fatal());
    }

    #[test]
    fn last_error_keeps_latest() {
        let slot = LastError::default();
        assert!(slot.get().is_none());

        let shared = slot.clone();
        shared.record(TaskError::Failed("first".into()));
        slot.record(CoreError::NotConnected);
        assert_eq!(shared.get().as_deref().map(String::as_str), Some("Not connected"));

        slot.clear();
        assert!(shared.get().is_none());
    }
}
