use thiserror::Error;

/// Top-level error type for the `arlo-api` crate.
///
/// Covers every failure mode of the transport layer: authentication and
/// second factor, request/response calls, and the push event channel.
/// `arlo-core` maps these into domain errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Credentials rejected, or the one-time code was refused.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// No second-factor code arrived within the configured bound.
    #[error("No two-factor code received within {waited_secs}s")]
    TwoFactorTimeout { waited_secs: u64 },

    /// The account or source cannot satisfy the challenge (no matching
    /// factor, mailbox unreachable, prompt closed).
    #[error("Two-factor challenge cannot be satisfied: {0}")]
    TwoFactorUnavailable(String),

    /// The session token was rejected by the service.
    #[error("Session expired -- re-authentication required")]
    SessionExpired,

    /// A call that needs a session was made before `login`.
    #[error("Not logged in")]
    NotAuthenticated,

    // ── Request/response ────────────────────────────────────────────
    /// Network-level failure (connection refused, DNS, TLS, reset).
    #[error("Request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// The call exceeded the configured request timeout.
    #[error("Request timed out after {timeout_secs}s")]
    RequestTimeout { timeout_secs: u64 },

    /// The service answered with an error status or a `success: false` body.
    #[error("API error{}: {message}", status_suffix(.status))]
    Api { status: Option<u16>, message: String },

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    // ── Push channel ────────────────────────────────────────────────
    /// Push channel connection or read failed.
    #[error("Event stream connection failed: {0}")]
    StreamConnect(String),

    /// No packet arrived within the idle bound.
    #[error("Event stream idle for {idle_secs}s")]
    StreamIdle { idle_secs: u64 },

    /// A push frame was not a well-formed packet.
    #[error("Malformed packet: {message}")]
    PacketParse { message: String },
}

#[allow(clippy::ref_option, clippy::trivially_copy_pass_by_ref)]
fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl Error {
    /// Map a `reqwest` failure, separating timeouts from other network errors.
    pub(crate) fn from_reqwest(err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            Self::RequestTimeout { timeout_secs }
        } else {
            Self::Request(err)
        }
    }

    /// Returns `true` if this error indicates auth has expired
    /// and re-authentication might resolve it.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::SessionExpired | Self::NotAuthenticated)
            || matches!(self, Self::Api { status: Some(401), .. })
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(e) => e.is_connect() || e.is_request(),
            Self::RequestTimeout { .. } | Self::StreamConnect(_) | Self::StreamIdle { .. } => true,
            _ => false,
        }
    }

    /// Returns `true` if startup cannot continue after this error.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. }
                | Self::TwoFactorTimeout { .. }
                | Self::TwoFactorUnavailable(_)
        )
    }
}
