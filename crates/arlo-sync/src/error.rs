//! Binary error types with miette diagnostics.
//!
//! Maps `ConfigError` and `CoreError` into user-facing errors with help text
//! and a process exit code.

use miette::Diagnostic;
use thiserror::Error;

use arlo_config::ConfigError;
use arlo_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────

    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(arlo::profile_not_found),
        help(
            "Available profiles: {available}\n\
             Config file: {path}"
        )
    )]
    ProfileNotFound {
        name: String,
        available: String,
        path: String,
    },

    #[error("No credentials configured for profile '{profile}'")]
    #[diagnostic(
        code(arlo::no_credentials),
        help(
            "Set username in the profile (or ARLO_USERNAME).\n\
             Store the password in the system keyring under arlo-sync/{profile}/password,\n\
             or set ARLO_PASSWORD."
        )
    )]
    NoCredentials { profile: String },

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(arlo::validation))]
    Validation { field: String, reason: String },

    #[error("Could not load configuration: {message}")]
    #[diagnostic(code(arlo::config))]
    Config { message: String },

    // ── Session ──────────────────────────────────────────────────────

    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(arlo::auth_failed),
        help("Check the username and password for this profile.")
    )]
    AuthFailed { message: String },

    #[error("No two-factor code arrived within {seconds}s")]
    #[diagnostic(
        code(arlo::tfa_timeout),
        help("Raise tfa.total_timeout or check the configured code source.")
    )]
    TwoFactorTimeout { seconds: u64 },

    #[error("Could not reach the Arlo service: {message}")]
    #[diagnostic(code(arlo::connection_failed))]
    ConnectionFailed { message: String },

    #[error("Initial setup did not finish within {seconds}s")]
    #[diagnostic(
        code(arlo::startup_timeout),
        help("Raise defaults.initial_setup_timeout, or run with --no-wait.")
    )]
    StartupTimeout { seconds: u64 },

    // ── Runtime ──────────────────────────────────────────────────────

    #[error(transparent)]
    #[diagnostic(code(arlo::runtime))]
    Core(CoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::AuthFailed { .. } | Self::NoCredentials { .. } | Self::TwoFactorTimeout { .. } => {
                exit_code::AUTH
            }
            Self::Validation { .. } => exit_code::USAGE,
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::StartupTimeout { .. } => exit_code::TIMEOUT,
            _ => exit_code::GENERAL,
        }
    }
}

// ── ConfigError → CliError ───────────────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            ConfigError::UnknownProfile { profile } => Self::ProfileNotFound {
                name: profile,
                available: "(none)".into(),
                path: String::new(),
            },
            ConfigError::NoCredentials { profile } => Self::NoCredentials { profile },
            ConfigError::Figment(e) => Self::Config {
                message: e.to_string(),
            },
        }
    }
}

// ── CoreError → CliError ─────────────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::AuthenticationFailed { message } => Self::AuthFailed { message },
            CoreError::TwoFactorTimeout { waited_secs } => Self::TwoFactorTimeout {
                seconds: waited_secs,
            },
            CoreError::StartupTimeout { waited_secs } => Self::StartupTimeout {
                seconds: waited_secs,
            },
            CoreError::Request { message, .. } | CoreError::Stream { message } => {
                Self::ConnectionFailed { message }
            }
            CoreError::Timeout { timeout_secs } => Self::ConnectionFailed {
                message: format!("request timed out after {timeout_secs}s"),
            },
            CoreError::Config { message } => Self::Config { message },
            other => Self::Core(other),
        }
    }
}
