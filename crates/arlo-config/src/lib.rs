//! Configuration for arlo-sync.
//!
//! TOML profiles, credential resolution (env + keyring + plaintext),
//! and translation to `arlo_core::ArloConfig`. The core never reads files;
//! this crate is the only place that does.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use arlo_core::{ArloConfig, RefreshTimings, TfaConfig, TfaSource, TwoFactorKind};

/// Keyring service name; entries are `{profile}/password`.
const KEYRING_SERVICE: &str = "arlo-sync";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no profile named '{profile}'")]
    UnknownProfile { profile: String },

    #[error("no credentials configured for profile '{profile}'")]
    NoCredentials { profile: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named.
    pub default_profile: Option<String>,

    /// Values every profile inherits.
    #[serde(default)]
    pub defaults: Defaults,

    /// Named account profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

/// Runtime settings shared by all profiles. Durations are whole units
/// named in the field; zero disables where noted.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Defaults {
    pub storage_dir: Option<PathBuf>,
    pub save_state: bool,
    pub dump_packets: bool,
    pub wait_for_initial_setup: bool,
    /// Seconds; zero waits forever.
    pub initial_setup_timeout: u64,
    /// Hours; zero never re-enumerates.
    pub refresh_devices_every: u64,
    /// Seconds; zero disables the idle bound.
    pub stream_timeout: u64,
    /// Minutes; zero never forces a reconnect.
    pub reconnect_every: u64,
    /// Seconds.
    pub request_timeout: u64,
    /// Seconds.
    pub recent_time: u64,
    pub library_days: u32,
    pub user_agent: Option<String>,
    pub workers: usize,
}

impl Default for Defaults {
    fn default() -> Self {
        let core = ArloConfig::default();
        Self {
            storage_dir: None,
            save_state: core.save_state,
            dump_packets: core.dump_packets,
            wait_for_initial_setup: core.wait_for_initial_setup,
            initial_setup_timeout: core.initial_setup_timeout.as_secs(),
            refresh_devices_every: 0,
            stream_timeout: 0,
            reconnect_every: 0,
            request_timeout: core.request_timeout.as_secs(),
            recent_time: core.recent_time.as_secs(),
            library_days: core.library_days,
            user_agent: None,
            workers: core.workers,
        }
    }
}

/// A named account profile.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Profile {
    /// Account email.
    pub username: Option<String>,

    /// Password (plaintext -- prefer keyring or `ARLO_PASSWORD`).
    pub password: Option<String>,

    /// Device API root override.
    pub host: Option<String>,
    /// Authentication root override.
    pub auth_host: Option<String>,
    /// Push channel endpoint override.
    pub stream_url: Option<String>,

    /// State file base name; defaults to the profile name.
    pub name: Option<String>,
    pub storage_dir: Option<PathBuf>,

    #[serde(default)]
    pub tfa: TfaProfile,

    pub save_state: Option<bool>,
    pub dump_packets: Option<bool>,
    pub stream_timeout: Option<u64>,
    pub reconnect_every: Option<u64>,
    pub refresh_devices_every: Option<u64>,
    pub request_timeout: Option<u64>,
    pub initial_setup_timeout: Option<u64>,
}

/// Second-factor settings of a profile.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TfaProfile {
    /// `"console"` or `"mailbox"`.
    pub source: String,
    /// `"email"` or `"sms"`.
    pub kind: String,
    /// Seconds between mailbox polls.
    pub retry_interval: u64,
    /// Seconds before the challenge is abandoned.
    pub total_timeout: u64,
}

impl Default for TfaProfile {
    fn default() -> Self {
        let core = TfaConfig::default();
        Self {
            source: "console".into(),
            kind: "email".into(),
            retry_interval: core.retry_interval.as_secs(),
            total_timeout: core.total_timeout.as_secs(),
        }
    }
}

// ── Paths ───────────────────────────────────────────────────────────

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "arlo-sync", "arlo-sync")
}

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    project_dirs().map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Where state files go when neither the profile nor the defaults say.
pub fn default_storage_dir() -> PathBuf {
    project_dirs().map_or_else(
        || std::env::temp_dir().join("arlo-sync"),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("arlo-sync");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` + environment. A missing file yields defaults.
///
/// Environment keys are `ARLO_` + the TOML path joined with `__`, e.g.
/// `ARLO_DEFAULTS__WORKERS=8` or `ARLO_PROFILES__HOME__USERNAME=...`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("ARLO_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Pick the named profile, or the default one.
pub fn select_profile<'a>(
    config: &'a Config,
    name: Option<&str>,
) -> Result<(String, &'a Profile), ConfigError> {
    let name = name
        .map(str::to_owned)
        .or_else(|| config.default_profile.clone())
        .unwrap_or_else(|| "default".into());
    config
        .profiles
        .get(&name)
        .map(|p| (name.clone(), p))
        .ok_or(ConfigError::UnknownProfile { profile: name })
}

// ── Credential resolution ───────────────────────────────────────────

pub fn resolve_username(profile: &Profile, profile_name: &str) -> Result<String, ConfigError> {
    profile
        .username
        .clone()
        .or_else(|| std::env::var("ARLO_USERNAME").ok())
        .ok_or_else(|| ConfigError::NoCredentials {
            profile: profile_name.into(),
        })
}

/// Resolve the password: `ARLO_PASSWORD`, then the system keyring, then
/// plaintext in the profile.
pub fn resolve_password(
    profile: &Profile,
    profile_name: &str,
) -> Result<SecretString, ConfigError> {
    // 1. Env var
    if let Ok(pw) = std::env::var("ARLO_PASSWORD") {
        return Ok(SecretString::from(pw));
    }

    // 2. Keyring
    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, &format!("{profile_name}/password")) {
        if let Ok(pw) = entry.get_password() {
            return Ok(SecretString::from(pw));
        }
    }

    // 3. Plaintext in config
    if let Some(ref pw) = profile.password {
        return Ok(SecretString::from(pw.clone()));
    }

    Err(ConfigError::NoCredentials {
        profile: profile_name.into(),
    })
}

// ── Translation ─────────────────────────────────────────────────────

/// Build an `ArloConfig` from a profile, resolving credentials.
pub fn profile_to_arlo_config(
    config: &Config,
    profile: &Profile,
    profile_name: &str,
) -> Result<ArloConfig, ConfigError> {
    let password = resolve_password(profile, profile_name)?;
    profile_to_arlo_config_with_password(config, profile, profile_name, password)
}

/// Build an `ArloConfig` with a password obtained elsewhere (e.g. a prompt).
pub fn profile_to_arlo_config_with_password(
    config: &Config,
    profile: &Profile,
    profile_name: &str,
    password: SecretString,
) -> Result<ArloConfig, ConfigError> {
    let d = &config.defaults;
    let base = ArloConfig::default();

    Ok(ArloConfig {
        username: resolve_username(profile, profile_name)?,
        password,
        host: parse_url("host", profile.host.as_deref(), base.host)?,
        auth_host: parse_url("auth_host", profile.auth_host.as_deref(), base.auth_host)?,
        stream_url: parse_url("stream_url", profile.stream_url.as_deref(), base.stream_url)?,
        storage_dir: profile
            .storage_dir
            .clone()
            .or_else(|| d.storage_dir.clone())
            .unwrap_or_else(default_storage_dir),
        name: profile.name.clone().unwrap_or_else(|| profile_name.into()),
        save_state: profile.save_state.unwrap_or(d.save_state),
        dump_packets: profile.dump_packets.unwrap_or(d.dump_packets),
        wait_for_initial_setup: d.wait_for_initial_setup,
        initial_setup_timeout: secs(profile.initial_setup_timeout.unwrap_or(d.initial_setup_timeout)),
        refresh_devices_every: secs(
            profile
                .refresh_devices_every
                .unwrap_or(d.refresh_devices_every)
                .saturating_mul(3600),
        ),
        stream_timeout: secs(profile.stream_timeout.unwrap_or(d.stream_timeout)),
        reconnect_every: secs(
            profile
                .reconnect_every
                .unwrap_or(d.reconnect_every)
                .saturating_mul(60),
        ),
        request_timeout: secs(profile.request_timeout.unwrap_or(d.request_timeout)),
        recent_time: secs(d.recent_time),
        library_days: d.library_days,
        user_agent: d.user_agent.clone().unwrap_or(base.user_agent),
        workers: d.workers,
        tfa: tfa_config(&profile.tfa)?,
        timings: RefreshTimings::default(),
    })
}

fn tfa_config(tfa: &TfaProfile) -> Result<TfaConfig, ConfigError> {
    let source = match tfa.source.to_ascii_lowercase().as_str() {
        "console" => TfaSource::Console,
        "mailbox" | "imap" => TfaSource::Mailbox,
        other => {
            return Err(ConfigError::Validation {
                field: "tfa.source".into(),
                reason: format!("expected 'console' or 'mailbox', got '{other}'"),
            });
        }
    };
    let kind = match tfa.kind.to_ascii_lowercase().as_str() {
        "email" => TwoFactorKind::Email,
        "sms" => TwoFactorKind::Sms,
        other => {
            return Err(ConfigError::Validation {
                field: "tfa.kind".into(),
                reason: format!("expected 'email' or 'sms', got '{other}'"),
            });
        }
    };
    Ok(TfaConfig {
        source,
        kind,
        retry_interval: secs(tfa.retry_interval),
        total_timeout: secs(tfa.total_timeout),
    })
}

fn parse_url(field: &str, value: Option<&str>, default: Url) -> Result<Url, ConfigError> {
    let Some(raw) = value else {
        return Ok(default);
    };
    raw.parse().map_err(|_| ConfigError::Validation {
        field: field.into(),
        reason: format!("invalid URL: {raw}"),
    })
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}
