// ── Runtime configuration ──
//
// Everything the runtime needs to know, passed in explicitly at
// construction. Core never reads config files; arlo-config (or an
// embedding application) builds an `ArloConfig` and hands it in.

use std::path::PathBuf;
use std::time::Duration;

use arlo_api::transport::DEFAULT_USER_AGENT;
use arlo_api::{TwoFactorKind, TwoFactorSettings};
use secrecy::SecretString;
use url::Url;

pub const DEFAULT_HOST: &str = "https://my.arlo.com";
pub const DEFAULT_AUTH_HOST: &str = "https://ocapi-app.arlo.com";
pub const DEFAULT_STREAM_URL: &str = "wss://myapi.arlo.com/hmsweb/client/subscribe";

/// Where the second-factor code comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TfaSource {
    /// Prompt on the terminal.
    #[default]
    Console,
    /// Poll a mailbox supplied by the embedding application.
    Mailbox,
}

/// Second-factor settings.
#[derive(Debug, Clone)]
pub struct TfaConfig {
    pub source: TfaSource,
    pub kind: TwoFactorKind,
    pub retry_interval: Duration,
    pub total_timeout: Duration,
}

impl Default for TfaConfig {
    fn default() -> Self {
        let api = TwoFactorSettings::default();
        Self {
            source: TfaSource::Console,
            kind: api.kind,
            retry_interval: api.retry_interval,
            total_timeout: api.total_timeout,
        }
    }
}

impl TfaConfig {
    pub fn settings(&self) -> TwoFactorSettings {
        TwoFactorSettings {
            kind: self.kind,
            retry_interval: self.retry_interval,
            total_timeout: self.total_timeout,
        }
    }
}

/// Cadence of the background refresh jobs.
#[derive(Debug, Clone)]
pub struct RefreshTimings {
    /// Delay between startup and the initial refresh pass.
    pub initial_delay: Duration,
    /// Save state and ping base stations.
    pub fast_interval: Duration,
    /// Refresh modes, device states, ambient sensors; maybe re-enumerate.
    pub slow_interval: Duration,
}

impl Default for RefreshTimings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            fast_interval: Duration::from_secs(60),
            slow_interval: Duration::from_secs(30 * 60),
        }
    }
}

/// Configuration for one account connection.
///
/// Durations of zero mean "disabled" (or "unbounded" for timeouts), as
/// noted per field.
#[derive(Debug, Clone)]
pub struct ArloConfig {
    pub username: String,
    pub password: SecretString,

    /// Device API root.
    pub host: Url,
    /// Authentication root.
    pub auth_host: Url,
    /// Push channel endpoint.
    pub stream_url: Url,

    /// Directory for the state file and packet dump.
    pub storage_dir: PathBuf,
    /// Base name of the state file: `{storage_dir}/{name}.state.json`.
    pub name: String,
    pub save_state: bool,
    /// Append every push packet to `{storage_dir}/packets.dump`.
    pub dump_packets: bool,

    pub wait_for_initial_setup: bool,
    /// Bound on the startup wait. Zero waits forever.
    pub initial_setup_timeout: Duration,
    /// Re-enumerate devices this often. Zero never does.
    pub refresh_devices_every: Duration,
    /// Reconnect the push channel after this much silence. Zero disables.
    pub stream_timeout: Duration,
    /// Log in again and reconnect on this cadence. Zero disables.
    pub reconnect_every: Duration,
    pub request_timeout: Duration,
    /// Window in which a camera counts as recently active.
    pub recent_time: Duration,
    /// Days of recordings the media layer keeps in view.
    pub library_days: u32,
    pub user_agent: String,

    /// Scheduler worker pool size.
    pub workers: usize,
    pub tfa: TfaConfig,
    pub timings: RefreshTimings,
}

impl Default for ArloConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: SecretString::from(String::new()),
            host: parse_static(DEFAULT_HOST),
            auth_host: parse_static(DEFAULT_AUTH_HOST),
            stream_url: parse_static(DEFAULT_STREAM_URL),
            storage_dir: std::env::temp_dir().join("arlo-sync"),
            name: "arlo".into(),
            save_state: true,
            dump_packets: false,
            wait_for_initial_setup: true,
            initial_setup_timeout: Duration::from_secs(300),
            refresh_devices_every: Duration::ZERO,
            stream_timeout: Duration::ZERO,
            reconnect_every: Duration::ZERO,
            request_timeout: arlo_api::transport::DEFAULT_REQUEST_TIMEOUT,
            recent_time: Duration::from_secs(600),
            library_days: 30,
            user_agent: DEFAULT_USER_AGENT.into(),
            workers: 4,
            tfa: TfaConfig::default(),
            timings: RefreshTimings::default(),
        }
    }
}

impl ArloConfig {
    pub fn state_file(&self) -> PathBuf {
        self.storage_dir.join(format!("{}.state.json", self.name))
    }

    pub fn dump_file(&self) -> PathBuf {
        self.storage_dir.join("packets.dump")
    }

    pub(crate) fn initial_setup_bound(&self) -> Option<Duration> {
        non_zero(self.initial_setup_timeout)
    }

    pub(crate) fn stream_idle_bound(&self) -> Option<Duration> {
        non_zero(self.stream_timeout)
    }

    pub(crate) fn renewal_interval(&self) -> Option<Duration> {
        non_zero(self.reconnect_every)
    }

    pub(crate) fn device_refresh_interval(&self) -> Option<Duration> {
        non_zero(self.refresh_devices_every)
    }
}

fn non_zero(d: Duration) -> Option<Duration> {
    (!d.is_zero()).then_some(d)
}

#[allow(clippy::expect_used)]
fn parse_static(url: &str) -> Url {
    Url::parse(url).expect("built-in URL is valid")
}
