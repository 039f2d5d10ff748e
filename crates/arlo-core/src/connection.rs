// ── Connection lifecycle ──
//
// Owns the API client, the credentials and the push-channel reader.
// The reader asks this manager for a session before every connection
// attempt, so expiry and forced renewal both end in a fresh login here.

use std::sync::{Arc, Weak};

use arlo_api::{
    ArloClient, ClientConfig, DeviceInfo, EventStreamHandle, PacketHandler, Session,
    SessionProvider, StreamConfig, StreamState, StreamStats, TransportConfig, TwoFactorSettings,
    TwoFactorSource,
};
use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ArloConfig;
use crate::error::{CoreError, LastError};
use crate::registry::Device;

// ── ConnectionState ──────────────────────────────────────────────────

/// Connection state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Authenticating,
    Connected,
    Reconnecting { attempt: u32 },
    Closed,
}

// ── ConnectionManager ────────────────────────────────────────────────

pub struct ConnectionManager {
    client: ArloClient,
    username: String,
    password: SecretString,
    tfa: TwoFactorSettings,
    tfa_source: Arc<dyn TwoFactorSource>,
    stream_config: StreamConfig,
    state: watch::Sender<ConnectionState>,
    errors: LastError,
    /// One login at a time; a second caller reuses the fresh session.
    login_lock: Mutex<()>,
    stream: Mutex<Option<EventStreamHandle>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl ConnectionManager {
    pub fn new(
        config: &ArloConfig,
        tfa_source: Arc<dyn TwoFactorSource>,
        errors: LastError,
    ) -> Result<Self, CoreError> {
        let client = ArloClient::new(&ClientConfig {
            host: config.host.clone(),
            auth_host: config.auth_host.clone(),
            transport: TransportConfig {
                timeout: config.request_timeout,
                user_agent: config.user_agent.clone(),
                cookie_jar: None,
            },
        })?;

        let mut stream_config = StreamConfig::new(config.stream_url.clone());
        stream_config.idle_timeout = config.stream_idle_bound();
        stream_config.reconnect_every = config.renewal_interval();
        stream_config.dump_file = config.dump_packets.then(|| config.dump_file());

        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            client,
            username: config.username.clone(),
            password: config.password.clone(),
            tfa: config.tfa.settings(),
            tfa_source,
            stream_config,
            state,
            errors,
            login_lock: Mutex::new(()),
            stream: Mutex::new(None),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    // ── Session ──────────────────────────────────────────────────────

    /// Authenticate, answering a second-factor challenge if required.
    pub async fn login(&self) -> Result<Arc<Session>, CoreError> {
        let _guard = self.login_lock.lock().await;
        self.login_locked().await.map_err(CoreError::from)
    }

    async fn login_locked(&self) -> Result<Arc<Session>, arlo_api::Error> {
        self.state.send_replace(ConnectionState::Authenticating);
        match self
            .client
            .login(&self.username, &self.password, &self.tfa, self.tfa_source.as_ref())
            .await
        {
            Ok(session) => {
                self.state.send_replace(ConnectionState::Connected);
                Ok(session)
            }
            Err(e) => {
                warn!(error = %e, "login failed");
                self.errors.record(&e);
                self.state.send_replace(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    pub fn current_session(&self) -> Option<Arc<Session>> {
        self.client.session()
    }

    /// Stop the push channel, end the session. Safe to call repeatedly.
    pub async fn logout(&self) -> Result<(), CoreError> {
        // Held until the state reads Closed; a concurrent caller waits here.
        let mut slot = self.stream.lock().await;
        if *self.state.borrow() == ConnectionState::Closed {
            debug!("logout: already closed");
            return Ok(());
        }

        self.cancel.cancel();
        if let Some(handle) = slot.take() {
            handle.shutdown();
            handle.join().await;
        }
        self.tracker.close();
        self.tracker.wait().await;

        let result = self.client.logout().await;
        self.state.send_replace(ConnectionState::Closed);
        drop(slot);
        result.map_err(|e| {
            self.errors.record(&e);
            CoreError::from(e)
        })
    }

    // ── Requests ─────────────────────────────────────────────────────

    /// Authenticated GET of `path`, returning the unwrapped payload.
    pub async fn get(&self, path: &str) -> Result<Value, CoreError> {
        self.client.get(path).await.map_err(|e| self.fail(e))
    }

    /// Send `body` to `device`; the response arrives on the push channel.
    pub async fn notify(&self, device: &Device, body: Value) -> Result<String, CoreError> {
        self.client
            .notify(device.notify_target(), body)
            .await
            .map_err(|e| self.fail(e))
    }

    pub async fn devices(&self) -> Result<Vec<DeviceInfo>, CoreError> {
        self.client.devices().await.map_err(|e| self.fail(e))
    }

    fn fail(&self, err: arlo_api::Error) -> CoreError {
        self.errors.record(&err);
        err.into()
    }

    // ── Push channel ─────────────────────────────────────────────────

    /// Start the push-channel reader, delivering packets to `handler`.
    /// A reader that is already running is left alone.
    pub async fn start_stream<H: PacketHandler>(self: &Arc<Self>, handler: Arc<H>) {
        let mut slot = self.stream.lock().await;
        if slot.is_some() || self.cancel.is_cancelled() {
            return;
        }

        let handle = EventStreamHandle::spawn(
            self.stream_config.clone(),
            Arc::clone(self),
            handler,
            self.cancel.child_token(),
        );
        self.tracker
            .spawn(mirror_stream_state(Arc::downgrade(self), handle.state()));
        *slot = Some(handle);
        info!(url = %self.stream_config.url, "event stream started");
    }

    pub async fn stream_stats(&self) -> Option<Arc<StreamStats>> {
        self.stream.lock().await.as_ref().map(EventStreamHandle::stats)
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Logged in and not shut down.
    pub fn is_connected(&self) -> bool {
        let state = *self.state.borrow();
        self.client.session().is_some()
            && !matches!(
                state,
                ConnectionState::Disconnected | ConnectionState::Closed
            )
    }

    pub fn last_error(&self) -> &LastError {
        &self.errors
    }
}

impl SessionProvider for ConnectionManager {
    async fn session(&self, renew: bool) -> Result<Arc<Session>, arlo_api::Error> {
        if !renew {
            if let Some(session) = self.client.session().filter(|s| !s.is_expired()) {
                return Ok(session);
            }
        }

        let _guard = self.login_lock.lock().await;
        if !renew {
            // Another caller may have logged in while we waited.
            if let Some(session) = self.client.session().filter(|s| !s.is_expired()) {
                return Ok(session);
            }
        }
        info!(renew, "re-authenticating for event stream");
        self.login_locked().await
    }
}

/// Reflect reader state changes in the connection state.
async fn mirror_stream_state(
    weak: Weak<ConnectionManager>,
    mut stream: watch::Receiver<StreamState>,
) {
    while stream.changed().await.is_ok() {
        let next = *stream.borrow_and_update();
        let Some(manager) = weak.upgrade() else {
            break;
        };
        let mapped = match next {
            StreamState::Connected => ConnectionState::Connected,
            StreamState::Reconnecting { attempt } => ConnectionState::Reconnecting { attempt },
            StreamState::Connecting => continue,
            StreamState::Stopped => break,
        };
        manager.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == mapped {
                return false;
            }
            *current = mapped;
            true
        });
    }
}
