//! Push event channel with auto-reconnect.
//!
//! Connects to the service's WebSocket subscription endpoint and hands
//! every parsed [`Packet`] to a [`PacketHandler`], strictly in arrival
//! order, on one dedicated task. The connection is re-established when:
//!
//! - the socket errors or the server closes it (exponential backoff + jitter),
//! - no packet arrives within the idle bound,
//! - the periodic renewal interval elapses (a fresh session is requested).
//!
//! The renewal clock starts at each fresh login and runs across
//! reconnects, so idle reconnects never postpone it.
//!
//! Malformed frames are logged and counted; they never tear down the stream.
//!
//! # Example
//!
//! ```rust,ignore
//! use arlo_api::stream::{EventStreamHandle, StreamConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = StreamConfig::new(url);
//! let handle = EventStreamHandle::spawn(config, sessions, handler, CancellationToken::new());
//! // ...
//! handle.shutdown();
//! handle.join().await;
//! ```

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::{LineWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use crate::auth::Session;
use crate::error::Error;
use crate::packet::{Frame, Packet};

// ── Seams ────────────────────────────────────────────────────────────

/// Receives packets from the reader task.
///
/// Called synchronously, one packet at a time, in arrival order. A slow
/// handler delays the next read.
pub trait PacketHandler: Send + Sync + 'static {
    fn handle(&self, packet: Packet);
}

/// Supplies the session the stream authenticates with.
///
/// `renew` is set when the previous session was rejected or the periodic
/// renewal interval elapsed; the provider should log in again rather than
/// return the cached session.
pub trait SessionProvider: Send + Sync + 'static {
    fn session(&self, renew: bool) -> impl Future<Output = Result<Arc<Session>, Error>> + Send;
}

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for reconnection. Retries are unbounded.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt, and the minimum wait
    /// between any two connection attempts. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

// ── StreamConfig ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: Url,
    /// Reconnect when no packet arrives for this long. Control frames and
    /// pings do not count. `None` disables.
    pub idle_timeout: Option<Duration>,
    /// Re-authenticate and reconnect on this cadence. `None` disables.
    pub reconnect_every: Option<Duration>,
    pub backoff: ReconnectConfig,
    /// Append every accepted packet as a JSON line to this file.
    pub dump_file: Option<PathBuf>,
}

impl StreamConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            idle_timeout: None,
            reconnect_every: None,
            backoff: ReconnectConfig::default(),
            dump_file: None,
        }
    }
}

// ── State & counters ─────────────────────────────────────────────────

/// Lifecycle of the reader task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Stopped,
}

/// Counters maintained by the reader task.
#[derive(Debug, Default)]
pub struct StreamStats {
    connects: AtomicU64,
    reconnects: AtomicU64,
    idle_reconnects: AtomicU64,
    packets: AtomicU64,
    dropped: AtomicU64,
}

impl StreamStats {
    /// Successful WebSocket handshakes.
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Times the reader tore a connection down (or failed one) and tried again.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Reconnects caused by the idle bound.
    pub fn idle_reconnects(&self) -> u64 {
        self.idle_reconnects.load(Ordering::Relaxed)
    }

    /// Packets handed to the handler.
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    /// Frames discarded as malformed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ── EventStreamHandle ────────────────────────────────────────────────

/// Handle to a running push-channel reader.
pub struct EventStreamHandle {
    state: watch::Receiver<StreamState>,
    stats: Arc<StreamStats>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl EventStreamHandle {
    /// Spawn the reader task. Returns immediately; the first connection
    /// attempt happens in the background.
    pub fn spawn<P, H>(
        config: StreamConfig,
        sessions: Arc<P>,
        handler: Arc<H>,
        cancel: CancellationToken,
    ) -> Self
    where
        P: SessionProvider,
        H: PacketHandler,
    {
        let (state_tx, state) = watch::channel(StreamState::Connecting);
        let stats = Arc::new(StreamStats::default());
        let tracker = TaskTracker::new();

        let reader = Reader {
            config,
            sessions,
            handler,
            stats: Arc::clone(&stats),
            state_tx,
            cancel: cancel.clone(),
            dump: None,
        };
        tracker.spawn(reader.run());
        tracker.close();

        Self {
            state,
            stats,
            cancel,
            tracker,
        }
    }

    pub fn state(&self) -> watch::Receiver<StreamState> {
        self.state.clone()
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        Arc::clone(&self.stats)
    }

    /// Signal the reader to stop. The current connection is dropped.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for the reader task to exit.
    pub async fn join(&self) {
        self.tracker.wait().await;
    }
}

// ── Background reconnection loop ─────────────────────────────────────

/// Why a connection ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disconnect {
    Closed,
    Idle,
    Renewal,
    Cancelled,
}

struct Reader<P, H> {
    config: StreamConfig,
    sessions: Arc<P>,
    handler: Arc<H>,
    stats: Arc<StreamStats>,
    state_tx: watch::Sender<StreamState>,
    cancel: CancellationToken,
    dump: Option<LineWriter<File>>,
}

impl<P: SessionProvider, H: PacketHandler> Reader<P, H> {
    /// Main loop: session → connect → read → on disconnect, wait → repeat.
    async fn run(mut self) {
        self.dump = self.config.dump_file.as_ref().and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map(LineWriter::new)
                .inspect_err(|e| {
                    tracing::warn!(path = %path.display(), error = %e, "cannot open packet dump");
                })
                .ok()
        });

        let cancel = self.cancel.clone();
        let mut attempt: u32 = 0;
        let mut renew = false;
        let mut renew_at: Option<Instant> = None;

        loop {
            if renew_at.is_some_and(|at| Instant::now() >= at) {
                renew = true;
            }

            let session = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                s = self.sessions.session(renew) => s,
            };

            let outcome = match session {
                Ok(session) => {
                    if renew || renew_at.is_none() {
                        renew_at = self.config.reconnect_every.map(|every| Instant::now() + every);
                    }
                    renew = false;
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        r = self.connect_and_read(&session, renew_at) => r,
                    }
                }
                Err(e) => Err(e),
            };

            let delay = match outcome {
                Ok(Disconnect::Cancelled) => break,
                Ok(Disconnect::Closed) => {
                    tracing::info!("event stream closed by server, reconnecting");
                    attempt = 0;
                    self.config.backoff.initial_delay
                }
                Ok(Disconnect::Idle) => {
                    attempt = 0;
                    self.config.backoff.initial_delay
                }
                Ok(Disconnect::Renewal) => {
                    renew = true;
                    attempt = 0;
                    self.config.backoff.initial_delay
                }
                Err(e) => {
                    if e.is_auth_expired() {
                        renew = true;
                    }
                    tracing::warn!(error = %e, attempt, "event stream error");
                    let delay = calculate_backoff(attempt, &self.config.backoff);
                    attempt = attempt.saturating_add(1);
                    delay
                }
            };

            StreamStats::bump(&self.stats.reconnects);
            self.state_tx.send_replace(StreamState::Reconnecting {
                attempt: attempt.max(1),
            });
            tracing::debug!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                attempt,
                "waiting before reconnect"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.state_tx.send_replace(StreamState::Stopped);
        tracing::debug!("event stream reader exiting");
    }

    // ── Single connection lifecycle ──────────────────────────────────

    async fn connect_and_read(
        &mut self,
        session: &Session,
        renew_at: Option<Instant>,
    ) -> Result<Disconnect, Error> {
        tracing::info!(url = %self.config.url, "connecting event stream");

        let uri: tungstenite::http::Uri = self
            .config
            .url
            .as_str()
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| Error::StreamConnect(e.to_string()))?;

        let request =
            ClientRequestBuilder::new(uri).with_header("Authorization", session.token_header());

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| match e {
                tungstenite::Error::Http(resp) if resp.status() == 401 => Error::SessionExpired,
                other => Error::StreamConnect(other.to_string()),
            })?;

        StreamStats::bump(&self.stats.connects);
        self.state_tx.send_replace(StreamState::Connected);
        tracing::info!("event stream connected");

        let (_write, mut read) = ws_stream.split();
        let cancel = self.cancel.clone();
        let idle_timeout = self.config.idle_timeout;
        let mut idle_at = idle_timeout.map(|d| Instant::now() + d);

        loop {
            let idle = async move {
                match idle_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            let renewal = async move {
                match renew_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(Disconnect::Cancelled),
                () = renewal => {
                    tracing::info!("session renewal due, reconnecting event stream");
                    return Ok(Disconnect::Renewal);
                }
                () = idle => {
                    StreamStats::bump(&self.stats.idle_reconnects);
                    tracing::warn!(
                        idle_secs = idle_timeout.map_or(0, |d| d.as_secs()),
                        "event stream idle, reconnecting"
                    );
                    return Ok(Disconnect::Idle);
                }
                frame = read.next() => match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        if self.accept(text.as_str()) {
                            idle_at = idle_timeout.map(|d| Instant::now() + d);
                        }
                    }
                    Some(Ok(tungstenite::Message::Ping(_))) => {
                        tracing::trace!("event stream ping");
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        if let Some(ref cf) = frame {
                            tracing::info!(code = %cf.code, reason = %cf.reason, "close frame received");
                        }
                        return Ok(Disconnect::Closed);
                    }
                    Some(Err(e)) => return Err(Error::StreamConnect(e.to_string())),
                    None => return Ok(Disconnect::Closed),
                    _ => {}
                },
            }
        }
    }

    // ── Frame handling ───────────────────────────────────────────────

    /// Returns `true` when a packet reached the handler.
    fn accept(&mut self, text: &str) -> bool {
        match Frame::parse(text) {
            Ok(Frame::Packet(packet)) => {
                StreamStats::bump(&self.stats.packets);
                self.record(text);
                tracing::trace!(resource = %packet.resource, action = %packet.action, "packet");
                self.handler.handle(packet);
                true
            }
            Ok(Frame::Control { status }) => {
                tracing::debug!(status, "event stream control frame");
                false
            }
            Err(e) => {
                StreamStats::bump(&self.stats.dropped);
                tracing::warn!(error = %e, "dropping malformed frame");
                false
            }
        }
    }

    fn record(&mut self, text: &str) {
        let Some(out) = self.dump.as_mut() else {
            return;
        };
        let line = text.replace(['\n', '\r'], "");
        if let Err(e) = writeln!(out, "{line}") {
            tracing::warn!(error = %e, "packet dump failed, disabling");
            self.dump = None;
        }
    }
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with jitter, never below `initial_delay`.
///
/// `delay = max(min(initial * 2^attempt, max) * jitter, initial)`, with
/// jitter in +-25% derived from the attempt number.
pub(crate) fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powf(f64::from(attempt.min(30)));
    let capped = base.min(config.max_delay.as_secs_f64());

    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    let with_jitter = (capped * jitter_factor).max(config.initial_delay.as_secs_f64());

    Duration::from_secs_f64(with_jitter)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Packet>>);

    impl PacketHandler for Recorder {
        fn handle(&self, packet: Packet) {
            self.0.lock().unwrap().push(packet);
        }
    }

    struct NoSessions;

    impl SessionProvider for NoSessions {
        async fn session(&self, _renew: bool) -> Result<Arc<Session>, Error> {
            Err(Error::NotAuthenticated)
        }
    }

    fn reader(dump: Option<PathBuf>) -> Reader<NoSessions, Recorder> {
        let mut config = StreamConfig::new(Url::parse("ws://127.0.0.1:1/").unwrap());
        config.dump_file = dump;
        let (state_tx, _) = watch::channel(StreamState::Connecting);
        Reader {
            config,
            sessions: Arc::new(NoSessions),
            handler: Arc::new(Recorder::default()),
            stats: Arc::new(StreamStats::default()),
            state_tx,
            cancel: CancellationToken::new(),
            dump: None,
        }
    }

    #[test]
    fn backoff_increases_and_caps() {
        let config = ReconnectConfig::default();

        let d0 = calculate_backoff(0, &config);
        let d1 = calculate_backoff(1, &config);
        let d2 = calculate_backoff(2, &config);
        assert!(d1 > d0, "d1 ({d1:?}) should be greater than d0 ({d0:?})");
        assert!(d2 > d1, "d2 ({d2:?}) should be greater than d1 ({d1:?})");

        let d10 = calculate_backoff(10, &config);
        assert!(d10 <= Duration::from_secs(38), "capped near max_delay, got {d10:?}");
    }

    #[test]
    fn backoff_never_below_initial_delay() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(200),
        };
        for attempt in 0..20 {
            assert!(calculate_backoff(attempt, &config) >= Duration::from_millis(200));
        }
    }

    #[test]
    fn accept_dispatches_in_order_and_counts_drops() {
        let mut r = reader(None);

        assert!(r.accept(r#"{"action":"is","resource":"cameras/A","properties":{"n":1}}"#));
        assert!(!r.accept("{ not json"));
        assert!(!r.accept(r#"{"status":"connected"}"#));
        assert!(r.accept(r#"{"action":"is","resource":"cameras/B","properties":{"n":2}}"#));

        let seen = r.handler.0.lock().unwrap();
        let resources: Vec<&str> = seen.iter().map(|p| p.resource.as_str()).collect();
        assert_eq!(resources, ["cameras/A", "cameras/B"]);
        assert_eq!(r.stats.packets(), 2);
        assert_eq!(r.stats.dropped(), 1);
    }

    #[tokio::test]
    async fn accepted_packets_are_dumped_as_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("packets.dump");
        let mut r = reader(Some(path.clone()));
        r.dump = Some(LineWriter::new(File::create(&path).unwrap()));

        r.accept("{\"action\":\"is\",\n\"resource\":\"lights/L1\",\"properties\":{}}");
        r.accept("garbage");
        drop(r);

        let dumped = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = dumped.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("lights/L1"));
    }
}
