#![allow(clippy::unwrap_used)]
// Integration tests for the push-channel reader against an in-process
// WebSocket server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use url::Url;

use arlo_api::{
    Error, EventStreamHandle, Packet, PacketHandler, ReconnectConfig, Session, SessionProvider,
    StreamConfig, StreamState,
};

// ── Helpers ─────────────────────────────────────────────────────────

/// What the server does with one accepted connection.
enum Script {
    /// Send frames, then stay open and silent.
    SendThenHold(Vec<String>),
    /// Send frames, then close.
    SendThenClose(Vec<String>),
    /// Send frames, then a control frame every 100ms until the client leaves.
    SendThenHeartbeat(Vec<String>),
    /// Refuse the handshake with 401.
    RejectUnauthorized,
}

struct FixedSession;

impl SessionProvider for FixedSession {
    async fn session(&self, _renew: bool) -> Result<Arc<Session>, Error> {
        Ok(Arc::new(Session::new(
            SecretString::from("tok".to_string()),
            "U1".into(),
            None,
        )))
    }
}

/// Records the `renew` flag of every session request.
#[derive(Default)]
struct CountingSessions(Mutex<Vec<bool>>);

impl CountingSessions {
    fn requests(&self) -> Vec<bool> {
        self.0.lock().unwrap().clone()
    }

    fn renewals(&self) -> usize {
        self.requests().into_iter().filter(|renew| *renew).count()
    }
}

impl SessionProvider for CountingSessions {
    async fn session(&self, renew: bool) -> Result<Arc<Session>, Error> {
        self.0.lock().unwrap().push(renew);
        FixedSession.session(renew).await
    }
}

struct Forward(mpsc::UnboundedSender<Packet>);

impl PacketHandler for Forward {
    fn handle(&self, packet: Packet) {
        let _ = self.0.send(packet);
    }
}

fn packet(resource: &str, n: u64) -> String {
    json!({ "action": "is", "resource": resource, "properties": { "n": n } }).to_string()
}

/// Serve `scripts` to successive connections; records the Authorization
/// header of each handshake.
async fn serve(scripts: Vec<Script>) -> (Url, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let auth_headers = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&auth_headers);

    tokio::spawn(async move {
        for script in scripts {
            let (tcp, _) = listener.accept().await.unwrap();
            let seen = Arc::clone(&seen);
            let reject = matches!(script, Script::RejectUnauthorized);
            let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let value = req
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_owned();
                seen.lock().unwrap().push(value);
                if reject {
                    let mut refused = ErrorResponse::new(None);
                    *refused.status_mut() = StatusCode::UNAUTHORIZED;
                    return Err(refused);
                }
                Ok(resp)
            };
            let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(tcp, callback).await else {
                continue;
            };

            match script {
                Script::SendThenHold(frames) => {
                    for frame in frames {
                        ws.send(Message::text(frame)).await.unwrap();
                    }
                    tokio::spawn(async move { while ws.next().await.is_some() {} });
                }
                Script::SendThenClose(frames) => {
                    for frame in frames {
                        ws.send(Message::text(frame)).await.unwrap();
                    }
                    let _ = ws.close(None).await;
                }
                Script::SendThenHeartbeat(frames) => {
                    for frame in frames {
                        ws.send(Message::text(frame)).await.unwrap();
                    }
                    tokio::spawn(async move {
                        let status = json!({ "status": "connected" }).to_string();
                        loop {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            if ws.send(Message::text(status.clone())).await.is_err() {
                                break;
                            }
                        }
                    });
                }
                Script::RejectUnauthorized => {}
            }
        }
    });

    let url = Url::parse(&format!("ws://{addr}/hmsweb/client/subscribe")).unwrap();
    (url, auth_headers)
}

fn config(url: Url) -> StreamConfig {
    let mut config = StreamConfig::new(url);
    config.backoff = ReconnectConfig {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
    };
    config
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Packet>) -> Packet {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("packet within 5s")
        .expect("channel open")
}

fn spawn(config: StreamConfig) -> (EventStreamHandle, mpsc::UnboundedReceiver<Packet>) {
    spawn_with(config, Arc::new(FixedSession))
}

fn spawn_with<P: SessionProvider>(
    config: StreamConfig,
    sessions: Arc<P>,
) -> (EventStreamHandle, mpsc::UnboundedReceiver<Packet>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = EventStreamHandle::spawn(
        config,
        sessions,
        Arc::new(Forward(tx)),
        CancellationToken::new(),
    );
    (handle, rx)
}

/// Poll `cond` every 20ms for up to 5s.
async fn eventually(what: &str, cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_packets_arrive_in_order_with_token() {
    let (url, auth) = serve(vec![Script::SendThenHold(vec![
        packet("cameras/A", 1),
        packet("cameras/B", 2),
        packet("lights/C", 3),
    ])])
    .await;

    let (handle, mut rx) = spawn(config(url));

    let order: Vec<String> = vec![
        next(&mut rx).await.resource,
        next(&mut rx).await.resource,
        next(&mut rx).await.resource,
    ];
    assert_eq!(order, ["cameras/A", "cameras/B", "lights/C"]);
    assert_eq!(auth.lock().unwrap().as_slice(), ["tok"]);
    assert_eq!(*handle.state().borrow(), StreamState::Connected);

    handle.shutdown();
    handle.join().await;
}

#[tokio::test]
async fn test_malformed_frame_does_not_kill_stream() {
    let (url, _) = serve(vec![Script::SendThenHold(vec![
        "{ this is not json".into(),
        json!({ "status": "connected" }).to_string(),
        packet("cameras/A", 1),
    ])])
    .await;

    let (handle, mut rx) = spawn(config(url));

    let pkt = next(&mut rx).await;
    assert_eq!(pkt.resource, "cameras/A");

    let stats = handle.stats();
    assert_eq!(stats.dropped(), 1);
    assert_eq!(stats.packets(), 1);
    assert_eq!(stats.connects(), 1);
    assert_eq!(stats.reconnects(), 0);

    handle.shutdown();
    handle.join().await;
}

#[tokio::test]
async fn test_idle_stream_reconnects_once_before_next_packet() {
    let (url, auth) = serve(vec![
        Script::SendThenHold(vec![packet("cameras/A", 1)]),
        Script::SendThenHold(vec![packet("cameras/A", 2)]),
    ])
    .await;

    let mut config = config(url);
    config.idle_timeout = Some(Duration::from_millis(500));
    let (handle, mut rx) = spawn(config);

    let first = next(&mut rx).await;
    assert_eq!(first.properties["n"], 1);
    assert_eq!(handle.stats().idle_reconnects(), 0);

    let second = next(&mut rx).await;
    assert_eq!(second.properties["n"], 2);

    let stats = handle.stats();
    assert_eq!(stats.idle_reconnects(), 1);
    assert_eq!(stats.reconnects(), 1);
    assert_eq!(stats.connects(), 2);
    assert_eq!(auth.lock().unwrap().len(), 2);

    handle.shutdown();
    handle.join().await;
}

#[tokio::test]
async fn test_server_close_triggers_reconnect() {
    let (url, _) = serve(vec![
        Script::SendThenClose(vec![packet("doorbells/D", 1)]),
        Script::SendThenHold(vec![packet("doorbells/D", 2)]),
    ])
    .await;

    let (handle, mut rx) = spawn(config(url));

    assert_eq!(next(&mut rx).await.properties["n"], 1);
    assert_eq!(next(&mut rx).await.properties["n"], 2);
    assert_eq!(handle.stats().connects(), 2);
    assert_eq!(handle.stats().idle_reconnects(), 0);

    handle.shutdown();
    handle.join().await;
}

#[tokio::test]
async fn test_shutdown_stops_reader() {
    let (url, _) = serve(vec![Script::SendThenHold(vec![packet("cameras/A", 1)])]).await;

    let (handle, mut rx) = spawn(config(url));
    next(&mut rx).await;

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(2), handle.join())
        .await
        .expect("reader exits after shutdown");
    assert_eq!(*handle.state().borrow(), StreamState::Stopped);
}

#[tokio::test]
async fn test_control_frames_do_not_hold_off_idle_reconnect() {
    let (url, _) = serve(vec![
        Script::SendThenHeartbeat(vec![packet("cameras/A", 1)]),
        Script::SendThenHold(vec![packet("cameras/A", 2)]),
    ])
    .await;

    let mut config = config(url);
    config.idle_timeout = Some(Duration::from_millis(400));
    let (handle, mut rx) = spawn(config);

    assert_eq!(next(&mut rx).await.properties["n"], 1);
    assert_eq!(next(&mut rx).await.properties["n"], 2);
    assert_eq!(handle.stats().idle_reconnects(), 1);

    handle.shutdown();
    handle.join().await;
}

#[tokio::test]
async fn test_renewal_fires_across_idle_reconnects() {
    let (url, _) = serve((0..40).map(|_| Script::SendThenHold(Vec::new())).collect()).await;

    let mut config = config(url);
    config.idle_timeout = Some(Duration::from_millis(200));
    config.reconnect_every = Some(Duration::from_millis(700));
    let sessions = Arc::new(CountingSessions::default());
    let (handle, _rx) = spawn_with(config, Arc::clone(&sessions));

    eventually("a forced renewal", || sessions.renewals() >= 1).await;
    assert!(handle.stats().idle_reconnects() >= 1);
    assert_eq!(sessions.requests().first(), Some(&false));

    handle.shutdown();
    handle.join().await;
}

#[tokio::test]
async fn test_unauthorized_handshake_renews_session_once() {
    let (url, auth) = serve(vec![
        Script::RejectUnauthorized,
        Script::SendThenHold(vec![packet("lights/L1", 1)]),
    ])
    .await;

    let sessions = Arc::new(CountingSessions::default());
    let (handle, mut rx) = spawn_with(config(url), Arc::clone(&sessions));

    assert_eq!(next(&mut rx).await.resource, "lights/L1");
    assert_eq!(sessions.requests(), [false, true]);
    assert_eq!(auth.lock().unwrap().len(), 2);
    assert_eq!(handle.stats().connects(), 1);

    handle.shutdown();
    handle.join().await;
}
