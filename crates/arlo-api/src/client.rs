// Request/response API client
//
// Wraps `reqwest::Client` with session-token injection, envelope
// unwrapping and timeout classification. Login and logout live in
// `auth.rs` as inherent methods to keep this module on transport mechanics.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::Utc;
use reqwest::header::AUTHORIZATION;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::auth::Session;
use crate::error::Error;
use crate::models::{ApiEnvelope, DeviceInfo};
use crate::transport::TransportConfig;

/// Device list endpoint.
pub const DEVICES_PATH: &str = "/hmsweb/users/devices";
/// Command endpoint; the target device id is appended.
pub const NOTIFY_PATH: &str = "/hmsweb/users/devices/notify/";

/// Where the client talks to.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Device API root, e.g. `https://my.arlo.com`.
    pub host: Url,
    /// Authentication root, e.g. `https://ocapi-app.arlo.com`.
    pub auth_host: Url,
    pub transport: TransportConfig,
}

/// The device a command is addressed to.
#[derive(Debug, Clone, Copy)]
pub struct NotifyTarget<'a> {
    pub device_id: &'a str,
    pub xcloud_id: &'a str,
}

/// HTTP client for the request/response API.
///
/// Holds the current [`Session`]; every request after `login` carries
/// its token. The session is swapped atomically so the push reader and
/// refresh jobs can share one client.
pub struct ArloClient {
    http: reqwest::Client,
    host: Url,
    auth_host: Url,
    timeout_secs: u64,
    session: ArcSwapOption<Session>,
}

impl ArloClient {
    /// Create a new client from a `ClientConfig`.
    ///
    /// If the transport doesn't already include a cookie jar, one is
    /// created automatically.
    pub fn new(config: &ClientConfig) -> Result<Self, Error> {
        let transport = if config.transport.cookie_jar.is_some() {
            config.transport.clone()
        } else {
            config.transport.clone().with_cookie_jar()
        };
        let http = transport.build_client()?;
        Ok(Self::with_client(
            http,
            config.host.clone(),
            config.auth_host.clone(),
            transport.timeout_secs(),
        ))
    }

    /// Create a client with a pre-built `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, host: Url, auth_host: Url, timeout_secs: u64) -> Self {
        Self {
            http,
            host,
            auth_host,
            timeout_secs,
            session: ArcSwapOption::empty(),
        }
    }

    /// The underlying HTTP client (for auth flows that need direct access).
    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn host(&self) -> &Url {
        &self.host
    }

    pub fn auth_host(&self) -> &Url {
        &self.auth_host
    }

    pub(crate) fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    /// The current session, if logged in.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.load_full()
    }

    pub(crate) fn store_session(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        self.session.store(Some(Arc::clone(&session)));
        session
    }

    pub(crate) fn take_session(&self) -> Option<Arc<Session>> {
        self.session.swap(None)
    }

    fn require_session(&self) -> Result<Arc<Session>, Error> {
        self.session().ok_or(Error::NotAuthenticated)
    }

    // ── Requests ─────────────────────────────────────────────────────

    /// Authenticated GET of `path` under the device API root.
    ///
    /// Returns the unwrapped `data` payload. Never retried.
    pub async fn get(&self, path: &str) -> Result<Value, Error> {
        let session = self.require_session()?;
        let url = self.host.join(path)?;
        debug!("GET {}", url);

        let resp = self
            .http
            .get(url)
            .header(AUTHORIZATION, session.token_header())
            .send()
            .await
            .map_err(|e| Error::from_reqwest(e, self.timeout_secs))?;

        self.parse_envelope(resp).await
    }

    /// GET and deserialize the payload.
    pub async fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let data = self.get(path).await?;
        serde_json::from_value(data.clone()).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: data.to_string(),
        })
    }

    /// Send a command to a device (normally a base station), which answers
    /// on the push channel.
    ///
    /// The body is stamped with `to`, `from` and a fresh `transId`; the
    /// `transId` is returned so the caller can correlate the response.
    pub async fn notify(&self, target: NotifyTarget<'_>, body: Value) -> Result<String, Error> {
        let session = self.require_session()?;
        let url = self.host.join(&format!("{NOTIFY_PATH}{}", target.device_id))?;
        let trans_id = new_trans_id();

        let mut body = body;
        if let Some(obj) = body.as_object_mut() {
            obj.insert("to".into(), Value::String(target.device_id.to_owned()));
            obj.insert("from".into(), Value::String(session.web_id.clone()));
            obj.insert("transId".into(), Value::String(trans_id.clone()));
        }

        debug!(trans_id = %trans_id, "POST {}", url);

        let resp = self
            .http
            .post(url)
            .header(AUTHORIZATION, session.token_header())
            .header("xcloudId", target.xcloud_id)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(e, self.timeout_secs))?;

        self.parse_envelope(resp).await?;
        Ok(trans_id)
    }

    /// Enumerate the account's devices.
    pub async fn devices(&self) -> Result<Vec<DeviceInfo>, Error> {
        let path = format!("{DEVICES_PATH}?t={}", Utc::now().timestamp_millis());
        self.get_as(&path).await
    }

    /// Parse the `{ success, data }` envelope.
    async fn parse_envelope(&self, resp: reqwest::Response) -> Result<Value, Error> {
        let status = resp.status();

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::SessionExpired);
        }

        let body = resp
            .text()
            .await
            .map_err(|e| Error::from_reqwest(e, self.timeout_secs))?;

        if !status.is_success() {
            return Err(Error::Api {
                status: Some(status.as_u16()),
                message: body,
            });
        }

        let envelope: ApiEnvelope =
            serde_json::from_str(&body).map_err(|e| Error::Deserialization {
                message: e.to_string(),
                body: body.clone(),
            })?;

        envelope.into_result(status.as_u16())
    }
}

/// Transaction id in the service's `web!<random>!<millis>` form.
fn new_trans_id() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "web!{}!{}",
        &random[..8],
        Utc::now().timestamp_millis()
    )
}
