// Authentication
//
// Credential exchange against the auth host, an optional second-factor
// challenge, and session validation against the device API. The
// resulting token is held by the client and attached to every request.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use reqwest::header::AUTHORIZATION;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info};

use crate::client::ArloClient;
use crate::error::Error;
use crate::models::{
    AuthData, AuthEnvelope, Factor, FactorList, FinishAuth, SessionData, StartAuth,
};
use crate::twofactor::{TwoFactorSettings, TwoFactorSource, obtain_code};

const AUTH_PATH: &str = "/api/auth";
const FACTORS_PATH: &str = "/api/getFactors";
const START_AUTH_PATH: &str = "/api/startAuth";
const FINISH_AUTH_PATH: &str = "/api/finishAuth";
const SESSION_PATH: &str = "/hmsweb/users/session/v2";
const LOGOUT_PATH: &str = "/hmsweb/logout";

/// An authenticated session.
#[derive(Clone)]
pub struct Session {
    token: SecretString,
    pub user_id: String,
    /// Identity commands are sent `from`: `<user_id>_web`.
    pub web_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(token: SecretString, user_id: String, expires_at: Option<DateTime<Utc>>) -> Self {
        let web_id = format!("{user_id}_web");
        Self {
            token,
            user_id,
            web_id,
            issued_at: Utc::now(),
            expires_at,
        }
    }

    /// Whether the service will have stopped accepting the token.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }

    /// Value for the `Authorization` header.
    pub fn token_header(&self) -> &str {
        self.token.expose_secret()
    }
}

impl ArloClient {
    /// Log in with username and password, answering a second-factor
    /// challenge from `source` if the account requires one.
    ///
    /// On success the session is stored in the client and used for all
    /// subsequent requests.
    pub async fn login(
        &self,
        username: &str,
        password: &SecretString,
        tfa: &TwoFactorSettings,
        source: &dyn TwoFactorSource,
    ) -> Result<Arc<Session>, Error> {
        let url = self.auth_host().join(AUTH_PATH)?;
        debug!("logging in at {}", url);

        let body = json!({
            "email": username,
            "password": BASE64.encode(password.expose_secret()),
            "language": "en",
            "EnvSource": "prod",
        });

        let resp = self
            .http()
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(e, self.timeout_secs()))?;

        let auth: AuthData = self.parse_auth(resp).await?;

        let (token, expires_in) = if auth.auth_completed {
            (auth.token, auth.expires_in)
        } else {
            info!(kind = tfa.kind.factor_type(), "second factor required");
            let finished = self.second_factor(&auth, tfa, source).await?;
            (finished.token, finished.expires_in.or(auth.expires_in))
        };

        let token = SecretString::from(token);
        let user_id = self.validate_session(&token).await?;
        let expires_at = expires_in.and_then(|secs| DateTime::from_timestamp(secs, 0));

        info!(user_id = %user_id, "login successful");
        Ok(self.store_session(Session::new(token, user_id, expires_at)))
    }

    /// End the current session. Calling it without a session is a no-op.
    pub async fn logout(&self) -> Result<(), Error> {
        let Some(session) = self.take_session() else {
            debug!("logout: no session");
            return Ok(());
        };

        let url = self.host().join(LOGOUT_PATH)?;
        debug!("logging out at {}", url);

        self.http()
            .put(url)
            .header(AUTHORIZATION, session.token_header())
            .send()
            .await
            .map_err(|e| Error::from_reqwest(e, self.timeout_secs()))?;

        debug!("logout complete");
        Ok(())
    }

    // ── Second factor ────────────────────────────────────────────────

    async fn second_factor(
        &self,
        auth: &AuthData,
        tfa: &TwoFactorSettings,
        source: &dyn TwoFactorSource,
    ) -> Result<FinishAuth, Error> {
        let mut url = self.auth_host().join(FACTORS_PATH)?;
        url.query_pairs_mut()
            .append_pair("data", &auth.issued.unwrap_or_default().to_string());

        let resp = self
            .http()
            .get(url)
            .header(AUTHORIZATION, auth.token.as_str())
            .send()
            .await
            .map_err(|e| Error::from_reqwest(e, self.timeout_secs()))?;
        let factors: FactorList = self.parse_auth(resp).await?;

        let factor = pick_factor(&factors.items, tfa)?;
        debug!(factor = ?factor.display_name, "starting second-factor challenge");

        let challenge_at = Utc::now();
        let resp = self
            .http()
            .post(self.auth_host().join(START_AUTH_PATH)?)
            .header(AUTHORIZATION, auth.token.as_str())
            .json(&json!({
                "factorId": factor.factor_id,
                "factorType": factor.factor_type,
                "userId": auth.user_id,
            }))
            .send()
            .await
            .map_err(|e| Error::from_reqwest(e, self.timeout_secs()))?;
        let started: StartAuth = self.parse_auth(resp).await?;

        let otp = obtain_code(source, tfa, challenge_at).await?;

        let resp = self
            .http()
            .post(self.auth_host().join(FINISH_AUTH_PATH)?)
            .header(AUTHORIZATION, auth.token.as_str())
            .json(&json!({
                "factorAuthCode": started.factor_auth_code,
                "otp": otp,
            }))
            .send()
            .await
            .map_err(|e| Error::from_reqwest(e, self.timeout_secs()))?;

        self.parse_auth(resp).await
    }

    /// Confirm the token against the device API and learn the user id.
    async fn validate_session(&self, token: &SecretString) -> Result<String, Error> {
        let url = self.host().join(SESSION_PATH)?;
        let resp = self
            .http()
            .get(url)
            .header(AUTHORIZATION, token.expose_secret())
            .send()
            .await
            .map_err(|e| Error::from_reqwest(e, self.timeout_secs()))?;

        if !resp.status().is_success() {
            return Err(Error::Authentication {
                message: format!("session validation failed (HTTP {})", resp.status()),
            });
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::from_reqwest(e, self.timeout_secs()))?;
        let data = body.get("data").cloned().unwrap_or_default();
        let session: SessionData =
            serde_json::from_value(data).map_err(|e| Error::Deserialization {
                message: e.to_string(),
                body: body.to_string(),
            })?;
        Ok(session.user_id)
    }

    /// Unwrap the auth host's `{ meta, data }` envelope.
    ///
    /// Any non-200 code from the auth host is a credential failure.
    async fn parse_auth<T: DeserializeOwned>(&self, resp: reqwest::Response) -> Result<T, Error> {
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| Error::from_reqwest(e, self.timeout_secs()))?;

        let envelope: AuthEnvelope<T> = match serde_json::from_str(&body) {
            Ok(env) => env,
            Err(_) if !status.is_success() => {
                return Err(Error::Authentication {
                    message: format!("HTTP {status}: {body}"),
                });
            }
            Err(e) => {
                return Err(Error::Deserialization {
                    message: e.to_string(),
                    body,
                });
            }
        };

        if envelope.meta.code != 200 || !status.is_success() {
            return Err(Error::Authentication {
                message: envelope
                    .meta
                    .message
                    .unwrap_or_else(|| format!("code {}", envelope.meta.code)),
            });
        }

        envelope.data.ok_or_else(|| Error::Deserialization {
            message: "auth response without data".into(),
            body: String::new(),
        })
    }
}

fn pick_factor<'a>(factors: &'a [Factor], tfa: &TwoFactorSettings) -> Result<&'a Factor, Error> {
    let wanted = tfa.kind.factor_type();
    factors
        .iter()
        .find(|f| f.factor_type.eq_ignore_ascii_case(wanted))
        .ok_or_else(|| Error::TwoFactorUnavailable(format!("no {wanted} factor on the account")))
}
