// Wire models for the request/response API.
//
// Two envelopes are in play: the auth host wraps payloads as
// `{ meta: { code }, data }`, the device API as `{ success, data }`.
// Both are stripped before callers see the payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

// ── Envelopes ───────────────────────────────────────────────────────

/// `{ success, data }` envelope returned by the device API.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiEnvelope {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Value,
}

impl ApiEnvelope {
    /// Return `data` on success, or an [`Error::Api`] built from the
    /// error payload the service puts in `data`.
    pub(crate) fn into_result(self, status: u16) -> Result<Value, Error> {
        if self.success {
            return Ok(self.data);
        }
        Err(Error::Api {
            status: Some(status),
            message: error_message(&self.data),
        })
    }
}

/// `{ meta: { code, message }, data }` envelope returned by the auth host.
#[derive(Debug, Deserialize)]
pub(crate) struct AuthEnvelope<T> {
    pub meta: AuthMeta,
    pub data: Option<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AuthMeta {
    pub code: u16,
    #[serde(default)]
    pub message: Option<String>,
}

fn error_message(data: &Value) -> String {
    ["message", "reason", "error"]
        .iter()
        .find_map(|k| data.get(k).and_then(Value::as_str))
        .map_or_else(|| "request rejected".to_owned(), str::to_owned)
}

// ── Auth payloads ───────────────────────────────────────────────────

/// Result of the credential exchange.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuthData {
    pub token: String,
    pub user_id: String,
    /// Unix seconds the token was issued; echoed back when listing factors.
    #[serde(default)]
    pub issued: Option<i64>,
    /// Unix seconds the token stops being accepted.
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub auth_completed: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FactorList {
    #[serde(default)]
    pub items: Vec<Factor>,
}

/// One registered second-factor channel on the account.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Factor {
    pub factor_id: String,
    pub factor_type: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StartAuth {
    pub factor_auth_code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FinishAuth {
    pub token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionData {
    pub user_id: String,
}

// ── Devices ─────────────────────────────────────────────────────────

/// One entry of the account's device list.
///
/// Uses `#[serde(flatten)]` to keep every field beyond the routing
/// essentials, so kind-specific handlers can read what they need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub unique_id: Option<String>,
    #[serde(default, rename = "xCloudId")]
    pub xcloud_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub hw_version: Option<String>,

    /// All remaining fields the service sends.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl DeviceInfo {
    /// Only provisioned devices take part in synchronization.
    pub fn is_provisioned(&self) -> bool {
        self.state.as_deref() == Some("provisioned")
    }
}
