//! Push channel packets.
//!
//! Every frame on the push channel is a JSON object. State changes and
//! command responses carry `{action, resource, properties, from?, transId?}`;
//! the service also sends control frames such as `{"status": "connected"}`
//! that carry no resource and are not routed anywhere.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// One decoded event from the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    /// Verb: `"is"` for state pushes, `"get"`/`"set"` for command responses.
    #[serde(default)]
    pub action: String,

    /// Resource path, e.g. `"cameras/CAM1"`, `"modes"`, `"cameras"`.
    pub resource: String,

    /// Payload. An object for single-device packets, an array of
    /// per-device objects for collection responses.
    #[serde(default)]
    pub properties: Value,

    /// Device id of the sender (a base station for hub-level resources).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Correlates a response with the `notify` that caused it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trans_id: Option<String>,

    /// All remaining fields the service sends.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Packet {
    /// Build a packet from its routing essentials.
    pub fn new(action: impl Into<String>, resource: impl Into<String>, properties: Value) -> Self {
        Self {
            action: action.into(),
            resource: resource.into(),
            properties,
            from: None,
            trans_id: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Set the sender id.
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Resource type: the first path segment (`"cameras"` in `"cameras/CAM1"`).
    pub fn resource_type(&self) -> &str {
        self.resource.split('/').next().unwrap_or_default()
    }

    /// Device id segment, if the resource names one.
    pub fn resource_id(&self) -> Option<&str> {
        self.resource.split('/').nth(1).filter(|s| !s.is_empty())
    }

    /// Anything below the device id (`"ambientSensors/history"` in
    /// `"cameras/CAM1/ambientSensors/history"`).
    pub fn sub_resource(&self) -> Option<&str> {
        self.resource
            .splitn(3, '/')
            .nth(2)
            .filter(|s| !s.is_empty())
    }
}

/// A parsed push frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Packet(Packet),
    /// Channel housekeeping, e.g. `{"status": "connected"}`.
    Control { status: String },
}

impl Frame {
    /// Parse one text frame.
    ///
    /// Anything that is not a JSON object, or an object with neither a
    /// `resource` nor a `status`, is a [`Error::PacketParse`].
    pub fn parse(text: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(text).map_err(|e| Error::PacketParse {
            message: e.to_string(),
        })?;

        let Some(obj) = value.as_object() else {
            return Err(Error::PacketParse {
                message: "frame is not a JSON object".into(),
            });
        };

        if !obj.contains_key("resource") {
            if let Some(status) = obj.get("status").and_then(Value::as_str) {
                return Ok(Self::Control {
                    status: status.to_owned(),
                });
            }
        }

        serde_json::from_value(value)
            .map(Self::Packet)
            .map_err(|e| Error::PacketParse {
                message: e.to_string(),
            })
    }
}
