//! Tunnel message envelope and its JSON wire codec.
//!
//! One message travels per WebSocket frame:
//!
//! ```text
//! {"id":"…","method":"GET","path":"/status","headers":{"accept":"*/*"},"body":""}
//! {"id":"…","headers":{"content-type":"application/json"},"body":"{\"ok\":true}","status":200}
//! ```
//!
//! Requests carry `method` and `path`; replies carry `status` (omitted when zero).
//! Every field is optional on decode so that an agent replying with only
//! `id`, `status` and `body` is accepted.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::tunnel::error::TunnelError;

/// A tunneled HTTP request or reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelMessage {
    /// Correlation identifier. Empty only before the dispatcher assigns one.
    pub id: String,
    pub method: String,
    pub path: String,
    /// One value per header name. `null` decodes as empty.
    #[serde(deserialize_with = "null_as_empty")]
    pub headers: HashMap<String, String>,
    /// Body as text. Non-UTF-8 payloads are not representable.
    pub body: String,
    /// Reply status code, zero on requests.
    #[serde(skip_serializing_if = "is_zero", deserialize_with = "saturating_status")]
    pub status: u16,
}

fn is_zero(status: &u16) -> bool {
    *status == 0
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Integers outside `u16` decode as `u16::MAX`, which is never a valid HTTP
/// status, so the gateway still answers the caller instead of dropping the
/// reply.
fn saturating_status<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let status = Option::<i64>::deserialize(deserializer)?.unwrap_or(0);
    Ok(u16::try_from(status).unwrap_or(u16::MAX))
}

impl TunnelMessage {
    /// Build an outbound request with no identifier yet.
    pub fn request(
        method: impl Into<String>,
        path: impl Into<String>,
        headers: HashMap<String, String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers,
            body: body.into(),
            ..Self::default()
        }
    }

    /// Build a reply correlated to `id`.
    pub fn reply(
        id: impl Into<String>,
        status: u16,
        headers: HashMap<String, String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            headers,
            body: body.into(),
            status,
            ..Self::default()
        }
    }

    /// Whether this message carries a correlation identifier.
    pub fn has_id(&self) -> bool {
        !self.id.is_empty()
    }

    /// Reply status, if one was set.
    pub fn status(&self) -> Option<u16> {
        (self.status != 0).then_some(self.status)
    }

    /// Serialize into a single text frame.
    pub fn encode(&self) -> Result<String, TunnelError> {
        serde_json::to_string(self).map_err(TunnelError::Encode)
    }

    /// Parse a text frame.
    pub fn decode(frame: &str) -> Result<Self, TunnelError> {
        serde_json::from_str(frame).map_err(TunnelError::Malformed)
    }

    /// Parse a binary frame holding UTF-8 JSON.
    pub fn decode_bytes(frame: &[u8]) -> Result<Self, TunnelError> {
        serde_json::from_slice(frame).map_err(TunnelError::Malformed)
    }
}
