//! Reply and error translation for the inbound gateway.
//!
//! # Responsibilities
//! - Turn an agent's reply message into the caller's HTTP response
//! - Drop framing headers; the serving layer recomputes them
//! - Map exchange failures to gateway status codes
//!
//! | failure                                 | status |
//! |-----------------------------------------|--------|
//! | no agent / send to agent failed         | 502    |
//! | agent reply timeout                     | 504    |
//! | exchange id collision                   | 500    |

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::tunnel::{DispatchError, TunnelMessage};

/// Reply headers that describe framing and are never copied to the caller.
pub const FRAMING_HEADERS: [&str; 3] = ["content-length", "transfer-encoding", "connection"];

/// Whether `name` is a framing header (case-insensitive).
pub fn is_framing_header(name: &str) -> bool {
    FRAMING_HEADERS
        .iter()
        .any(|framing| framing.eq_ignore_ascii_case(name))
}

/// JSON error body `{"error": message}` with the given status.
pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Gateway response for a failed exchange.
pub fn dispatch_error_response(err: &DispatchError) -> Response {
    match err {
        DispatchError::NoAgentAvailable | DispatchError::AgentSendFailed { .. } => {
            error_response(StatusCode::BAD_GATEWAY, err.to_string())
        }
        DispatchError::ResponseTimeout { .. } => {
            error_response(StatusCode::GATEWAY_TIMEOUT, "timeout")
        }
        DispatchError::DuplicateId(_) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/// Build the caller's response from an agent reply.
pub fn reply_response(reply: TunnelMessage) -> Response {
    let status = match StatusCode::from_u16(reply.status().unwrap_or(200)) {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(exchange_id = %reply.id, status = reply.status, "Agent replied with invalid status");
            return error_response(StatusCode::BAD_GATEWAY, "invalid status from agent");
        }
    };

    let mut response = Response::new(Body::from(reply.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in reply.headers {
        if is_framing_header(&name) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => {
                tracing::debug!(exchange_id = %reply.id, header = %name, "Skipping invalid reply header");
            }
        }
    }

    response
}
