//! Local HTTP re-issuer.
//!
//! Replays a tunneled request against the private service and packs the
//! result into a reply carrying the same exchange id.

use std::collections::HashMap;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::json;

use crate::tunnel::TunnelMessage;

/// Request headers not replayed locally; the local client sets its own.
const SKIPPED_REQUEST_HEADERS: [&str; 4] = ["host", "content-length", "transfer-encoding", "connection"];

/// Re-issues tunneled requests against `base_url`.
#[derive(Debug, Clone)]
pub struct LocalForwarder {
    client: reqwest::Client,
    base_url: String,
}

impl LocalForwarder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Replay `request` and build its reply.
    ///
    /// Local failures become a 502 reply so the caller is not left waiting
    /// for the broker's deadline.
    pub async fn forward(&self, request: TunnelMessage) -> TunnelMessage {
        let id = request.id.clone();
        match self.try_forward(request).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(exchange_id = %id, error = %e, "Local request failed");
                let body = json!({ "error": format!("local service error: {e}") }).to_string();
                TunnelMessage::reply(id, 502, HashMap::new(), body)
            }
        }
    }

    async fn try_forward(&self, request: TunnelMessage) -> Result<TunnelMessage, reqwest::Error> {
        let method = Method::from_bytes(request.method.as_bytes()).unwrap_or(Method::GET);
        let url = format!("{}{}", self.base_url, request.path);

        tracing::debug!(exchange_id = %request.id, method = %method, url = %url, "Forwarding to local service");

        let response = self
            .client
            .request(method, url)
            .headers(request_headers(&request.headers))
            .body(request.body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let headers = first_values(response.headers());
        let body = response.bytes().await?;

        Ok(TunnelMessage::reply(
            request.id,
            status,
            headers,
            String::from_utf8_lossy(&body).into_owned(),
        ))
    }
}

fn request_headers(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if SKIPPED_REQUEST_HEADERS
            .iter()
            .any(|skip| skip.eq_ignore_ascii_case(name))
        {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            map.insert(name, value);
        }
    }
    map
}

fn first_values(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .keys()
        .filter_map(|name| {
            let value = headers.get(name)?.to_str().ok()?;
            Some((name.as_str().to_string(), value.to_string()))
        })
        .collect()
}
