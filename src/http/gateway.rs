//! Inbound gateway handlers.
//!
//! # Responsibilities
//! - Accept agent connections on the upgrade endpoint
//! - Turn every other request into a tunnel message and dispatch it
//! - Translate the reply, or the failure, into the caller's response

use std::collections::HashMap;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, Query, State, WebSocketUpgrade},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::http::response::{dispatch_error_response, error_response, reply_response};
use crate::http::server::AppState;
use crate::observability::metrics;
use crate::tunnel::{AgentSession, TunnelMessage};

/// Query parameters of the agent upgrade endpoint.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub client_id: Option<String>,
}

/// Upgrade an agent connection and run its session.
pub async fn agent_connect_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(client_id) = params.client_id.filter(|id| !id.trim().is_empty()) else {
        tracing::warn!("Agent connection rejected: missing client_id");
        return error_response(StatusCode::BAD_REQUEST, "missing client_id");
    };

    let dispatcher = state.dispatcher.clone();
    let capacity = state.config.dispatch.agent_queue_capacity;

    ws.on_upgrade(move |socket| async move {
        let session = AgentSession::new(
            client_id,
            dispatcher.registry().clone(),
            dispatcher.correlations().clone(),
            capacity,
        );
        tracing::info!(
            client_id = %session.client_id(),
            connection_id = %session.connection_id(),
            "Agent connected"
        );
        session.run(socket).await;
    })
    .into_response()
}

/// Forward any request to the next agent.
///
/// A body over `limits.max_body_size` is answered with 413; any other body
/// read failure (e.g. the caller aborting mid-body) with 400.
pub async fn gateway_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let start = Instant::now();
    let method = method.as_str().to_string();
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let body = match body {
        Ok(bytes) => bytes,
        Err(rejection) => {
            tracing::warn!(
                method = %method,
                path = %path,
                status = rejection.status().as_u16(),
                error = %rejection.body_text(),
                "Failed to read request body"
            );
            let response = error_response(rejection.status(), rejection.body_text());
            metrics::record_request(&method, response.status().as_u16(), start);
            return response;
        }
    };

    let message = TunnelMessage::request(
        method.as_str(),
        path.as_str(),
        flatten_headers(&headers),
        String::from_utf8_lossy(&body).into_owned(),
    );

    let response = match state.dispatcher.dispatch(message).await {
        Ok(reply) => reply_response(reply),
        Err(e) => {
            tracing::warn!(method = %method, path = %path, error = %e, "Exchange failed");
            dispatch_error_response(&e)
        }
    };

    metrics::record_request(&method, response.status().as_u16(), start);
    response
}

/// Collapse a header map to its first value per name.
///
/// Values that are not visible ASCII are dropped.
pub fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .keys()
        .filter_map(|name| {
            let value = headers.get(name)?.to_str().ok()?;
            Some((name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{HeaderValue, Request};
    use tower::ServiceExt;

    use super::*;
    use crate::config::BrokerConfig;
    use crate::http::HttpServer;

    fn router(max_body_size: usize) -> axum::Router {
        let mut config = BrokerConfig::default();
        config.limits.max_body_size = max_body_size;
        HttpServer::new(config).router()
    }

    fn streamed(chunks: Vec<Result<&'static str, std::io::Error>>) -> Body {
        Body::from_stream(futures::stream::iter(chunks))
    }

    #[tokio::test]
    async fn aborted_body_is_bad_request() {
        let body = streamed(vec![
            Ok("partial"),
            Err(std::io::Error::other("caller went away")),
        ]);
        let req = Request::post("/upload").body(body).unwrap();

        let res = router(1024).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn streamed_body_over_limit_is_payload_too_large() {
        let body = streamed(vec![Ok("0123456789"), Ok("0123456789")]);
        let req = Request::post("/upload").body(body).unwrap();

        let res = router(16).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn readable_body_reaches_dispatch() {
        let body = streamed(vec![Ok("small")]);
        let req = Request::post("/upload").body(body).unwrap();

        // No agents are connected, so a successfully read body ends in 502.
        let res = router(1024).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn multi_value_headers_keep_first_value() {
        let mut headers = HeaderMap::new();
        headers.append("accept", HeaderValue::from_static("text/html"));
        headers.append("accept", HeaderValue::from_static("application/json"));
        headers.insert("x-trace", HeaderValue::from_static("t1"));

        let flat = flatten_headers(&headers);
        assert_eq!(flat.len(), 2);
        assert_eq!(flat["accept"], "text/html");
        assert_eq!(flat["x-trace"], "t1");
    }

    #[test]
    fn opaque_header_values_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("x-bin", HeaderValue::from_bytes(&[0xfa, 0xfb]).unwrap());
        assert!(flatten_headers(&headers).is_empty());
    }
}
