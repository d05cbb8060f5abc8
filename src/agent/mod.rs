//! Agent side of the tunnel.
//!
//! # Data Flow
//! ```text
//! broker ──WebSocket──▶ read loop ──▶ spawn per request ──▶ LocalForwarder ──▶ local service
//!        ◀──────────── writer task ◀── mpsc queue ◀────────────── reply ◀──┘
//! ```
//!
//! The agent dials out to the broker, so the local service needs no public
//! exposure. It runs until the connection ends; reconnecting is left to the
//! process supervisor. Relay sessions use the TCP bridges in [`bridge`].

pub mod bridge;
pub mod forwarder;

use std::fmt::Display;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

pub use bridge::RelayConfig;
pub use forwarder::LocalForwarder;

use crate::tunnel::TunnelMessage;

/// Errors that end an agent run.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid broker URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("unsupported broker URL scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("tunnel connection error: {0}")]
    Connection(#[from] WsError),

    #[error("failed to write reply to broker: {0}")]
    ReplyWrite(String),

    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Agent settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identifier announced to the broker.
    pub client_id: String,
    /// Broker base URL (`ws`, `wss`, `http` or `https`).
    pub broker_url: String,
    /// Broker's agent upgrade path.
    pub agent_path: String,
    /// Base URL of the local service.
    pub local_api: String,
    /// Replies that may queue before request handlers wait.
    pub reply_queue_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            client_id: "machine1".to_string(),
            broker_url: "ws://127.0.0.1:8080".to_string(),
            agent_path: "/ws".to_string(),
            local_api: "http://127.0.0.1:5005".to_string(),
            reply_queue_capacity: 64,
        }
    }
}

impl AgentConfig {
    /// WebSocket URL of the broker's upgrade endpoint for this client.
    pub fn tunnel_url(&self) -> Result<Url, AgentError> {
        let mut url = websocket_base(&self.broker_url)?;
        let path = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            self.agent_path.trim_start_matches('/')
        );
        url.set_path(&path);
        url.query_pairs_mut()
            .clear()
            .append_pair("client_id", &self.client_id);
        Ok(url)
    }
}

/// Parse a broker base URL, mapping `http`/`https` onto `ws`/`wss`.
pub(crate) fn websocket_base(broker_url: &str) -> Result<Url, AgentError> {
    let mut url = Url::parse(broker_url)?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(AgentError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| AgentError::UnsupportedScheme(scheme.to_string()))?;
    Ok(url)
}

/// Connect to the broker and serve tunneled requests until disconnected.
pub async fn run(config: AgentConfig) -> Result<(), AgentError> {
    let url = config.tunnel_url()?;
    let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    tracing::info!(
        client_id = %config.client_id,
        broker = %url,
        local_api = %config.local_api,
        "Connected to broker"
    );

    let (sink, stream) = socket.split();
    let forwarder = LocalForwarder::new(config.local_api.clone());
    let result = serve(sink, stream, forwarder, config.reply_queue_capacity).await;

    tracing::info!(client_id = %config.client_id, "Disconnected from broker");
    result
}

/// Serve requests read from `stream`, writing replies to `sink`.
///
/// Ends when the broker closes the connection, a read fails, or a reply can
/// no longer be written.
pub async fn serve<W, R>(
    sink: W,
    mut stream: R,
    forwarder: LocalForwarder,
    reply_queue_capacity: usize,
) -> Result<(), AgentError>
where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display,
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let (tx, rx) = mpsc::channel::<TunnelMessage>(reply_queue_capacity.max(1));
    let mut writer = tokio::spawn(write_replies(sink, rx));

    let result = loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            written = &mut writer => {
                break match written {
                    Ok(Err(e)) => Err(AgentError::ReplyWrite(e)),
                    _ => Ok(()),
                };
            }
        };

        let decoded = match frame {
            Some(Ok(Message::Text(text))) => TunnelMessage::decode(text.as_str()),
            Some(Ok(Message::Binary(bytes))) => TunnelMessage::decode_bytes(&bytes),
            Some(Ok(Message::Close(_))) | None => break Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => break Err(AgentError::Connection(e)),
        };

        let request = match decoded {
            Ok(request) if request.has_id() => request,
            Ok(_) => {
                tracing::debug!("Ignoring request without id");
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Invalid message JSON");
                continue;
            }
        };

        let forwarder = forwarder.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let reply = forwarder.forward(request).await;
            let id = reply.id.clone();
            if tx.send(reply).await.is_err() {
                tracing::debug!(exchange_id = %id, "Reply dropped, broker connection gone");
            }
        });
    };

    writer.abort();
    result
}

async fn write_replies<W>(mut sink: W, mut rx: mpsc::Receiver<TunnelMessage>) -> Result<(), String>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    while let Some(reply) = rx.recv().await {
        let frame = match reply.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(exchange_id = %reply.id, error = %e, "Failed to encode reply");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(frame.into())).await {
            tracing::warn!(exchange_id = %reply.id, error = %e, "Broker write error");
            return Err(e.to_string());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use futures::channel::mpsc as fmpsc;

    use super::*;

    fn unreachable_forwarder() -> LocalForwarder {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        LocalForwarder::new(format!("http://{addr}"))
    }

    fn request_frame(id: &str) -> Result<Message, WsError> {
        let mut request = TunnelMessage::request("GET", "/status", HashMap::new(), "");
        request.id = id.into();
        Ok(Message::Text(request.encode().unwrap().into()))
    }

    #[tokio::test]
    async fn reply_write_failure_ends_serving() {
        let (inbound, stream) = fmpsc::unbounded::<Result<Message, WsError>>();
        let (sink, outbound) = fmpsc::unbounded::<Message>();
        drop(outbound);

        inbound.unbounded_send(request_frame("x1")).unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            serve(sink, stream, unreachable_forwarder(), 4),
        )
        .await
        .expect("agent kept reading after its writer failed");

        assert!(matches!(result, Err(AgentError::ReplyWrite(_))));
        drop(inbound);
    }

    #[tokio::test]
    async fn replies_are_written_until_broker_closes() {
        let (inbound, stream) = fmpsc::unbounded::<Result<Message, WsError>>();
        let (sink, mut outbound) = fmpsc::unbounded::<Message>();
        let task = tokio::spawn(serve(sink, stream, unreachable_forwarder(), 4));

        inbound.unbounded_send(request_frame("x1")).unwrap();
        let reply = match outbound.next().await {
            Some(Message::Text(frame)) => TunnelMessage::decode(frame.as_str()).unwrap(),
            other => panic!("unexpected frame: {other:?}"),
        };
        assert_eq!(reply.id, "x1");
        assert_eq!(reply.status, 502);

        inbound.unbounded_send(Ok(Message::Close(None))).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[test]
    fn tunnel_url_from_http_base() {
        let config = AgentConfig {
            client_id: "edge 1".into(),
            broker_url: "https://broker.example.com/".into(),
            ..AgentConfig::default()
        };
        assert_eq!(
            config.tunnel_url().unwrap().as_str(),
            "wss://broker.example.com/ws?client_id=edge+1"
        );
    }

    #[test]
    fn tunnel_url_keeps_base_path() {
        let config = AgentConfig {
            broker_url: "ws://127.0.0.1:8080/tunnel".into(),
            ..AgentConfig::default()
        };
        assert_eq!(
            config.tunnel_url().unwrap().as_str(),
            "ws://127.0.0.1:8080/tunnel/ws?client_id=machine1"
        );
    }

    #[test]
    fn tunnel_url_rejects_other_schemes() {
        let config = AgentConfig {
            broker_url: "ftp://broker".into(),
            ..AgentConfig::default()
        };
        assert!(matches!(
            config.tunnel_url(),
            Err(AgentError::UnsupportedScheme(_))
        ));
    }
}
