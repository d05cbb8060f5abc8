//! TCP bridges for relay sessions.
//!
//! # Data Flow
//! ```text
//! ssh client ─TCP─▶ forward_local ─WS /ws/client/…─▶ broker ◀─WS /ws/ssh/…─ serve_host ─TCP─▶ sshd
//! ```
//!
//! Each side copies raw bytes between one TCP connection and one relay
//! socket. Whichever direction ends first tears down both.

use std::fmt::Display;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use url::Url;

use crate::agent::{websocket_base, AgentError};
use crate::tunnel::RelayRole;

const BRIDGE_BUFFER_SIZE: usize = 16 * 1024;

/// Pause between host sessions.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Names one relay session on a broker.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Broker base URL (`ws`, `wss`, `http` or `https`).
    pub broker_url: String,
    pub client_id: String,
    pub session_id: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            broker_url: "ws://127.0.0.1:8080".to_string(),
            client_id: "defaultclient".to_string(),
            session_id: "default".to_string(),
        }
    }
}

impl RelayConfig {
    /// Relay URL for `role`'s side of the session.
    pub fn url(&self, role: RelayRole) -> Result<Url, AgentError> {
        let mut url = websocket_base(&self.broker_url)?;
        let side = match role {
            RelayRole::Client => "client",
            RelayRole::Host => "ssh",
        };
        url.path_segments_mut()
            .map_err(|_| AgentError::UnsupportedScheme(self.broker_url.clone()))?
            .pop_if_empty()
            .extend(["ws", side, self.client_id.as_str(), self.session_id.as_str()]);
        url.set_query(None);
        Ok(url)
    }
}

/// Copy bytes between `tcp` and `socket` until either side ends.
///
/// Returns `(bytes sent to the relay, bytes written to TCP)`.
pub async fn bridge<S>(tcp: TcpStream, socket: WebSocketStream<S>) -> (u64, u64)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tcp.into_split();
    let (mut sink, mut stream) = socket.split();
    let mut sent = 0u64;
    let mut received = 0u64;

    tokio::select! {
        _ = tcp_to_ws(&mut reader, &mut sink, &mut sent) => {}
        _ = ws_to_tcp(&mut stream, &mut writer, &mut received) => {}
    }

    let _ = sink.close().await;
    let _ = writer.shutdown().await;
    (sent, received)
}

async fn tcp_to_ws<R, W>(reader: &mut R, sink: &mut W, sent: &mut u64)
where
    R: AsyncRead + Unpin,
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let mut buf = vec![0u8; BRIDGE_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("Local connection closed");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "Local read error");
                return;
            }
        };
        if let Err(e) = sink.send(Message::Binary(buf[..n].to_vec().into())).await {
            tracing::warn!(error = %e, "Relay write error");
            return;
        }
        *sent += n as u64;
    }
}

async fn ws_to_tcp<R, W>(stream: &mut R, writer: &mut W, received: &mut u64)
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = stream.next().await {
        let written = match frame {
            Ok(Message::Binary(bytes)) => writer.write_all(&bytes).await.map(|()| bytes.len()),
            Ok(Message::Text(text)) => {
                let text = text.as_str();
                writer.write_all(text.as_bytes()).await.map(|()| text.len())
            }
            Ok(Message::Close(_)) => {
                tracing::debug!("Relay socket closed");
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "Relay read error");
                return;
            }
        };
        match written {
            Ok(n) => *received += n as u64,
            Err(e) => {
                tracing::warn!(error = %e, "Local write error");
                return;
            }
        }
    }
}

/// Accept local TCP connections and carry each over its own client-side
/// relay socket.
pub async fn forward_local(listener: TcpListener, url: Url) -> Result<(), AgentError> {
    tracing::info!(address = %listener.local_addr()?, relay = %url, "Forwarding local connections");
    loop {
        let (tcp, peer) = listener.accept().await?;
        let url = url.clone();
        tokio::spawn(async move {
            tracing::info!(peer = %peer, "Local connection accepted");
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((socket, _)) => {
                    let (sent, received) = bridge(tcp, socket).await;
                    tracing::info!(peer = %peer, sent, received, "Local connection finished");
                }
                Err(e) => tracing::warn!(peer = %peer, error = %e, "Relay connection failed"),
            }
        });
    }
}

/// Run one host-side session: dial the relay, then the local service, and
/// bridge them.
pub async fn serve_host_once(url: &Url, target: &str) -> Result<(u64, u64), AgentError> {
    let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    let tcp = TcpStream::connect(target).await?;
    tracing::info!(relay = %url, target = %target, "Connected to relay and local service");
    Ok(bridge(tcp, socket).await)
}

/// Serve host-side sessions forever, redialing after each one ends.
pub async fn run_host(url: Url, target: String) {
    loop {
        match serve_host_once(&url, &target).await {
            Ok((sent, received)) => tracing::info!(sent, received, "Host session ended"),
            Err(e) => tracing::warn!(error = %e, "Host session failed"),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
