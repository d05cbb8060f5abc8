//! Per-connection agent session.
//!
//! # Data Flow
//! ```text
//!              ┌──────────── writer task ◀── mpsc queue ◀── Dispatcher
//! WebSocket ───┤
//!              └──────────── read loop ──▶ decode ──▶ CorrelationTable::deliver
//! ```
//!
//! The session is a reply sink: agents never originate requests. It ends on
//! the first read or write failure, or when the peer closes, and releases the
//! agent's registration on the way out.

use std::fmt::Display;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;

use crate::tunnel::correlation::CorrelationTable;
use crate::tunnel::message::TunnelMessage;
use crate::tunnel::registry::{AgentHandle, AgentRegistry, ConnectionId};

/// One connected agent.
pub struct AgentSession {
    client_id: String,
    connection_id: ConnectionId,
    registry: Arc<AgentRegistry>,
    correlations: Arc<CorrelationTable>,
    queue_capacity: usize,
}

impl AgentSession {
    pub fn new(
        client_id: impl Into<String>,
        registry: Arc<AgentRegistry>,
        correlations: Arc<CorrelationTable>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            connection_id: ConnectionId::new(),
            registry,
            correlations,
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Register the agent and serve the socket until it fails or closes.
    pub async fn run(self, socket: WebSocket) {
        let (sink, stream) = socket.split();
        self.serve(sink, stream).await;
    }

    /// Serve an already split connection.
    pub async fn serve<W, R, E>(self, sink: W, stream: R)
    where
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let handle = AgentHandle::new(self.client_id.clone(), self.connection_id, tx);
        // Dropping the superseded handle closes the old connection's queue.
        drop(self.registry.register(handle));

        let mut writer = tokio::spawn(write_loop(
            sink,
            rx,
            self.client_id.clone(),
            self.connection_id,
        ));

        tokio::select! {
            _ = self.read_loop(stream) => {}
            _ = &mut writer => {}
        }

        writer.abort();
        self.registry.release(&self.client_id, self.connection_id);
        tracing::info!(
            client_id = %self.client_id,
            connection_id = %self.connection_id,
            "Agent disconnected"
        );
    }

    async fn read_loop<R, E>(&self, mut stream: R)
    where
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(message) => {
                    if !self.handle_frame(message) {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        client_id = %self.client_id,
                        connection_id = %self.connection_id,
                        error = %e,
                        "Agent read error"
                    );
                    break;
                }
            }
        }
    }

    /// Process one inbound frame. Returns false once the peer has closed.
    fn handle_frame(&self, message: Message) -> bool {
        let decoded = match message {
            Message::Text(text) => TunnelMessage::decode(text.as_str()),
            Message::Binary(bytes) => TunnelMessage::decode_bytes(&bytes),
            Message::Close(_) => return false,
            Message::Ping(_) | Message::Pong(_) => return true,
        };

        match decoded {
            Ok(reply) if reply.has_id() => {
                let id = reply.id.clone();
                self.correlations.deliver(&id, reply);
            }
            Ok(_) => {
                tracing::debug!(client_id = %self.client_id, "Ignoring message without id");
            }
            Err(e) => {
                tracing::warn!(client_id = %self.client_id, error = %e, "Skipping malformed frame");
            }
        }
        true
    }
}

async fn write_loop<W>(
    mut sink: W,
    mut rx: mpsc::Receiver<TunnelMessage>,
    client_id: String,
    connection_id: ConnectionId,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    while let Some(message) = rx.recv().await {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(client_id = %client_id, error = %e, "Failed to encode request");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(frame.into())).await {
            tracing::warn!(
                client_id = %client_id,
                connection_id = %connection_id,
                error = %e,
                "Agent write error"
            );
            return;
        }
    }

    // Queue closed: this connection was superseded.
    tracing::debug!(client_id = %client_id, connection_id = %connection_id, "Closing agent connection");
    let _ = sink.close().await;
}
