//! Byte relay between paired WebSocket sessions.
//!
//! # Data Flow
//! ```text
//! /ws/client/{client_id}/{session_id} ──┐             ┌── /ws/ssh/{client_id}/{session_id}
//!                                       ▼             ▼
//!                            RelayTable (client_id, session_id)
//!                                       │
//!                first side parks ◀─────┴─────▶ second side hands over its socket
//!                                       │
//!                          pipe(client → host) ║ pipe(host → client)
//! ```
//!
//! The first side of a session to arrive parks in the table and buffers any
//! frames it sends while waiting. When the opposite side arrives it hands its
//! socket to the parked side, which flushes the buffer and runs both copy
//! loops. The first loop to finish closes both sockets.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::oneshot;

use crate::observability::metrics;
use crate::tunnel::registry::ConnectionId;

/// Payload a parked socket may buffer before its peer arrives.
pub const MAX_BACKLOG_BYTES: usize = 1024 * 1024;

/// Which end of a relay session a socket belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayRole {
    /// The user side, normally fed by a local TCP forwarder.
    Client,
    /// The machine side, bridged to a local SSH server.
    Host,
}

impl RelayRole {
    pub fn peer(self) -> Self {
        match self {
            Self::Client => Self::Host,
            Self::Host => Self::Client,
        }
    }
}

impl Display for RelayRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Host => f.write_str("host"),
        }
    }
}

/// Identifies one relay session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub client_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(client_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client_id, self.session_id)
    }
}

/// Outcome of [`RelayTable::join`].
#[derive(Debug)]
pub enum Join<S> {
    /// The socket went to the parked peer, which now runs the relay.
    Handed,
    /// No peer was waiting. The socket comes back together with the
    /// receiver the peer's socket will arrive on.
    Parked(S, oneshot::Receiver<S>),
}

#[derive(Debug)]
struct Waiter<S> {
    role: RelayRole,
    connection_id: ConnectionId,
    tx: oneshot::Sender<S>,
}

/// Sockets waiting for their session peer, keyed by `(client_id, session_id)`.
///
/// Holds only unpaired sockets; an entry is removed the moment its peer
/// arrives. A second socket of the same role replaces the parked one, whose
/// receiver then fails.
#[derive(Debug)]
pub struct RelayTable<S> {
    waiting: Mutex<HashMap<SessionKey, Waiter<S>>>,
}

impl<S> Default for RelayTable<S> {
    fn default() -> Self {
        Self {
            waiting: Mutex::new(HashMap::new()),
        }
    }
}

impl<S> RelayTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionKey, Waiter<S>>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pair `socket` with a parked peer of the opposite role, or park it.
    pub fn join(
        &self,
        key: &SessionKey,
        role: RelayRole,
        connection_id: ConnectionId,
        socket: S,
    ) -> Join<S> {
        let mut waiting = self.lock();
        let mut socket = socket;

        if let Some(waiter) = waiting.remove(key) {
            if waiter.role == role.peer() {
                match waiter.tx.send(socket) {
                    Ok(()) => {
                        tracing::debug!(session = %key, role = %role, "Relay session paired");
                        return Join::Handed;
                    }
                    // The parked side gave up before it could be removed.
                    Err(returned) => socket = returned,
                }
            } else {
                tracing::info!(
                    session = %key,
                    role = %role,
                    replaced = %waiter.connection_id,
                    "Replacing parked relay socket"
                );
            }
        }

        let (tx, rx) = oneshot::channel();
        waiting.insert(
            key.clone(),
            Waiter {
                role,
                connection_id,
                tx,
            },
        );
        Join::Parked(socket, rx)
    }

    /// Remove the parked entry for `key` if `connection_id` still owns it.
    pub fn leave(&self, key: &SessionKey, connection_id: ConnectionId) -> bool {
        let mut waiting = self.lock();
        let owns = waiting
            .get(key)
            .is_some_and(|waiter| waiter.connection_id == connection_id);
        if owns {
            waiting.remove(key);
        }
        owns
    }

    /// Role parked under `key`, if any.
    pub fn parked_role(&self, key: &SessionKey) -> Option<RelayRole> {
        self.lock().get(key).map(|waiter| waiter.role)
    }

    /// Number of sockets waiting for a peer.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One side of a relay session.
pub struct RelaySession {
    key: SessionKey,
    role: RelayRole,
    connection_id: ConnectionId,
    table: Arc<RelayTable<WebSocket>>,
}

impl RelaySession {
    pub fn new(key: SessionKey, role: RelayRole, table: Arc<RelayTable<WebSocket>>) -> Self {
        Self {
            key,
            role,
            connection_id: ConnectionId::new(),
            table,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn role(&self) -> RelayRole {
        self.role
    }

    /// Join the session and, when this side parks, relay until either end
    /// closes.
    pub async fn run(self, socket: WebSocket) {
        match self
            .table
            .join(&self.key, self.role, self.connection_id, socket)
        {
            Join::Handed => {}
            Join::Parked(socket, peer) => self.wait_and_relay(socket, peer).await,
        }
    }

    async fn wait_and_relay(&self, socket: WebSocket, mut peer: oneshot::Receiver<WebSocket>) {
        let (mut sink, mut stream) = socket.split();
        let mut backlog = Vec::new();
        let mut backlog_bytes = 0usize;

        tracing::info!(
            session = %self.key,
            role = %self.role,
            connection_id = %self.connection_id,
            "Waiting for relay peer"
        );

        let peer_socket = loop {
            tokio::select! {
                received = &mut peer => match received {
                    Ok(peer_socket) => break peer_socket,
                    Err(_) => {
                        tracing::info!(session = %self.key, role = %self.role, "Parked relay socket superseded");
                        let _ = sink.close().await;
                        return;
                    }
                },
                frame = stream.next() => match frame {
                    Some(Ok(frame @ (Message::Binary(_) | Message::Text(_)))) => {
                        backlog_bytes += frame_len(&frame);
                        if backlog_bytes > MAX_BACKLOG_BYTES {
                            self.table.leave(&self.key, self.connection_id);
                            tracing::warn!(session = %self.key, role = %self.role, "Relay backlog full before pairing");
                            let _ = sink.close().await;
                            return;
                        }
                        backlog.push(frame);
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        self.table.leave(&self.key, self.connection_id);
                        tracing::info!(session = %self.key, role = %self.role, "Relay socket left before pairing");
                        return;
                    }
                },
            }
        };

        let (mut peer_sink, mut peer_stream) = peer_socket.split();
        tracing::info!(session = %self.key, buffered = backlog.len(), "Relay session started");

        for frame in backlog {
            if let Err(e) = peer_sink.send(frame).await {
                tracing::warn!(session = %self.key, error = %e, "Relay write error");
                let _ = sink.close().await;
                return;
            }
        }

        let mut from_self = backlog_bytes as u64;
        let mut from_peer = 0u64;
        tokio::select! {
            _ = pipe(&mut stream, &mut peer_sink, &mut from_self) => {}
            _ = pipe(&mut peer_stream, &mut sink, &mut from_peer) => {}
        }

        let _ = sink.close().await;
        let _ = peer_sink.close().await;

        let (client_bytes, host_bytes) = match self.role {
            RelayRole::Client => (from_self, from_peer),
            RelayRole::Host => (from_peer, from_self),
        };
        metrics::record_relay_session(client_bytes, host_bytes);
        tracing::info!(session = %self.key, client_bytes, host_bytes, "Relay session closed");
    }
}

/// Copy data frames from `source` to `sink` until either side ends, adding
/// the payload bytes copied to `copied`.
pub async fn pipe<R, W, E>(source: &mut R, sink: &mut W, copied: &mut u64)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    W: Sink<Message> + Unpin,
    W::Error: Display,
    E: Display,
{
    while let Some(frame) = source.next().await {
        let frame = match frame {
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => break,
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "Relay read error");
                break;
            }
        };
        let len = frame_len(&frame);
        if let Err(e) = sink.send(frame).await {
            tracing::debug!(error = %e, "Relay write error");
            break;
        }
        *copied += len as u64;
    }
}

fn frame_len(frame: &Message) -> usize {
    match frame {
        Message::Binary(bytes) => bytes.len(),
        Message::Text(text) => text.as_str().len(),
        _ => 0,
    }
}
