//! Registry of connected agents with round-robin selection.
//!
//! # Responsibilities
//! - Track connected agents in a stable rotation order
//! - Map each client id to its live outbound channel
//! - Hand out agents round-robin to the dispatcher
//!
//! # Design Decisions
//! - One mutex covers the rotation, the lookup and the cursor
//! - The lock is never held across an await point
//! - A reconnecting client id keeps its rotation slot and swaps the channel

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::observability::metrics;
use crate::tunnel::error::DispatchError;
use crate::tunnel::message::TunnelMessage;

/// Process-wide counter for agent connection ids.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifies one physical agent connection.
///
/// Client ids are caller-supplied and may be reused across reconnects; the
/// connection id tells two sessions of the same client apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Sending half of a connected agent.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    pub client_id: String,
    pub connection_id: ConnectionId,
    pub connected_at: Instant,
    sender: mpsc::Sender<TunnelMessage>,
}

impl AgentHandle {
    pub fn new(
        client_id: impl Into<String>,
        connection_id: ConnectionId,
        sender: mpsc::Sender<TunnelMessage>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            connection_id,
            connected_at: Instant::now(),
            sender,
        }
    }

    /// Queue a message for the agent's writer without waiting.
    ///
    /// A full queue or a closed connection is reported as `AgentSendFailed`.
    pub fn send(&self, message: TunnelMessage) -> Result<(), DispatchError> {
        self.sender.try_send(message).map_err(|e| {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "connection closed",
            };
            tracing::warn!(
                client_id = %self.client_id,
                connection_id = %self.connection_id,
                reason,
                "Agent send failed"
            );
            DispatchError::AgentSendFailed {
                client_id: self.client_id.clone(),
            }
        })
    }

    /// Time since the agent connected.
    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    /// Client ids in rotation order.
    order: Vec<String>,
    /// Client id -> live channel.
    agents: HashMap<String, AgentHandle>,
    /// Next rotation position.
    cursor: usize,
}

impl RegistryInner {
    fn remove(&mut self, client_id: &str) -> Option<AgentHandle> {
        let handle = self.agents.remove(client_id)?;
        if let Some(pos) = self.order.iter().position(|id| id == client_id) {
            self.order.remove(pos);
            // Keep the agent that was up next still up next.
            if pos < self.cursor {
                self.cursor -= 1;
            }
        }
        if self.order.is_empty() {
            self.cursor = 0;
        }
        Some(handle)
    }
}

/// Connected agents, shared by the gateway, the dispatcher and every session.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    inner: Mutex<RegistryInner>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an agent, superseding any live connection with the same client id.
    ///
    /// Returns the superseded handle, if any. Dropping it releases the old
    /// connection's queue, which lets its writer close the socket.
    pub fn register(&self, handle: AgentHandle) -> Option<AgentHandle> {
        let mut inner = self.lock();
        let client_id = handle.client_id.clone();
        let connection_id = handle.connection_id;

        let replaced = inner.agents.insert(client_id.clone(), handle);
        if replaced.is_none() {
            inner.order.push(client_id.clone());
        }
        let count = inner.order.len();
        drop(inner);

        metrics::set_connected_agents(count);
        match &replaced {
            Some(old) => tracing::info!(
                client_id = %client_id,
                connection_id = %connection_id,
                superseded = %old.connection_id,
                "Agent reconnected, superseding previous connection"
            ),
            None => tracing::info!(
                client_id = %client_id,
                connection_id = %connection_id,
                agents = count,
                "Agent registered"
            ),
        }
        replaced
    }

    /// Remove an agent by client id. Removing an absent id is a no-op.
    pub fn unregister(&self, client_id: &str) -> Option<AgentHandle> {
        let mut inner = self.lock();
        let removed = inner.remove(client_id);
        let count = inner.order.len();
        drop(inner);

        if removed.is_some() {
            metrics::set_connected_agents(count);
            tracing::info!(client_id = %client_id, agents = count, "Agent unregistered");
        }
        removed
    }

    /// Remove an agent only if `connection_id` is still its live connection.
    ///
    /// Used when a session ends, so that a superseded session does not evict
    /// the connection that replaced it.
    pub fn release(&self, client_id: &str, connection_id: ConnectionId) -> bool {
        let mut inner = self.lock();
        let owns = inner
            .agents
            .get(client_id)
            .is_some_and(|h| h.connection_id == connection_id);
        if !owns {
            return false;
        }
        inner.remove(client_id);
        let count = inner.order.len();
        drop(inner);

        metrics::set_connected_agents(count);
        tracing::info!(
            client_id = %client_id,
            connection_id = %connection_id,
            agents = count,
            "Agent released"
        );
        true
    }

    /// Pick the next agent in rotation.
    pub fn select_next(&self) -> Result<AgentHandle, DispatchError> {
        let mut inner = self.lock();
        let len = inner.order.len();
        if len == 0 {
            return Err(DispatchError::NoAgentAvailable);
        }
        let index = inner.cursor % len;
        inner.cursor = (index + 1) % len;

        let client_id = &inner.order[index];
        inner
            .agents
            .get(client_id)
            .cloned()
            .ok_or(DispatchError::NoAgentAvailable)
    }

    /// Handle for a specific client id.
    pub fn get(&self, client_id: &str) -> Option<AgentHandle> {
        self.lock().agents.get(client_id).cloned()
    }

    /// Connected agents in rotation order.
    pub fn snapshot(&self) -> Vec<AgentHandle> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.agents.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
