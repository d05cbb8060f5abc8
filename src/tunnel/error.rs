//! Error types for the tunnel core.

use thiserror::Error;

/// Failure of a single request/reply exchange.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No agent is connected.
    #[error("no agent connected")]
    NoAgentAvailable,

    /// The agent's outbound queue is full or its connection is gone.
    #[error("failed to send request to agent {client_id}")]
    AgentSendFailed { client_id: String },

    /// The agent accepted the request but did not reply in time.
    #[error("agent response timeout after {timeout_ms} ms")]
    ResponseTimeout { timeout_ms: u64 },

    /// The generated exchange id was already in flight.
    #[error("correlation id {0} already in flight")]
    DuplicateId(String),
}

/// Wire-level codec failures.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// A frame that does not decode as a tunnel message.
    #[error("malformed tunnel message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("failed to encode tunnel message: {0}")]
    Encode(#[source] serde_json::Error),
}
