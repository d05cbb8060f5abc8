//! Tunnel core: message envelope, agent registry, correlation and dispatch.
//!
//! # Data Flow
//! ```text
//! Inbound Gateway
//!     → dispatcher.rs (pick agent, assign exchange id, await reply)
//!         → registry.rs (round-robin over connected agents)
//!         → correlation.rs (exchange id → waiting caller)
//!     → agent channel (bounded queue → session writer → WebSocket)
//!
//! Agent WebSocket
//!     → session.rs (read loop, decode frame)
//!     → correlation.rs (deliver reply to waiting caller)
//!
//! Relay WebSockets (client side, host side)
//!     → relay.rs (pair by client id + session id, copy bytes both ways)
//! ```
//!
//! # Design Decisions
//! - Registry, correlation table and relay table each own their lock and never share one
//! - Exactly one of {reply, timeout} resolves an exchange
//! - Late replies are dropped without error
//! - An agent that disconnects mid-exchange leaves it to the deadline

pub mod correlation;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod registry;
pub mod relay;
pub mod session;

pub use correlation::CorrelationTable;
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, TunnelError};
pub use message::TunnelMessage;
pub use registry::{AgentHandle, AgentRegistry, ConnectionId};
pub use relay::{RelayRole, RelaySession, RelayTable, SessionKey};
pub use session::AgentSession;
