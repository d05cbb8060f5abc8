//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Agent:  GET /ws?client_id=…
//!     → gateway.rs (validate id, upgrade)
//!     → tunnel::AgentSession (runs until the socket closes)
//!
//! Caller: any other method/path
//!     → gateway.rs (buffer body, flatten headers → TunnelMessage)
//!     → tunnel::Dispatcher (agent round trip)
//!     → response.rs (reply → HTTP response, or 502/504)
//!
//! Relay:  GET /ws/client/{client_id}/{session_id}, GET /ws/ssh/{client_id}/{session_id}
//!     → relay.rs (upgrade)
//!     → tunnel::RelaySession (pair, copy bytes both ways)
//! ```

pub mod gateway;
pub mod relay;
pub mod response;
pub mod server;

pub use server::{AppState, HttpServer};
