//! Reverse-tunnel broker library.
//!
//! A public broker accepts HTTP requests and relays each one over a
//! persistent WebSocket to one of several privately located agents, which
//! replay it against a local service and send the reply back.

pub mod admin;
pub mod agent;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod tunnel;

pub use config::BrokerConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
