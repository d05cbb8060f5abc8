//! Configuration validation.
//!
//! Serde handles syntax; this module checks values. Every problem is
//! reported, not just the first.

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::BrokerConfig;

/// A single semantic problem with the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field}: invalid socket address {value:?}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("listener.agent_path must start with '/', got {0:?}")]
    InvalidAgentPath(String),

    #[error("listener.agent_path {0:?} overlaps the relay routes under /ws/client/ and /ws/ssh/")]
    RelayPathConflict(String),

    #[error("admin.api_key must not be empty when admin is enabled")]
    EmptyApiKey,
}

/// Check a parsed configuration.
pub fn validate_config(config: &BrokerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_addr(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if !config.listener.agent_path.starts_with('/') || config.listener.agent_path.len() < 2 {
        errors.push(ValidationError::InvalidAgentPath(
            config.listener.agent_path.clone(),
        ));
    }
    let agent_path = config.listener.agent_path.as_str();
    if agent_path.starts_with("/ws/client/") || agent_path.starts_with("/ws/ssh/") {
        errors.push(ValidationError::RelayPathConflict(agent_path.to_string()));
    }

    if config.dispatch.response_timeout_ms == 0 {
        errors.push(ValidationError::Zero {
            field: "dispatch.response_timeout_ms",
        });
    }
    if config.dispatch.agent_queue_capacity == 0 {
        errors.push(ValidationError::Zero {
            field: "dispatch.agent_queue_capacity",
        });
    }
    if config.limits.max_body_size == 0 {
        errors.push(ValidationError::Zero {
            field: "limits.max_body_size",
        });
    }

    if config.observability.metrics_enabled {
        check_addr(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    if config.admin.enabled {
        check_addr(&mut errors, "admin.bind_address", &config.admin.bind_address);
        if config.admin.api_key.is_empty() {
            errors.push(ValidationError::EmptyApiKey);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_addr(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}
