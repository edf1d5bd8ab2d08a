//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds > 0, intervals > 0, addresses parse)
//! - Check the startup graph (duplicates, unknown dependencies, cycles)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: BulwarkConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::{BreakerEntry, BulwarkConfig};
use crate::lifecycle::graph::{DependencyGraph, GraphError};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: String },

    #[error("{field} is not a valid socket address: {value}")]
    InvalidAddress { field: String, value: String },

    #[error("connections.max_per_owner ({per_owner}) exceeds connections.max_total ({total})")]
    OwnerQuotaAboveTotal { per_owner: usize, total: usize },

    #[error("{field} must not be empty")]
    Empty { field: String },

    #[error("startup graph: {0}")]
    Graph(GraphError),
}

/// Validate a parsed configuration, collecting every problem found.
pub fn validate_config(config: &BulwarkConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address(&mut errors, "server.bind_address", &config.server.bind_address);
    if config.observability.metrics_enabled {
        check_address(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    if config.admin.api_key.trim().is_empty() {
        errors.push(ValidationError::Empty {
            field: "admin.api_key".to_string(),
        });
    }

    check_breaker(&mut errors, "breaker", &config.breaker.defaults);
    for (name, entry) in &config.breaker.overrides {
        check_breaker(&mut errors, &format!("breaker.overrides.{}", name), entry);
    }

    let conns = &config.connections;
    check_positive(&mut errors, "connections.max_total", conns.max_total as u64);
    check_positive(&mut errors, "connections.max_per_owner", conns.max_per_owner as u64);
    check_positive(&mut errors, "connections.cleanup_interval_secs", conns.cleanup_interval_secs);
    check_positive(&mut errors, "connections.heartbeat_interval_secs", conns.heartbeat_interval_secs);
    check_positive(&mut errors, "connections.heartbeat_timeout_ms", conns.heartbeat_timeout_ms);
    check_positive(&mut errors, "connections.connection_timeout_secs", conns.connection_timeout_secs);
    check_positive(&mut errors, "connections.outbound_buffer", conns.outbound_buffer as u64);
    if conns.max_per_owner > conns.max_total {
        errors.push(ValidationError::OwnerQuotaAboveTotal {
            per_owner: conns.max_per_owner,
            total: conns.max_total,
        });
    }

    check_positive(&mut errors, "boundary.default_timeout_ms", config.boundary.default_timeout_ms);
    for (channel, timeout_ms) in &config.boundary.channel_timeouts_ms {
        check_positive(
            &mut errors,
            &format!("boundary.channel_timeouts_ms.{}", channel),
            *timeout_ms,
        );
    }

    for component in &config.startup.components {
        check_positive(
            &mut errors,
            &format!("startup.components.{}.init_timeout_secs", component.name),
            component.init_timeout_secs,
        );
        if let Some(endpoint) = &component.endpoint {
            check_address(
                &mut errors,
                &format!("startup.components.{}.endpoint", component.name),
                endpoint,
            );
        }
    }

    let descriptors = config
        .startup
        .components
        .iter()
        .map(|c| c.to_descriptor())
        .collect();
    if let Err(e) = DependencyGraph::build(descriptors) {
        errors.push(ValidationError::Graph(e));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_breaker(errors: &mut Vec<ValidationError>, prefix: &str, entry: &BreakerEntry) {
    check_positive(
        errors,
        &format!("{}.failure_threshold", prefix),
        entry.failure_threshold as u64,
    );
    check_positive(
        errors,
        &format!("{}.recovery_timeout_ms", prefix),
        entry.recovery_timeout_ms,
    );
}

fn check_positive(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError::Zero {
            field: field.to_string(),
        });
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
}
