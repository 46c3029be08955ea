//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, percentages, pool sizes)
//! - Validate addresses before anything binds or connects
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: SidecarConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::{FilterConfig, SidecarConfig};
use crate::stream::payload::parse_header;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// One semantic problem, tied to the offending field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Check a parsed config, collecting every error found.
pub fn validate_config(config: &SidecarConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }

    if !has_port(&config.upstream.address) {
        errors.push(ValidationError::new(
            "upstream.address",
            format!("'{}' is not host:port", config.upstream.address),
        ));
    }

    if config.timeouts.connect_secs == 0 {
        errors.push(ValidationError::new("timeouts.connect_secs", "must be greater than 0"));
    }

    let pool = &config.pool;
    if pool.prewarm_per_shard > pool.max_idle_per_shard {
        errors.push(ValidationError::new(
            "pool.prewarm_per_shard",
            "cannot exceed pool.max_idle_per_shard",
        ));
    }
    if pool.buffer_prewarm_per_shard > pool.max_idle_per_shard {
        errors.push(ValidationError::new(
            "pool.buffer_prewarm_per_shard",
            "cannot exceed pool.max_idle_per_shard",
        ));
    }
    if pool.buffer_capacity == 0 {
        errors.push(ValidationError::new("pool.buffer_capacity", "must be greater than 0"));
    }

    for (direction, filters) in [("receive", &config.filters.receive), ("send", &config.filters.send)] {
        for (index, filter) in filters.iter().enumerate() {
            let field = format!("filters.{}[{}]", direction, index);
            validate_filter(&field, filter, &mut errors);
        }
    }

    if !LOG_LEVELS.contains(&config.observability.log_level.as_str()) {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("'{}' is not one of {}", config.observability.log_level, LOG_LEVELS.join(", ")),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_filter(field: &str, filter: &FilterConfig, errors: &mut Vec<ValidationError>) {
    match filter {
        FilterConfig::HeaderInject(config) => {
            for (name, value) in &config.headers {
                if let Err(err) = parse_header(name, value) {
                    errors.push(ValidationError::new(format!("{}.headers", field), err.to_string()));
                }
            }
        }
        FilterConfig::FaultInject(config) => {
            if !(0.0..=100.0).contains(&config.percentage) {
                errors.push(ValidationError::new(
                    format!("{}.percentage", field),
                    "must be between 0 and 100",
                ));
            }
        }
        FilterConfig::BodyBuffer(config) => {
            if config.max_bytes == 0 {
                errors.push(ValidationError::new(
                    format!("{}.max_bytes", field),
                    "must be greater than 0",
                ));
            }
        }
    }
}

fn has_port(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}
