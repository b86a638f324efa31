//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (shards > 0, buffer sizes sane)
//! - Check the bind address and response version are well formed
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ServerConfig;

/// Smallest read buffer that still holds a typical request line.
pub const MIN_READ_BUFFER: usize = 64;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Check a parsed configuration, collecting every violation.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be at least 1"));
    }

    let event_loop = &config.event_loop;
    if event_loop.shards == 0 {
        errors.push(ValidationError::new("event_loop.shards", "must be at least 1"));
    }
    if event_loop.read_buffer_size < MIN_READ_BUFFER {
        errors.push(ValidationError::new(
            "event_loop.read_buffer_size",
            format!("must be at least {}", MIN_READ_BUFFER),
        ));
    }
    if event_loop.max_request_bytes < event_loop.read_buffer_size {
        errors.push(ValidationError::new(
            "event_loop.max_request_bytes",
            "must not be smaller than read_buffer_size",
        ));
    }
    if event_loop.max_events == 0 {
        errors.push(ValidationError::new("event_loop.max_events", "must be at least 1"));
    }

    if config.worker_pool.workers == 0 {
        errors.push(ValidationError::new("worker_pool.workers", "must be at least 1"));
    }
    if config.worker_pool.queue_depth == 0 {
        errors.push(ValidationError::new("worker_pool.queue_depth", "must be at least 1"));
    }

    if config.strategy.max_ttl < -1 {
        errors.push(ValidationError::new(
            "strategy.max_ttl",
            "must be -1 (no ceiling) or a non-negative budget",
        ));
    }

    if !config.response.version.starts_with("HTTP/") {
        errors.push(ValidationError::new(
            "response.version",
            format!("'{}' does not start with HTTP/", config.response.version),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn flags_bad_address_and_version() {
        let mut config = ServerConfig::default();
        config.listener.bind_address = "localhost".into();
        config.response.version = "SPDY/3".into();

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["listener.bind_address", "response.version"]);
    }

    #[test]
    fn request_ceiling_must_cover_read_buffer() {
        let mut config = ServerConfig::default();
        config.event_loop.read_buffer_size = 8192;
        config.event_loop.max_request_bytes = 4096;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "event_loop.max_request_bytes");
    }
}
