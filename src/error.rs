//! Error taxonomy.
//!
//! # Design Decisions
//! - Parse failures are tagged by the stage that rejected the input
//! - Parse failures never reach the caller as errors: they become abort 403
//! - Transport failures close the socket without a response
//! - Poller creation failure is fatal at startup; per-fd failures are not

use thiserror::Error;

use crate::config::loader::ConfigError;

/// Failure while turning raw bytes into a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// No `CRLFCRLF` separates the header block from the body.
    #[error("missing header terminator")]
    MissingTerminator,

    /// The request line did not split into method, target and version.
    #[error("request line has {tokens} tokens, expected 3")]
    RequestLine { tokens: usize },

    /// The request target could not be parsed as a path with optional query.
    #[error("invalid request target: {0}")]
    Target(String),

    /// The header block is not valid UTF-8.
    #[error("header block is not valid UTF-8")]
    Encoding,

    /// `Content-Length` is present but not a non-negative integer.
    #[error("invalid content-length: {0}")]
    ContentLength(String),

    /// The request exceeds the configured size ceiling.
    #[error("request of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },
}

/// Failure while decoding a request body.
#[derive(Debug, Error)]
pub enum BodyError {
    /// The request declared a content type that is not JSON.
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that stop a server from starting or running.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The readiness multiplexer could not be created.
    #[error("poller setup failed: {0}")]
    Poller(#[source] std::io::Error),

    /// The listening socket could not be bound.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Any other I/O failure outside a single connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}
