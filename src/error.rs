//! Error types shared by the codec, the connection runtime and the server.

use crate::config::ConfigError;

/// Central error type for framewire operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Framing errors ===
    #[error("Malformed header: expected {expected} bytes, got {actual}")]
    MalformedHeader { expected: usize, actual: usize },

    #[error("Package too large: {size} bytes (max: {max})")]
    PackageTooLarge { size: u64, max: u64 },

    #[error("Body length mismatch: header declared {declared} bytes, body has {actual}")]
    BodyLengthMismatch { declared: u32, actual: usize },

    // === Connection errors ===
    #[error("Connection {0} is closed")]
    ConnectionClosed(u32),

    #[error("Connection {0} not found")]
    ConnectionNotFound(u32),

    #[error("Property not found: {0}")]
    PropertyNotFound(String),

    #[error("Property '{0}' holds a value of a different type")]
    PropertyType(String),

    // === Dispatch errors ===
    #[error("Router already registered for msg id {0}")]
    DuplicateRouter(u32),

    #[error("Worker task queue is closed")]
    TaskQueueClosed,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
