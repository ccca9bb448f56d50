use thiserror::Error;

use crate::protocol::DecodeError;

/// Unified error type for quire operations
#[derive(Debug, Error)]
pub enum QuireError {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Wire protocol errors
    #[error("frame decode error: {0}")]
    Decode(#[from] DecodeError),

    // Sync frame referenced a guid outside the connection's location
    #[error("unknown document '{guid}' for location '{location}'")]
    UnknownDocument { guid: String, location: String },

    // Persistence errors
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("legacy storage migration failed: {0}")]
    Migration(String),

    // CRDT errors (decode/apply failures surfaced by yrs)
    #[error("CRDT error: {0}")]
    Crdt(String),

    // Transport-level failures (socket errors, send on closed connection)
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type alias for quire operations
pub type Result<T> = std::result::Result<T, QuireError>;
