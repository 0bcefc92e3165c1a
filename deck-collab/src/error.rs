//! Error types for the sync core.
//!
//! Every failure here degrades to "the operation did not take effect";
//! nothing in the crate is meant to take the process down. Expected lock
//! conflicts are not errors at all; they are reported through
//! [`crate::lock::LockResult`].

use thiserror::Error;

use crate::protocol::ProtocolError;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// Connection creation or send failure. Not retried by the pool.
    #[error("transport error: {0}")]
    Transport(String),

    /// A single update failed to decode, apply or compress.
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A queued `acquire` gave up waiting for a connection.
    #[error("timed out waiting for a connection to room {room}")]
    AcquireTimeout { room: String },

    #[error("connection pool is shut down")]
    PoolClosed,

    /// The shard owning a slide could not be loaded.
    #[error("shard for slide {slide_id} is unavailable")]
    ShardUnavailable { slide_id: String },

    /// A shard's in-flight load, started by another caller, did not finish.
    #[error("shard {shard_id} could not be loaded")]
    ShardLoadFailed { shard_id: usize },

    #[error("unknown slide {0}")]
    UnknownSlide(String),

    #[error("unknown component {0}")]
    UnknownComponent(String),

    /// Background/base elements cannot be removed through component CRUD.
    #[error("component {0} is a base element and cannot be removed")]
    ProtectedComponent(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

impl From<yrs::encoding::read::Error> for SyncError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        SyncError::Encoding(e.to_string())
    }
}
