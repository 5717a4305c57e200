//! Error types shared by the transfer pipeline.
//!
//! Each variant maps to one failure class of the one-way protocol. Per-item
//! failures (a bad datagram, an unrecoverable share batch) are logged by the
//! worker that hit them and never stop the stage.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    /// Datagram bytes that do not decode into a chunk
    #[error("malformed chunk: {0}")]
    MalformedChunk(String),

    /// Erasure parameters that cannot build a codec
    #[error("invalid FEC parameters: required={required}, total={total}")]
    InvalidFecParameters { required: usize, total: usize },

    /// Too few or inconsistent shares to rebuild a chunk
    #[error("reconstruction failed: {0}")]
    ReconstructionFailure(String),

    /// Reassembled file does not hash to the expected digest
    #[error("hash mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    /// Socket creation, bind or write failure
    #[error("transport error ({context}): {source}")]
    Transport {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("queue error: {0}")]
    Queue(String),
}

impl TransferError {
    pub fn transport(context: impl Into<String>, source: io::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source,
        }
    }
}

impl From<fjall::Error> for TransferError {
    fn from(e: fjall::Error) -> Self {
        Self::Queue(e.to_string())
    }
}

impl From<bincode::Error> for TransferError {
    fn from(e: bincode::Error) -> Self {
        Self::Queue(format!("record encoding: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
