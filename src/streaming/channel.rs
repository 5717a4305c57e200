//! Channel types for the transfer pipeline.
//!
//! Sender:   QueueReader -> FileReader -> FecEncoder -> Limiter -> UdpSender
//! Receiver: UdpReceiver -> ShareAssembler -> FecDecoder -> FileWriter -> FileCloser
//!
//! Every stage is a pool of workers pulling from one bounded channel and
//! pushing into the next one, so a full downstream channel backpressures
//! the whole chain.

use crate::streaming::protocol::{Chunk, ContentHash};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Claimed files waiting to be read (queue reader -> file reader)
pub const QUEUE_CHANNEL_SIZE: usize = 10;

/// Raw chunks waiting for FEC (file reader -> encoder)
pub const CHUNK_CHANNEL_SIZE: usize = 100;

/// Encoded shares waiting for the limiter
pub const SHARE_CHANNEL_SIZE: usize = 100;

/// Rate-limited shares waiting for a socket. Kept tiny so the limiter,
/// not this buffer, decides when datagrams leave.
pub const LIMITED_CHANNEL_SIZE: usize = 5;

/// Received shares waiting for the assembler
pub const RECEIVED_CHANNEL_SIZE: usize = 100;

/// Share batches waiting for the decoder
pub const BATCH_CHANNEL_SIZE: usize = 100;

/// Decoded chunks waiting for the writer
pub const DECODED_CHANNEL_SIZE: usize = 100;

/// Finalization candidates waiting for the closer
pub const FINISHED_CHANNEL_SIZE: usize = 5;

// =============================================================================
// Pipeline items
// =============================================================================

/// A file claimed from the work queue, ready to be read and sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileJob {
    /// Absolute source path
    pub path: String,

    /// Digest recorded when the file was queued
    pub hash: ContentHash,

    /// Whether the file is zstd-archived before chunking
    pub archived: bool,
}

/// `required` shares of one (hash, offset) group, handed to the decoder.
pub type ShareBatch = Vec<Chunk>;

/// A temp file that went quiet and is ready for verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedFile {
    /// Temp file holding the reassembled data
    pub temp_path: PathBuf,

    /// Original source path
    pub path: String,

    /// Digest the reassembled data must match
    pub hash: ContentHash,

    /// Whether the payload is a zstd archive
    pub archived: bool,
}

// =============================================================================
// Shared receivers
// =============================================================================

/// Receiving end of a stage channel shared by every worker of the stage.
///
/// Only one worker waits on the channel at a time; the rest queue on the
/// lock, which gives the multi-consumer behavior tokio's mpsc lacks.
pub struct SharedReceiver<T> {
    inner: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for SharedReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> SharedReceiver<T> {
    pub fn new(rx: mpsc::Receiver<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(rx)),
        }
    }

    /// Next item, or `None` once the channel is closed or `cancel` fires.
    pub async fn recv(&self, cancel: &CancellationToken) -> Option<T> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            item = async { self.inner.lock().await.recv().await } => item,
        }
    }
}

/// Create a bounded stage channel whose receiver can be shared by a pool.
pub fn stage_channel<T>(size: usize) -> (mpsc::Sender<T>, SharedReceiver<T>) {
    let (tx, rx) = mpsc::channel(size);
    (tx, SharedReceiver::new(rx))
}

/// Push an item downstream, waiting for room.
///
/// Returns `false` when the pipeline is shutting down (cancelled or the
/// downstream stage is gone); the item is abandoned.
pub async fn forward<T>(tx: &mpsc::Sender<T>, item: T, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        res = tx.send(item) => res.is_ok(),
    }
}

// =============================================================================
// Tests
// =============================================================================
