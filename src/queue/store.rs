//! Durable transfer records.
//!
//! Two fjall partitions:
//! - `transfers`: record key -> bincode `TransferRecord`
//! - `pending`:   queued_at (big-endian) + record key -> empty, the claim order
//!
//! The record key is `path \0 hex(hash)`, so the same path with new content
//! is a new transfer.

use crate::error::{Result, TransferError};
use crate::queue::spool::Spool;
use crate::streaming::protocol::ContentHash;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// Status of one file transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Absolute source path
    pub path: String,

    /// Digest of the transferred bytes
    pub hash: ContentHash,

    /// Payload is zstd-archived before chunking
    pub archived: bool,

    pub started: bool,
    pub finished: bool,
    pub success: bool,

    /// Unix millis when the record was queued
    pub queued_at: i64,

    /// Unix millis of the last status change
    pub updated_at: i64,
}

impl TransferRecord {
    /// A new record waiting to be sent.
    pub fn pending(path: impl Into<String>, hash: ContentHash, archived: bool) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            path: path.into(),
            hash,
            archived,
            started: false,
            finished: false,
            success: false,
            queued_at: now,
            updated_at: now,
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.started && !self.finished
    }

    fn key(&self) -> Vec<u8> {
        record_key(&self.path, &self.hash)
    }

    fn pending_key(&self) -> Vec<u8> {
        let mut key = (self.queued_at.max(0) as u64).to_be_bytes().to_vec();
        key.extend_from_slice(&self.key());
        key
    }
}

fn record_key(path: &str, hash: &ContentHash) -> Vec<u8> {
    let mut key = path.as_bytes().to_vec();
    key.push(0);
    key.extend_from_slice(hex::encode(hash).as_bytes());
    key
}

pub struct TransferQueue {
    keyspace: Keyspace,
    transfers: PartitionHandle,
    pending: PartitionHandle,

    /// Serializes read-modify-write of records
    write_lock: Mutex<()>,
}

impl TransferQueue {
    /// Open (or create) the store under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let keyspace = fjall::Config::new(dir).open()?;
        let transfers = keyspace.open_partition("transfers", PartitionCreateOptions::default())?;
        let pending = keyspace.open_partition("pending", PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            transfers,
            pending,
            write_lock: Mutex::new(()),
        })
    }

    pub fn get(&self, path: &str, hash: &ContentHash) -> Result<Option<TransferRecord>> {
        self.load(&record_key(path, hash))
    }

    fn load(&self, key: &[u8]) -> Result<Option<TransferRecord>> {
        match self.transfers.get(key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write `record`, keeping the pending index in step with its status.
    fn store(&self, previous: Option<&TransferRecord>, record: &TransferRecord) -> Result<()> {
        let mut batch = self.keyspace.batch();
        if let Some(prev) = previous {
            if prev.is_pending() {
                batch.remove(&self.pending, prev.pending_key());
            }
        }
        if record.is_pending() {
            batch.insert(&self.pending, record.pending_key(), Vec::<u8>::new());
        }
        batch.insert(&self.transfers, record.key(), bincode::serialize(record)?);
        batch.commit()?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    /// Queue a record for sending. Re-queuing an existing transfer resets
    /// its status.
    pub fn enqueue(&self, mut record: TransferRecord) -> Result<()> {
        let _guard = self.write_lock.lock();
        let previous = self.load(&record.key())?;
        record.started = false;
        record.finished = false;
        record.success = false;
        self.store(previous.as_ref(), &record)?;
        debug!(path = %record.path, hash = %hex::encode(record.hash), "Queued transfer");
        Ok(())
    }

    /// Claim the oldest pending record, marking it started.
    pub fn next_pending(&self) -> Result<Option<TransferRecord>> {
        let _guard = self.write_lock.lock();
        loop {
            let Some(entry) = self.pending.iter().next() else {
                return Ok(None);
            };
            let (pending_key, _) = entry?;
            match self.load(&pending_key[8..])? {
                Some(record) if record.is_pending() => {
                    let mut claimed = record.clone();
                    claimed.started = true;
                    claimed.updated_at = chrono::Utc::now().timestamp_millis();
                    self.store(Some(&record), &claimed)?;
                    return Ok(Some(claimed));
                }
                _ => {
                    // Stale index entry
                    self.pending.remove(pending_key.to_vec())?;
                }
            }
        }
    }

    /// Update the status flags of an existing record.
    pub fn mark_status(
        &self,
        path: &str,
        hash: &ContentHash,
        started: bool,
        finished: bool,
        success: bool,
    ) -> Result<()> {
        let _guard = self.write_lock.lock();
        let previous = self.get(path, hash)?.ok_or_else(|| {
            TransferError::Queue(format!(
                "no transfer record for {} ({})",
                path,
                hex::encode(hash)
            ))
        })?;
        let mut record = previous.clone();
        record.started = started;
        record.finished = finished;
        record.success = success;
        record.updated_at = chrono::Utc::now().timestamp_millis();
        self.store(Some(&previous), &record)
    }

    /// Insert or replace a record as-is.
    pub fn save(&self, mut record: TransferRecord) -> Result<()> {
        let _guard = self.write_lock.lock();
        let previous = self.load(&record.key())?;
        if let Some(prev) = &previous {
            record.queued_at = prev.queued_at;
        }
        record.updated_at = chrono::Utc::now().timestamp_millis();
        self.store(previous.as_ref(), &record)
    }

    /// Every record, in key order.
    pub fn records(&self) -> Result<Vec<TransferRecord>> {
        self.transfers
            .iter()
            .map(|entry| {
                let (_, value) = entry?;
                Ok(bincode::deserialize(&value)?)
            })
            .collect()
    }

    /// Move every spooled submission into the store. Unreadable submissions
    /// are logged and discarded. Returns the number queued.
    pub fn ingest(&self, spool: &Spool) -> Result<usize> {
        let mut queued = 0;
        for file in spool.list()? {
            match spool.read(&file) {
                Ok(record) => {
                    self.enqueue(record)?;
                    queued += 1;
                }
                Err(e) => warn!("Discarding unreadable submission {}: {}", file.display(), e),
            }
            spool.remove(&file)?;
        }
        Ok(queued)
    }
}
