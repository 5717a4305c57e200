//! Share assembler.
//!
//! Collects incoming shares per `(hash, data_offset)` group until `required`
//! of them are buffered, then hands exactly that many to the decoder. A
//! periodic sweep evicts groups that went quiet without completing.
//!
//! Files with identical content share a group key, so each group keeps one
//! queue per sender path and a batch never mixes shares of two paths.

use crate::cache::ConcurrentMap;
use crate::streaming::channel::{forward, ShareBatch, SharedReceiver};
use crate::streaming::protocol::{Chunk, ContentHash};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Cache key: one FEC group
type GroupKey = (ContentHash, i64);

struct Pending {
    /// Shares waiting to be drained, per sender path
    by_path: HashMap<String, VecDeque<Chunk>>,

    /// Time of the last accepted share
    last_update: Instant,

    /// Set by the sweep when it evicts the entry
    closed: bool,
}

impl Pending {
    fn buffered(&self) -> usize {
        self.by_path.values().map(VecDeque::len).sum()
    }

    fn has_batch(&self, required: usize) -> bool {
        self.by_path.values().any(|queue| queue.len() >= required)
    }

    fn take_batch(&mut self, required: usize) -> Option<ShareBatch> {
        let queue = self
            .by_path
            .values_mut()
            .find(|queue| queue.len() >= required)?;
        Some(queue.drain(..required).collect())
    }
}

struct ShareEntry {
    pending: Mutex<Pending>,

    /// Held by the single worker that drains this entry
    drain_guard: Mutex<()>,
}

impl ShareEntry {
    fn new() -> Self {
        Self {
            pending: Mutex::new(Pending {
                by_path: HashMap::new(),
                last_update: Instant::now(),
                closed: false,
            }),
            drain_guard: Mutex::new(()),
        }
    }
}

/// Outcome of offering a share to one entry.
enum Offer {
    Accepted,
    Dropped,
    /// The entry was evicted; the share goes back to the caller
    Closed(Chunk),
}

pub struct ShareAssembler {
    required: usize,
    total: usize,

    /// Per-path buffer cap; shares past it are dropped
    capacity: usize,

    cache: ConcurrentMap<GroupKey, Arc<ShareEntry>>,
}

impl ShareAssembler {
    pub fn new(required: usize, total: usize) -> Self {
        Self {
            required,
            total,
            capacity: total * 2,
            cache: ConcurrentMap::new(),
        }
    }

    /// Number of groups currently buffered.
    pub fn pending_groups(&self) -> usize {
        self.cache.len()
    }

    /// Buffer one share and return any batches that became complete.
    ///
    /// Only the worker that wins the entry's drain guard forwards a batch.
    /// Losing the `try_lock` is not an error: the holder re-checks the
    /// buffer after releasing the guard and drains whatever was added
    /// meanwhile. Shares that keep arriving after a drain refill the entry
    /// and can complete a second, redundant batch.
    pub fn add(&self, share: Chunk) -> Vec<ShareBatch> {
        if share.share_index as usize >= self.total || share.data_padding as usize >= self.required
        {
            warn!(
                path = %share.path,
                hash = %share.hash_hex(),
                offset = share.data_offset,
                "Dropping share with index {} / padding {} outside ({}, {})",
                share.share_index,
                share.data_padding,
                self.required,
                self.total
            );
            return Vec::new();
        }

        let key = (share.hash, share.data_offset);
        let mut share = share;
        loop {
            let entry = self
                .cache
                .get_or_insert_with(key, || Arc::new(ShareEntry::new()));
            match self.offer(&entry, share) {
                Offer::Accepted => return self.drain(&entry),
                Offer::Dropped => return Vec::new(),
                // Evicted between lookup and lock: retry on a fresh entry
                Offer::Closed(returned) => share = returned,
            }
        }
    }

    fn offer(&self, entry: &ShareEntry, share: Chunk) -> Offer {
        let mut pending = entry.pending.lock();
        if pending.closed {
            return Offer::Closed(share);
        }
        let queue = pending.by_path.entry(share.path.clone()).or_default();
        if queue.iter().any(|s| s.share_index == share.share_index) {
            return Offer::Dropped;
        }
        if queue.len() >= self.capacity {
            debug!(
                path = %share.path,
                hash = %share.hash_hex(),
                offset = share.data_offset,
                "Share buffer full, dropping share {}",
                share.share_index
            );
            return Offer::Dropped;
        }
        queue.push_back(share);
        pending.last_update = Instant::now();
        Offer::Accepted
    }

    fn drain(&self, entry: &ShareEntry) -> Vec<ShareBatch> {
        let mut batches = Vec::new();
        while entry.pending.lock().has_batch(self.required) {
            let Some(_guard) = entry.drain_guard.try_lock() else {
                break;
            };
            let mut pending = entry.pending.lock();
            while let Some(batch) = pending.take_batch(self.required) {
                batches.push(batch);
            }
        }
        batches
    }

    /// Evict every group idle for longer than `quiet`. Returns the number
    /// of evicted groups.
    ///
    /// The idle check and the `closed` mark happen under the entry lock, so a
    /// share is either accepted before eviction or retried on a new entry.
    pub fn sweep(&self, quiet: Duration) -> usize {
        let mut evicted = 0;
        for key in self.cache.keys() {
            let removed = self.cache.remove_if(&key, |entry| {
                let mut pending = entry.pending.lock();
                pending.closed = pending.last_update.elapsed() > quiet;
                pending.closed
            });
            if let Some(entry) = removed {
                let buffered = entry.pending.lock().buffered();
                if buffered > 0 {
                    debug!(
                        hash = %hex::encode(key.0),
                        offset = key.1,
                        "Evicting share group with {} unused shares",
                        buffered
                    );
                }
                evicted += 1;
            }
        }
        evicted
    }

    /// Assembler worker: shares in, complete batches out.
    pub async fn run(
        self: Arc<Self>,
        input: SharedReceiver<Chunk>,
        output: mpsc::Sender<ShareBatch>,
        cancel: CancellationToken,
    ) {
        while let Some(share) = input.recv(&cancel).await {
            for batch in self.add(share) {
                if !forward(&output, batch, &cancel).await {
                    return;
                }
            }
        }
    }

    /// Periodic eviction of stale groups.
    pub async fn run_sweeper(
        self: Arc<Self>,
        interval: Duration,
        quiet: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let evicted = self.sweep(quiet);
                    if evicted > 0 {
                        debug!("Share sweep evicted {} groups", evicted);
                    }
                }
            }
        }
    }
}
