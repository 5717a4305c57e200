//! File writer.
//!
//! Decoded chunks land in one temp file per `(path, hash)` at their byte
//! offset. There is no end-of-file marker on the wire: a file is considered
//! complete once it has received no writes for the quiet period, at which
//! point the sweep hands it to the closer.
//!
//! Chunks for a `(path, hash)` the closer has already delivered are dropped
//! instead of reopening a temp file.

use crate::cache::ConcurrentMap;
use crate::error::{Result, TransferError};
use crate::streaming::closer::FileCloser;
use crate::streaming::channel::{forward, FinishedFile, SharedReceiver};
use crate::streaming::protocol::{Chunk, ContentHash};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type FileKey = (String, ContentHash);

/// Deterministic temp file name for a transfer.
///
/// Separators and drive colons are flattened so the name never escapes the
/// temp directory.
pub fn temp_file_name(path: &str, hash: &ContentHash) -> String {
    let flat: String = path
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect();
    format!("{}___{}.tmp", flat, hex::encode(hash))
}

struct OpenFile {
    temp_path: PathBuf,
    path: String,
    hash: ContentHash,
    file: Mutex<File>,
    last_write: Mutex<Instant>,
}

impl OpenFile {
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)
    }
}

pub struct FileWriter {
    temp_dir: PathBuf,

    /// Whether received payloads are zstd archives
    archived: bool,

    cache: ConcurrentMap<FileKey, Arc<OpenFile>>,

    /// Consulted before opening a temp file for a new `(path, hash)`
    closer: Option<Arc<FileCloser>>,
}

impl FileWriter {
    pub fn new(temp_dir: impl Into<PathBuf>, archived: bool) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            archived,
            cache: ConcurrentMap::new(),
            closer: None,
        }
    }

    pub fn with_closer(mut self, closer: Arc<FileCloser>) -> Self {
        self.closer = Some(closer);
        self
    }

    /// Number of temp files currently open.
    pub fn open_files(&self) -> usize {
        self.cache.len()
    }

    fn open(&self, chunk: &Chunk) -> Result<Option<Arc<OpenFile>>> {
        let key = (chunk.path.clone(), chunk.hash);
        if let Some(entry) = self.cache.get(&key) {
            return Ok(Some(entry));
        }
        if let Some(closer) = &self.closer {
            if closer.is_delivered(&chunk.path, &chunk.hash, self.archived) {
                debug!(
                    path = %chunk.path,
                    hash = %chunk.hash_hex(),
                    offset = chunk.data_offset,
                    "Dropping chunk of an already received file"
                );
                return Ok(None);
            }
        }

        let temp_path = self.temp_dir.join(temp_file_name(&chunk.path, &chunk.hash));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&temp_path)?;
        debug!(
            path = %chunk.path,
            temp_file = %temp_path.display(),
            "Opened temp file"
        );

        Ok(Some(self.cache.get_or_insert_with(key, || {
            Arc::new(OpenFile {
                temp_path,
                path: chunk.path.clone(),
                hash: chunk.hash,
                file: Mutex::new(file),
                last_write: Mutex::new(Instant::now()),
            })
        })))
    }

    /// Write one decoded chunk at its offset.
    pub async fn write(&self, chunk: &Chunk) -> Result<()> {
        let offset = u64::try_from(chunk.data_offset).map_err(|_| {
            TransferError::MalformedChunk(format!("negative data offset {}", chunk.data_offset))
        })?;
        let Some(entry) = self.open(chunk)? else {
            return Ok(());
        };

        let target = Arc::clone(&entry);
        let data: Bytes = chunk.data.clone();
        tokio::task::spawn_blocking(move || target.write_at(offset, &data))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        *entry.last_write.lock() = Instant::now();
        Ok(())
    }

    /// Remove every file idle for longer than `quiet`, flush it to disk and
    /// return it as a finalization candidate.
    pub async fn sweep(&self, quiet: Duration) -> Vec<FinishedFile> {
        let mut finished = Vec::new();
        for key in self.cache.keys() {
            let removed = self
                .cache
                .remove_if(&key, |entry| entry.last_write.lock().elapsed() > quiet);
            let Some(entry) = removed else {
                continue;
            };

            let flushed = Arc::clone(&entry);
            let synced = match tokio::task::spawn_blocking(move || flushed.file.lock().sync_all())
                .await
            {
                Ok(res) => res,
                Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
            };
            if let Err(e) = synced {
                warn!(
                    path = %entry.path,
                    temp_file = %entry.temp_path.display(),
                    "Failed to sync temp file: {}",
                    e
                );
            }

            finished.push(FinishedFile {
                temp_path: entry.temp_path.clone(),
                path: entry.path.clone(),
                hash: entry.hash,
                archived: self.archived,
            });
        }
        finished
    }

    /// Writer worker: decoded chunks in, bytes on disk.
    pub async fn run(self: Arc<Self>, input: SharedReceiver<Chunk>, cancel: CancellationToken) {
        while let Some(chunk) = input.recv(&cancel).await {
            if let Err(e) = self.write(&chunk).await {
                error!(
                    path = %chunk.path,
                    hash = %chunk.hash_hex(),
                    offset = chunk.data_offset,
                    "Error writing chunk: {}",
                    e
                );
            }
        }
    }

    /// Periodically hand quiet files to the closer.
    pub async fn run_sweeper(
        self: Arc<Self>,
        interval: Duration,
        quiet: Duration,
        output: mpsc::Sender<FinishedFile>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    for file in self.sweep(quiet).await {
                        info!(
                            path = %file.path,
                            temp_file = %file.temp_path.display(),
                            "File went quiet, finalizing"
                        );
                        if !forward(&output, file, &cancel).await {
                            return;
                        }
                    }
                }
            }
        }
    }
}
