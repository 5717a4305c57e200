//! File closer.
//!
//! Verifies a quiet temp file against the digest it was sent with, moves it
//! into the output tree and records the outcome. A file that fails
//! verification stays in the temp directory.

use crate::error::{Result, TransferError};
use crate::hash::{self, ARCHIVE_EXTENSION};
use crate::queue::{TransferQueue, TransferRecord};
use crate::streaming::channel::{FinishedFile, SharedReceiver};
use crate::streaming::protocol::ContentHash;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Relative destination path for a sender path.
///
/// Drive colons are dropped, backslash-separated paths are split on `\`,
/// and empty, `.` and `..` components are discarded so the result always
/// stays below the output directory.
pub fn normalize_path(path: &str) -> PathBuf {
    let stripped = path.replace(':', "");
    let separator = if stripped.contains('\\') { '\\' } else { '/' };
    stripped
        .split(separator)
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .collect()
}

/// Final location of a received file under `out_dir`.
pub fn destination(out_dir: &Path, path: &str, archived: bool) -> Result<PathBuf> {
    let relative = normalize_path(path);
    if relative.as_os_str().is_empty() {
        return Err(TransferError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path {:?} has no usable components", path),
        )));
    }
    let mut dest = out_dir.join(relative).into_os_string();
    if archived {
        dest.push(".");
        dest.push(ARCHIVE_EXTENSION);
    }
    Ok(PathBuf::from(dest))
}

/// Rename, falling back to copy + rename when the temp and output
/// directories are on different filesystems.
async fn move_into_place(from: &Path, to: &Path) -> io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    let mut staging = to.as_os_str().to_owned();
    staging.push(".partial");
    let staging = PathBuf::from(staging);
    tokio::fs::copy(from, &staging).await?;
    tokio::fs::rename(&staging, to).await?;
    tokio::fs::remove_file(from).await
}

pub struct FileCloser {
    out_dir: PathBuf,
    queue: Arc<TransferQueue>,
}

impl FileCloser {
    pub fn new(out_dir: impl Into<PathBuf>, queue: Arc<TransferQueue>) -> Self {
        Self {
            out_dir: out_dir.into(),
            queue,
        }
    }

    /// Whether `(path, hash)` was already verified and its destination is
    /// still in place.
    pub fn is_delivered(&self, path: &str, hash: &ContentHash, archived: bool) -> bool {
        let delivered = match self.queue.get(path, hash) {
            Ok(Some(record)) => record.finished && record.success,
            Ok(None) => false,
            Err(e) => {
                warn!(path, "Failed to read transfer record: {}", e);
                false
            }
        };
        delivered
            && destination(&self.out_dir, path, archived)
                .map(|dest| dest.is_file())
                .unwrap_or(false)
    }

    /// Verify and relocate one file. Returns its final path.
    pub async fn close(&self, file: &FinishedFile) -> Result<PathBuf> {
        let temp_path = file.temp_path.clone();
        let actual = tokio::task::spawn_blocking(move || hash::hash_file(&temp_path))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        if actual != file.hash {
            return Err(TransferError::IntegrityMismatch {
                expected: hex::encode(file.hash),
                actual: hex::encode(actual),
            });
        }

        let dest = destination(&self.out_dir, &file.path, file.archived)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        move_into_place(&file.temp_path, &dest).await?;
        Ok(dest)
    }

    /// Close `file` and persist the outcome. Returns whether it succeeded.
    ///
    /// Chunks that trail a completed transfer can reopen a temp file after
    /// the first copy was moved into place. Such a file is discarded and the
    /// recorded success is left untouched.
    pub async fn finalize(&self, file: &FinishedFile) -> bool {
        if self.is_delivered(&file.path, &file.hash, file.archived) {
            info!(
                path = %file.path,
                hash = %hex::encode(file.hash),
                temp_file = %file.temp_path.display(),
                "File already received, discarding late temp file"
            );
            if let Err(e) = tokio::fs::remove_file(&file.temp_path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(temp_file = %file.temp_path.display(), "Failed to remove temp file: {}", e);
                }
            }
            return true;
        }

        let success = match self.close(file).await {
            Ok(dest) => {
                info!(
                    path = %file.path,
                    hash = %hex::encode(file.hash),
                    dest = %dest.display(),
                    "Successfully received file"
                );
                true
            }
            Err(e) => {
                error!(
                    path = %file.path,
                    hash = %hex::encode(file.hash),
                    temp_file = %file.temp_path.display(),
                    "Failed to finalize file: {}",
                    e
                );
                false
            }
        };

        let mut record = TransferRecord::pending(file.path.clone(), file.hash, file.archived);
        record.started = true;
        record.finished = true;
        record.success = success;

        let queue = Arc::clone(&self.queue);
        match tokio::task::spawn_blocking(move || queue.save(record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(path = %file.path, "Failed to record transfer: {}", e),
            Err(e) => warn!(path = %file.path, "Failed to record transfer: {}", e),
        }
        success
    }

    /// Closer worker.
    pub async fn run(self: Arc<Self>, input: SharedReceiver<FinishedFile>, cancel: CancellationToken) {
        while let Some(file) = input.recv(&cancel).await {
            self.finalize(&file).await;
        }
    }
}
