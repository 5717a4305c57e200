//! Submission spool.
//!
//! The store is owned by the running sender, so queue utilities and the
//! watcher submit work as small JSON files dropped into a directory. Each
//! file is written to a temp name and renamed into place, so the sender
//! never sees a half-written submission.

use crate::error::{Result, TransferError};
use crate::queue::store::TransferRecord;
use crate::streaming::protocol::{ContentHash, HASH_SIZE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const SUBMISSION_EXTENSION: &str = "json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Submission {
    path: String,
    hash: String,
    archived: bool,
    submitted_at: i64,
}

#[derive(Debug, Clone)]
pub struct Spool {
    dir: PathBuf,
}

impl Spool {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Drop a submission for `path` into the spool.
    pub fn submit(&self, path: &str, hash: &ContentHash, archived: bool) -> Result<PathBuf> {
        let submission = Submission {
            path: path.to_string(),
            hash: hex::encode(hash),
            archived,
            submitted_at: chrono::Utc::now().timestamp_millis(),
        };
        let body = serde_json::to_vec_pretty(&submission)
            .map_err(|e| TransferError::Queue(format!("encoding submission: {}", e)))?;

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;

        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let target = self.dir.join(format!(
            "{:020}-{}.{}",
            nanos,
            &submission.hash[..16],
            SUBMISSION_EXTENSION
        ));
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(target)
    }

    /// Submission files in submission order.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(SUBMISSION_EXTENSION) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Parse one submission into a pending record.
    pub fn read(&self, file: &Path) -> Result<TransferRecord> {
        let body = fs::read(file)?;
        let submission: Submission = serde_json::from_slice(&body)
            .map_err(|e| TransferError::Queue(format!("parsing submission: {}", e)))?;
        let hash: ContentHash = hex::decode(&submission.hash)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| {
                TransferError::Queue(format!(
                    "submission hash is not {} hex bytes: {}",
                    HASH_SIZE, submission.hash
                ))
            })?;

        let mut record = TransferRecord::pending(submission.path, hash, submission.archived);
        record.queued_at = submission.submitted_at;
        Ok(record)
    }

    pub fn remove(&self, file: &Path) -> Result<()> {
        fs::remove_file(file)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::store::TransferQueue;
    use tempfile::TempDir;

    #[test]
    fn test_submit_and_read() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path().join("spool")).unwrap();

        let file = spool.submit("/data/a.bin", &[0xCD; 32], true).unwrap();
        assert_eq!(spool.list().unwrap(), vec![file.clone()]);

        let record = spool.read(&file).unwrap();
        assert_eq!(record.path, "/data/a.bin");
        assert_eq!(record.hash, [0xCD; 32]);
        assert!(record.archived);
        assert!(record.is_pending());
    }

    #[test]
    fn test_list_ignores_partial_files() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();
        fs::write(dir.path().join(".tmpXYZ"), b"{").unwrap();
        assert!(spool.list().unwrap().is_empty());
    }

    #[test]
    fn test_bad_hash_rejected() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();
        let file = dir.path().join("bad.json");
        fs::write(
            &file,
            br#"{"path":"/x","hash":"abcd","archived":false,"submitted_at":0}"#,
        )
        .unwrap();
        assert!(matches!(spool.read(&file), Err(TransferError::Queue(_))));
    }

    #[test]
    fn test_ingest_moves_submissions_into_store() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path().join("spool")).unwrap();
        let queue = TransferQueue::open(&dir.path().join("db")).unwrap();

        spool.submit("/a", &[1; 32], false).unwrap();
        spool.submit("/b", &[2; 32], false).unwrap();
        fs::write(spool.dir().join("garbage.json"), b"not json").unwrap();

        assert_eq!(queue.ingest(&spool).unwrap(), 2);
        assert!(spool.list().unwrap().is_empty());
        assert_eq!(queue.next_pending().unwrap().unwrap().path, "/a");
        assert_eq!(queue.next_pending().unwrap().unwrap().path, "/b");
    }
}
