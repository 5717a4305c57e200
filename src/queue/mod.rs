//! Work queue: which files to send and how each transfer ended.

pub mod spool;
pub mod store;

pub use spool::Spool;
pub use store::{TransferQueue, TransferRecord};

use crate::error::{Result, TransferError};
use crate::hash;
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Hash `path` and submit it for sending. Returns the absolute path queued.
pub fn submit_file(spool: &Spool, path: &Path, archived: bool) -> Result<PathBuf> {
    let absolute = std::fs::canonicalize(path)?;
    if !absolute.is_file() {
        return Err(TransferError::Queue(format!(
            "{} is not a regular file",
            absolute.display()
        )));
    }
    let path_str = absolute
        .to_str()
        .ok_or_else(|| TransferError::Queue(format!("non UTF-8 path {}", absolute.display())))?;

    let digest = hash::transfer_hash(&absolute, archived)?;
    spool.submit(path_str, &digest, archived)?;
    info!(path = %path_str, hash = %hex::encode(digest), "Queued file");
    Ok(absolute)
}

/// Submit every regular file under `dir`. Hidden files are included and
/// ignore files are not honoured. Returns the number of files queued.
pub fn submit_tree(spool: &Spool, dir: &Path, archived: bool) -> Result<usize> {
    let walker = WalkBuilder::new(dir)
        .hidden(false)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .parents(false)
        .follow_links(false)
        .build();

    let mut queued = 0;
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        match submit_file(spool, entry.path(), archived) {
            Ok(_) => queued += 1,
            Err(e) => warn!(path = %entry.path().display(), "Failed to queue file: {}", e),
        }
    }
    Ok(queued)
}
