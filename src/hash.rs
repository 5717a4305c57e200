//! Content hashing and the optional zstd archive transform.
//!
//! The digest that travels with every chunk is BLAKE3 over exactly the bytes
//! that are sent: the file itself, or its zstd stream when archived.

use crate::error::Result;
use crate::streaming::protocol::ContentHash;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use tempfile::NamedTempFile;

/// zstd level used for archived transfers
pub const ARCHIVE_LEVEL: i32 = 3;

/// Extension appended to archived files at the destination
pub const ARCHIVE_EXTENSION: &str = "zst";

/// BLAKE3 digest of a file's contents.
pub fn hash_file(path: &Path) -> Result<ContentHash> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(*hasher.finalize().as_bytes())
}

/// BLAKE3 digest of the zstd archive of a file, without writing it out.
pub fn hash_archived(path: &Path) -> Result<ContentHash> {
    let reader = BufReader::new(File::open(path)?);
    let mut hasher = blake3::Hasher::new();
    zstd::stream::copy_encode(reader, &mut hasher, ARCHIVE_LEVEL)?;
    Ok(*hasher.finalize().as_bytes())
}

/// Digest of the bytes that will be transferred for `path`.
pub fn transfer_hash(path: &Path, archived: bool) -> Result<ContentHash> {
    if archived {
        hash_archived(path)
    } else {
        hash_file(path)
    }
}

/// Compress `path` into a temp file in `dir`. The file is removed when the
/// returned handle drops.
pub fn archive_to_temp(path: &Path, dir: &Path) -> Result<NamedTempFile> {
    let reader = BufReader::new(File::open(path)?);
    let mut archive = NamedTempFile::new_in(dir)?;
    zstd::stream::copy_encode(reader, archive.as_file_mut(), ARCHIVE_LEVEL)?;
    archive.as_file().sync_all()?;
    Ok(archive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hash_file_matches_blake3() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"one way only").unwrap();

        assert_eq!(
            hash_file(&path).unwrap(),
            *blake3::hash(b"one way only").as_bytes()
        );
    }

    #[test]
    fn test_archive_hash_matches_archive_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, vec![b'x'; 100_000]).unwrap();

        let archive = archive_to_temp(&path, dir.path()).unwrap();
        let archived_bytes = std::fs::read(archive.path()).unwrap();
        assert!(archived_bytes.len() < 100_000);
        assert_eq!(
            hash_archived(&path).unwrap(),
            *blake3::hash(&archived_bytes).as_bytes()
        );
        assert_eq!(
            zstd::stream::decode_all(&archived_bytes[..]).unwrap(),
            vec![b'x'; 100_000]
        );
    }

    #[test]
    fn test_transfer_hash_switches_on_archived() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"payload").unwrap();

        assert_eq!(transfer_hash(&path, false).unwrap(), hash_file(&path).unwrap());
        assert_ne!(transfer_hash(&path, true).unwrap(), hash_file(&path).unwrap());
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        assert!(hash_file(&dir.path().join("nope")).is_err());
    }
}
