//! File reader.
//!
//! Turns a claimed file into raw chunks sized so that, once the encoder
//! splits them into `required` shards, every share fits in one datagram.

use crate::error::{Result, TransferError};
use crate::hash;
use crate::queue::TransferQueue;
use crate::streaming::channel::{forward, FileJob, SharedReceiver};
use crate::streaming::protocol::{overhead, Chunk};
use bytes::BytesMut;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct FileReader {
    queue: Arc<TransferQueue>,

    /// Datagram size
    chunk_size: usize,

    /// Data shards per chunk
    required: usize,

    /// Where archive temp files are written
    work_dir: PathBuf,
}

impl FileReader {
    pub fn new(
        queue: Arc<TransferQueue>,
        chunk_size: usize,
        required: usize,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            queue,
            chunk_size,
            required,
            work_dir: work_dir.into(),
        }
    }

    /// Raw bytes per chunk for `path`: one datagram's payload per shard.
    pub fn piece_size(&self, path: &str) -> Result<usize> {
        let per_share = self.chunk_size.saturating_sub(overhead(path));
        if per_share == 0 {
            return Err(TransferError::Config(format!(
                "chunk size {} leaves no room for data with a {} byte path",
                self.chunk_size,
                path.len()
            )));
        }
        Ok(per_share * self.required)
    }

    /// Read `job` and push its raw chunks downstream.
    ///
    /// Returns `Ok(false)` if cancelled before the whole file was emitted.
    pub async fn send_file(
        &self,
        job: &FileJob,
        output: &mpsc::Sender<Chunk>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let piece_size = self.piece_size(&job.path)?;

        // Keep the archive alive until every chunk is read
        let archive = if job.archived {
            let source = PathBuf::from(&job.path);
            let work_dir = self.work_dir.clone();
            let archive = tokio::task::spawn_blocking(move || {
                hash::archive_to_temp(&source, &work_dir)
            })
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
            Some(archive)
        } else {
            None
        };
        let read_path: &Path = match &archive {
            Some(archive) => archive.path(),
            None => Path::new(&job.path),
        };

        let mut file = tokio::fs::File::open(read_path).await?;
        let mut offset: i64 = 0;
        loop {
            let mut buf = BytesMut::zeroed(piece_size);
            let mut filled = 0;
            while filled < piece_size {
                let n = file.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            buf.truncate(filled);

            let chunk = Chunk {
                path: job.path.clone(),
                hash: job.hash,
                data_offset: offset,
                data_padding: 0,
                share_index: 0,
                data: buf.freeze(),
            };
            if !forward(output, chunk, cancel).await {
                return Ok(false);
            }
            offset += filled as i64;

            if filled < piece_size {
                break;
            }
        }
        Ok(true)
    }

    async fn mark(&self, job: &FileJob, success: bool) {
        let queue = Arc::clone(&self.queue);
        let path = job.path.clone();
        let digest = job.hash;
        let marked =
            tokio::task::spawn_blocking(move || queue.mark_status(&path, &digest, true, true, success))
                .await;
        match marked {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(path = %job.path, "Failed to update transfer record: {}", e),
            Err(e) => warn!(path = %job.path, "Failed to update transfer record: {}", e),
        }
    }

    /// File reader worker: claimed files in, raw chunks out.
    pub async fn run(
        self: Arc<Self>,
        input: SharedReceiver<FileJob>,
        output: mpsc::Sender<Chunk>,
        cancel: CancellationToken,
    ) {
        while let Some(job) = input.recv(&cancel).await {
            match self.send_file(&job, &output, &cancel).await {
                Ok(true) => {
                    info!(
                        path = %job.path,
                        hash = %hex::encode(job.hash),
                        "Finished sending file"
                    );
                    self.mark(&job, true).await;
                }
                // Shutting down; the record stays started
                Ok(false) => return,
                Err(e) => {
                    error!(
                        path = %job.path,
                        hash = %hex::encode(job.hash),
                        "Failed to send file: {}",
                        e
                    );
                    self.mark(&job, false).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::TransferRecord;
    use crate::streaming::channel::stage_channel;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        queue: Arc<TransferQueue>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(TransferQueue::open(&dir.path().join("db")).unwrap());
        Fixture { dir, queue }
    }

    fn job_for(fx: &Fixture, name: &str, data: &[u8], archived: bool) -> FileJob {
        let path = fx.dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        let path = path.to_str().unwrap().to_string();
        let digest = hash::transfer_hash(Path::new(&path), archived).unwrap();
        fx.queue
            .enqueue(TransferRecord::pending(path.clone(), digest, archived))
            .unwrap();
        fx.queue.next_pending().unwrap();
        FileJob {
            path,
            hash: digest,
            archived,
        }
    }

    async fn drain(rx: &mut mpsc::Receiver<Chunk>) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn test_piece_size() {
        let fx = fixture();
        let reader = FileReader::new(Arc::clone(&fx.queue), 100, 2, fx.dir.path());
        assert_eq!(reader.piece_size("/x").unwrap(), (100 - 58) * 2);
        assert!(reader.piece_size(&"p".repeat(60)).is_err());
    }

    #[tokio::test]
    async fn test_chunks_cover_file_in_order() {
        let fx = fixture();
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let job = job_for(&fx, "f.bin", &data, false);
        let reader = FileReader::new(Arc::clone(&fx.queue), 300, 3, fx.dir.path());
        let piece = reader.piece_size(&job.path).unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        assert!(reader.send_file(&job, &tx, &cancel).await.unwrap());

        let chunks = drain(&mut rx).await;
        assert_eq!(chunks.len(), (1000 + piece - 1) / piece);
        let mut rebuilt = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.data_offset as usize, i * piece);
            assert_eq!(chunk.hash, job.hash);
            rebuilt.extend_from_slice(&chunk.data);
        }
        assert_eq!(rebuilt, data);
    }

    #[tokio::test]
    async fn test_archived_chunks_decompress_to_source() {
        let fx = fixture();
        let data = b"compressible ".repeat(500);
        let job = job_for(&fx, "a.txt", &data, true);
        let reader = FileReader::new(Arc::clone(&fx.queue), 512, 2, fx.dir.path());

        let (tx, mut rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        assert!(reader.send_file(&job, &tx, &cancel).await.unwrap());

        let archived: Vec<u8> = drain(&mut rx)
            .await
            .iter()
            .flat_map(|c| c.data.to_vec())
            .collect();
        assert_eq!(*blake3::hash(&archived).as_bytes(), job.hash);
        assert_eq!(zstd::stream::decode_all(&archived[..]).unwrap(), data);
    }

    #[tokio::test]
    async fn test_worker_marks_outcome() {
        let fx = fixture();
        let ok = job_for(&fx, "ok.bin", b"fine", false);
        let empty = job_for(&fx, "empty.bin", b"", false);
        let missing = job_for(&fx, "gone.bin", b"x", false);
        std::fs::remove_file(&missing.path).unwrap();

        let reader = Arc::new(FileReader::new(Arc::clone(&fx.queue), 256, 2, fx.dir.path()));
        let (job_tx, job_rx) = stage_channel(4);
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(Arc::clone(&reader).run(job_rx, tx, cancel.clone()));

        for job in [&ok, &empty, &missing] {
            job_tx.send(job.clone()).await.unwrap();
        }
        drop(job_tx);
        worker.await.unwrap();

        let chunks = drain(&mut rx).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data.as_ref(), b"fine");

        let status = |job: &FileJob| fx.queue.get(&job.path, &job.hash).unwrap().unwrap();
        assert!(status(&ok).finished && status(&ok).success);
        assert!(status(&empty).finished && status(&empty).success);
        assert!(status(&missing).finished && !status(&missing).success);
    }
}
