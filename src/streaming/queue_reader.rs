//! Queue reader: feeds claimed files into the sender pipeline.

use crate::error::Result;
use crate::queue::{Spool, TransferQueue, TransferRecord};
use crate::streaming::channel::{forward, FileJob};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Most records claimed per poll
pub const CLAIM_BATCH: usize = 100;

/// Ingest the spool and claim up to `limit` pending records.
pub fn claim(queue: &TransferQueue, spool: Option<&Spool>, limit: usize) -> Result<Vec<TransferRecord>> {
    if let Some(spool) = spool {
        let ingested = queue.ingest(spool)?;
        if ingested > 0 {
            debug!("Ingested {} spooled submissions", ingested);
        }
    }

    let mut claimed = Vec::new();
    while claimed.len() < limit {
        match queue.next_pending()? {
            Some(record) => claimed.push(record),
            None => break,
        }
    }
    Ok(claimed)
}

/// Poll the queue every `poll` and forward claimed files.
pub async fn run(
    queue: Arc<TransferQueue>,
    spool: Option<Spool>,
    poll: Duration,
    output: mpsc::Sender<FileJob>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let queue = Arc::clone(&queue);
        let spool = spool.clone();
        let claimed = tokio::task::spawn_blocking(move || claim(&queue, spool.as_ref(), CLAIM_BATCH)).await;
        let records = match claimed {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => {
                error!("Failed to read work queue: {}", e);
                continue;
            }
            Err(e) => {
                error!("Work queue task failed: {}", e);
                continue;
            }
        };

        for record in records {
            debug!(path = %record.path, hash = %hex::encode(record.hash), "Claimed file");
            let job = FileJob {
                path: record.path,
                hash: record.hash,
                archived: record.archived,
            };
            if !forward(&output, job, &cancel).await {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_claim_respects_limit() {
        let dir = TempDir::new().unwrap();
        let queue = TransferQueue::open(&dir.path().join("db")).unwrap();
        for i in 0..5u8 {
            queue
                .enqueue(TransferRecord::pending(format!("/f{}", i), [i; 32], false))
                .unwrap();
        }
        assert_eq!(claim(&queue, None, 3).unwrap().len(), 3);
        assert_eq!(claim(&queue, None, 3).unwrap().len(), 2);
        assert!(claim(&queue, None, 3).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spooled_file_reaches_pipeline() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(TransferQueue::open(&dir.path().join("db")).unwrap());
        let spool = Spool::open(dir.path().join("spool")).unwrap();
        spool.submit("/data/x", &[3; 32], true).unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(run(
            Arc::clone(&queue),
            Some(spool),
            Duration::from_millis(10),
            tx,
            cancel.clone(),
        ));

        let job = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            job,
            FileJob {
                path: "/data/x".to_string(),
                hash: [3; 32],
                archived: true
            }
        );
        assert!(queue.get("/data/x", &[3; 32]).unwrap().unwrap().started);

        cancel.cancel();
        reader.await.unwrap();
    }
}
