//! Bandwidth limiter.
//!
//! A byte-denominated token bucket shared by every limiter worker. Shares
//! leave the limiter only once the bucket can pay for their payload, which
//! caps the sustained emission rate of the whole sender.

use crate::streaming::channel::{forward, SharedReceiver};
use crate::streaming::protocol::Chunk;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Token bucket rate limiter measured in bytes.
///
/// The bucket starts full. A request larger than the capacity is admitted
/// once the bucket is full and leaves it in debt, so oversized shares still
/// flow at the configured average rate.
pub struct TokenBucket {
    /// Sustained refill rate in bytes per second
    rate: f64,

    /// Maximum tokens (burst size in bytes)
    capacity: f64,

    state: Mutex<BucketState>,
}

struct BucketState {
    /// Current token count; negative while paying off an oversized request
    tokens: f64,

    /// Last refill time
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(bytes_per_sec: u64, burst: u64) -> Self {
        let capacity = burst.max(1) as f64;
        Self {
            rate: bytes_per_sec.max(1) as f64,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_refill = now;
    }

    /// Take `bytes` tokens if available, otherwise report how long to wait.
    pub fn try_acquire(&self, bytes: usize) -> Result<(), Duration> {
        let mut state = self.state.lock();
        self.refill(&mut state);

        let needed = (bytes as f64).min(self.capacity);
        if state.tokens >= needed {
            state.tokens -= bytes as f64;
            return Ok(());
        }
        Err(Duration::from_secs_f64((needed - state.tokens) / self.rate))
    }

    /// Wait until `bytes` tokens are taken. Returns `false` if cancelled
    /// first, in which case nothing is consumed.
    pub async fn admit(&self, bytes: usize, cancel: &CancellationToken) -> bool {
        loop {
            let wait = match self.try_acquire(bytes) {
                Ok(()) => return true,
                Err(wait) => wait,
            };
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    #[cfg(test)]
    fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }
}

/// Limiter worker: shares in, paid-for shares out.
pub async fn run(
    bucket: Arc<TokenBucket>,
    input: SharedReceiver<Chunk>,
    output: mpsc::Sender<Chunk>,
    cancel: CancellationToken,
) {
    while let Some(share) = input.recv(&cancel).await {
        if !bucket.admit(share.data.len(), &cancel).await {
            return;
        }
        if !forward(&output, share, &cancel).await {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::channel::stage_channel;
    use crate::streaming::protocol::HASH_SIZE;
    use bytes::Bytes;

    #[test]
    fn test_burst_then_wait() {
        let bucket = TokenBucket::new(1000, 500);
        assert!(bucket.try_acquire(300).is_ok());
        assert!(bucket.try_acquire(200).is_ok());

        let wait = bucket.try_acquire(100).unwrap_err();
        assert!(wait > Duration::from_millis(50) && wait <= Duration::from_millis(100));
    }

    #[test]
    fn test_oversized_request_goes_into_debt() {
        let bucket = TokenBucket::new(1000, 100);
        assert!(bucket.try_acquire(400).is_ok());
        assert!(bucket.available() < -250.0);
        assert!(bucket.try_acquire(1).is_err());
    }

    #[tokio::test]
    async fn test_admit_cancelled_while_waiting() {
        let bucket = TokenBucket::new(1, 10);
        let cancel = CancellationToken::new();
        assert!(bucket.admit(10, &cancel).await);

        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move { bucket.admit(10, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_worker_holds_configured_rate() {
        const SHARE: usize = 8000;
        const COUNT: usize = 20;
        const RATE: u64 = 160_000;

        let bucket = Arc::new(TokenBucket::new(RATE, SHARE as u64));
        let (in_tx, in_rx) = stage_channel(COUNT);
        let (out_tx, mut out_rx) = mpsc::channel(COUNT);
        let cancel = CancellationToken::new();

        for i in 0..COUNT {
            in_tx
                .send(Chunk {
                    path: "/rate".to_string(),
                    hash: [0; HASH_SIZE],
                    data_offset: 0,
                    data_padding: 0,
                    share_index: i as u32,
                    data: Bytes::from(vec![0u8; SHARE]),
                })
                .await
                .unwrap();
        }

        let start = Instant::now();
        let workers: Vec<_> = (0..4)
            .map(|_| {
                tokio::spawn(run(
                    Arc::clone(&bucket),
                    in_rx.clone(),
                    out_tx.clone(),
                    cancel.clone(),
                ))
            })
            .collect();
        for _ in 0..COUNT {
            out_rx.recv().await.unwrap();
        }
        let elapsed = start.elapsed().as_secs_f64();

        // First share rides the initial burst
        let expected = ((COUNT - 1) * SHARE) as f64 / RATE as f64;
        assert!(
            elapsed > expected * 0.8 && elapsed < expected * 1.2,
            "took {:.3}s, expected ~{:.3}s",
            elapsed,
            expected
        );

        cancel.cancel();
        for w in workers {
            w.await.unwrap();
        }
    }
}
