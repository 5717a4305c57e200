//! Forward error correction stages.
//!
//! The encoder pads a raw chunk to a multiple of `required`, splits it into
//! `required` data shards and adds `total - required` Reed-Solomon parity
//! shards. The decoder rebuilds the data shards from any `required` of them
//! and strips the padding again.

use crate::error::{Result, TransferError};
use crate::streaming::channel::{forward, ShareBatch, SharedReceiver};
use crate::streaming::protocol::Chunk;
use bytes::{Bytes, BytesMut};
use reed_solomon_erasure::galois_8::ReedSolomon;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Upper bound on `total` for a GF(2^8) code
pub const MAX_TOTAL_SHARES: usize = 256;

/// Check a `(required, total)` pair and build the parity codec for it.
///
/// With `total == required` there is no parity and no codec.
fn build_codec(required: usize, total: usize) -> Result<Option<ReedSolomon>> {
    if required < 1 || total < required || total > MAX_TOTAL_SHARES {
        return Err(TransferError::InvalidFecParameters { required, total });
    }
    if total == required {
        return Ok(None);
    }
    ReedSolomon::new(required, total - required)
        .map(Some)
        .map_err(|_| TransferError::InvalidFecParameters { required, total })
}

// =============================================================================
// Encoder
// =============================================================================

pub struct FecEncoder {
    required: usize,
    total: usize,
    codec: Option<ReedSolomon>,
}

impl FecEncoder {
    pub fn new(required: usize, total: usize) -> Result<Self> {
        let codec = build_codec(required, total)?;
        Ok(Self {
            required,
            total,
            codec,
        })
    }

    /// Padding needed to make `len` a multiple of `required`.
    pub fn padding_for(&self, len: usize) -> usize {
        (self.required - len % self.required) % self.required
    }

    /// A codec that rejects a correctly laid out shard set disagrees with
    /// the configured `(required, total)`.
    fn parity_error(&self, e: reed_solomon_erasure::Error) -> TransferError {
        error!(
            required = self.required,
            total = self.total,
            "Parity computation failed: {:?}",
            e
        );
        TransferError::InvalidFecParameters {
            required: self.required,
            total: self.total,
        }
    }

    /// Split one raw chunk into `total` shares.
    pub fn encode(&self, chunk: &Chunk) -> Result<Vec<Chunk>> {
        if chunk.data.is_empty() {
            return Err(TransferError::MalformedChunk(
                "cannot split an empty payload".to_string(),
            ));
        }

        let padding = self.padding_for(chunk.data.len());
        let shard_len = (chunk.data.len() + padding) / self.required;

        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.total);
        for i in 0..self.required {
            let start = (i * shard_len).min(chunk.data.len());
            let end = ((i + 1) * shard_len).min(chunk.data.len());
            let mut shard = chunk.data[start..end].to_vec();
            shard.resize(shard_len, 0);
            shards.push(shard);
        }
        shards.resize(self.total, vec![0u8; shard_len]);

        if let Some(codec) = &self.codec {
            codec
                .encode(&mut shards)
                .map_err(|e| self.parity_error(e))?;
        }

        Ok(shards
            .into_iter()
            .enumerate()
            .map(|(i, shard)| chunk.with_share(i as u32, padding as u32, Bytes::from(shard)))
            .collect())
    }

    /// Encoder worker: raw chunks in, shares out.
    pub async fn run(
        self: Arc<Self>,
        input: SharedReceiver<Chunk>,
        output: mpsc::Sender<Chunk>,
        cancel: CancellationToken,
    ) {
        while let Some(chunk) = input.recv(&cancel).await {
            let shares = match self.encode(&chunk) {
                Ok(shares) => shares,
                Err(e) => {
                    error!(
                        path = %chunk.path,
                        hash = %chunk.hash_hex(),
                        offset = chunk.data_offset,
                        "Error FEC encoding chunk: {}",
                        e
                    );
                    continue;
                }
            };
            for share in shares {
                if !forward(&output, share, &cancel).await {
                    return;
                }
            }
        }
    }
}

// =============================================================================
// Decoder
// =============================================================================

pub struct FecDecoder {
    required: usize,
    total: usize,
    codec: Option<ReedSolomon>,
}

impl FecDecoder {
    pub fn new(required: usize, total: usize) -> Result<Self> {
        let codec = build_codec(required, total)?;
        Ok(Self {
            required,
            total,
            codec,
        })
    }

    /// Rebuild the original chunk from a batch of shares of one group.
    ///
    /// Shares are placed by `share_index`; missing slots are recovered from
    /// parity. Fails without producing data when fewer than `required`
    /// distinct, consistent shares are present.
    pub fn decode(&self, shares: &[Chunk]) -> Result<Chunk> {
        let first = shares
            .first()
            .ok_or_else(|| TransferError::ReconstructionFailure("empty batch".to_string()))?;
        let shard_len = first.data.len();
        if shard_len == 0 {
            return Err(TransferError::ReconstructionFailure(
                "empty shard".to_string(),
            ));
        }
        let padding = first.data_padding as usize;
        if padding >= self.required {
            return Err(TransferError::ReconstructionFailure(format!(
                "padding {} not below required {}",
                padding, self.required
            )));
        }

        let mut slots: Vec<Option<Vec<u8>>> = vec![None; self.total];
        for share in shares {
            let idx = share.share_index as usize;
            if idx >= self.total {
                return Err(TransferError::ReconstructionFailure(format!(
                    "share index {} out of range for {} shares",
                    idx, self.total
                )));
            }
            if share.data.len() != shard_len
                || share.data_padding != first.data_padding
                || share.data_offset != first.data_offset
                || share.hash != first.hash
                || share.path != first.path
            {
                return Err(TransferError::ReconstructionFailure(format!(
                    "share {} does not belong to the batch",
                    idx
                )));
            }
            slots[idx] = Some(share.data.to_vec());
        }

        let present = slots.iter().filter(|s| s.is_some()).count();
        if present < self.required {
            return Err(TransferError::ReconstructionFailure(format!(
                "{} distinct shares present, {} required",
                present, self.required
            )));
        }

        if let Some(codec) = &self.codec {
            codec
                .reconstruct_data(&mut slots)
                .map_err(|e| TransferError::ReconstructionFailure(format!("{:?}", e)))?;
        }

        let mut data = BytesMut::with_capacity(shard_len * self.required);
        for slot in &slots[..self.required] {
            let shard = slot.as_ref().ok_or_else(|| {
                TransferError::ReconstructionFailure("data shard missing after recovery".into())
            })?;
            data.extend_from_slice(shard);
        }
        data.truncate(data.len() - padding);

        Ok(Chunk {
            path: first.path.clone(),
            hash: first.hash,
            data_offset: first.data_offset,
            data_padding: 0,
            share_index: 0,
            data: data.freeze(),
        })
    }

    /// Decoder worker: share batches in, reconstructed chunks out.
    pub async fn run(
        self: Arc<Self>,
        input: SharedReceiver<ShareBatch>,
        output: mpsc::Sender<Chunk>,
        cancel: CancellationToken,
    ) {
        while let Some(batch) = input.recv(&cancel).await {
            match self.decode(&batch) {
                Ok(chunk) => {
                    debug!(
                        path = %chunk.path,
                        offset = chunk.data_offset,
                        len = chunk.data.len(),
                        "Reconstructed chunk"
                    );
                    if !forward(&output, chunk, &cancel).await {
                        return;
                    }
                }
                Err(e) => {
                    let (path, hash) = batch
                        .first()
                        .map(|c| (c.path.clone(), c.hash_hex()))
                        .unwrap_or_default();
                    error!(path = %path, hash = %hash, "Error FEC decoding shares: {}", e);
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
