//! Chunk wire format.
//!
//! Every UDP datagram carries exactly one encoded `Chunk`. There is no
//! framing, handshake or acknowledgement: a datagram either decodes into a
//! complete chunk or it is dropped.
//!
//! Wire format (all integers big-endian):
//!
//! ```text
//! path_len:u32 | path | hash:[u8; 32] | data_offset:i64 | data_padding:u32
//!              | share_index:u32 | data_len:u32 | data
//! ```

use crate::error::{Result, TransferError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the whole-file content digest
pub const HASH_SIZE: usize = 32;

/// Whole-file content digest carried by every chunk
pub type ContentHash = [u8; HASH_SIZE];

/// Bytes taken by every field except the path and data bodies
pub const FIXED_OVERHEAD: usize = 4 + HASH_SIZE + 8 + 4 + 4 + 4;

// =============================================================================
// Chunk
// =============================================================================

/// One unit of the transfer.
///
/// On the sender this starts life as a raw slice of the file (share index 0,
/// no padding) and is then split by the FEC encoder into `total` shares that
/// share every field except `share_index` and `data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Source path of the file, used verbatim as the destination key
    pub path: String,

    /// Digest of the whole file
    pub hash: ContentHash,

    /// Byte offset of this chunk's decoded data in the original file
    pub data_offset: i64,

    /// Zero bytes appended before splitting into shards
    pub data_padding: u32,

    /// Which erasure share this is
    pub share_index: u32,

    /// Payload (raw file bytes or one shard)
    pub data: Bytes,
}

impl Chunk {
    /// Exact encoded size of this chunk.
    pub fn encoded_len(&self) -> usize {
        overhead(&self.path) + self.data.len()
    }

    pub fn encode(&self) -> Bytes {
        let path_bytes = self.path.as_bytes();
        let mut buf = BytesMut::with_capacity(self.encoded_len());

        buf.put_u32(path_bytes.len() as u32);
        buf.put_slice(path_bytes);
        buf.put_slice(&self.hash);
        buf.put_i64(self.data_offset);
        buf.put_u32(self.data_padding);
        buf.put_u32(self.share_index);
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);

        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 4 {
            return Err(malformed("path length truncated"));
        }
        let path_len = payload.get_u32() as usize;
        if payload.remaining() < path_len {
            return Err(TransferError::MalformedChunk(format!(
                "path length {} exceeds remaining {} bytes",
                path_len,
                payload.remaining()
            )));
        }
        let path = String::from_utf8(payload.copy_to_bytes(path_len).to_vec())
            .map_err(|_| malformed("invalid UTF-8 in path"))?;

        if payload.remaining() < FIXED_OVERHEAD - 4 {
            return Err(malformed("fixed fields truncated"));
        }
        let mut hash = [0u8; HASH_SIZE];
        payload.copy_to_slice(&mut hash);
        let data_offset = payload.get_i64();
        let data_padding = payload.get_u32();
        let share_index = payload.get_u32();

        let data_len = payload.get_u32() as usize;
        if payload.remaining() < data_len {
            return Err(TransferError::MalformedChunk(format!(
                "data length {} exceeds remaining {} bytes",
                data_len,
                payload.remaining()
            )));
        }
        let data = payload.copy_to_bytes(data_len);

        if payload.has_remaining() {
            return Err(TransferError::MalformedChunk(format!(
                "{} trailing bytes after data",
                payload.remaining()
            )));
        }

        Ok(Self {
            path,
            hash,
            data_offset,
            data_padding,
            share_index,
            data,
        })
    }

    /// A copy of this chunk's addressing fields carrying a different payload.
    pub fn with_share(&self, share_index: u32, data_padding: u32, data: Bytes) -> Self {
        Self {
            path: self.path.clone(),
            hash: self.hash,
            data_offset: self.data_offset,
            data_padding,
            share_index,
            data,
        }
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

/// Protocol overhead of a chunk for `path`.
///
/// Equal to the encoded length of a chunk with an empty payload; upstream
/// stages subtract it from the datagram size to size each shard.
pub fn overhead(path: &str) -> usize {
    FIXED_OVERHEAD + path.len()
}

fn malformed(msg: &str) -> TransferError {
    TransferError::MalformedChunk(msg.to_string())
}

// =============================================================================
// Tests
// =============================================================================
