//! The transfer pipeline.
//!
//! # Architecture
//!
//! ```text
//! Sender:
//! +-------------+   +-------------+   +------------+   +---------+   +--------+
//! | QueueReader |-->| FileReader  |-->| FecEncoder |-->| Limiter |-->| UDP tx |
//! +-------------+   +-------------+   +------------+   +---------+   +--------+
//!
//! Receiver:
//! +--------+   +----------------+   +------------+   +------------+   +------------+
//! | UDP rx |-->| ShareAssembler |-->| FecDecoder |-->| FileWriter |-->| FileCloser |
//! +--------+   +----------------+   +------------+   +------------+   +------------+
//! ```
//!
//! Every box is a pool of workers sharing one bounded input channel. The
//! assembler and the writer each also run a sweep task that evicts idle
//! cache entries; the writer's sweep is the only end-of-file signal.
//!
//! There is no return channel: loss is absorbed by the `total - required`
//! parity shares of each chunk and otherwise surfaces as a failed hash
//! check at the closer.

pub mod assembler;
pub mod channel;
pub mod closer;
pub mod fec;
pub mod file_reader;
pub mod limiter;
pub mod pipeline;
pub mod protocol;
pub mod queue_reader;
pub mod writer;

pub use assembler::ShareAssembler;
pub use channel::{FileJob, FinishedFile, ShareBatch, SharedReceiver};
pub use closer::FileCloser;
pub use fec::{FecDecoder, FecEncoder};
pub use file_reader::FileReader;
pub use limiter::TokenBucket;
pub use pipeline::{spawn_receive_stages, spawn_receiver, spawn_sender, PipelineHandle, ReceiverHandle};
pub use protocol::{overhead, Chunk, ContentHash};
pub use writer::FileWriter;
