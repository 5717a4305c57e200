//! owsync - one-way file synchronization over UDP.
//!
//! Files queued on the sending side are cut into chunks, erasure coded into
//! `total` shares of which any `required` rebuild the chunk, and sent as
//! rate-limited datagrams. The receiver reassembles shares, writes chunks
//! into temp files, and moves each file into place once it has gone quiet
//! and its hash checks out. Nothing ever flows back to the sender.

pub mod cache;
pub mod config;
pub mod error;
pub mod hash;
pub mod logging;
pub mod queue;
pub mod streaming;
pub mod transport;
#[cfg(feature = "watch")]
pub mod watch;

pub use config::Config;
pub use error::{Result, TransferError};
