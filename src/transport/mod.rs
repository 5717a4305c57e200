//! UDP transport: datagram I/O and receive-buffer telemetry.

pub mod sockbuf;
pub mod udp;

pub use udp::{bind, connect, MAX_DATAGRAM_SIZE};
