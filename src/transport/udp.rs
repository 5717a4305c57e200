//! Datagram I/O.
//!
//! One encoded share per datagram, best effort in both directions: failed
//! writes are logged and the share is dropped, undecodable datagrams are
//! logged and discarded.

use crate::error::{Result, TransferError};
use crate::streaming::channel::{forward, SharedReceiver};
use crate::streaming::protocol::Chunk;
use crate::transport::sockbuf;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest UDP payload
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Open the outbound socket for `dest`.
pub async fn connect(dest: SocketAddr) -> Result<UdpSocket> {
    let local: SocketAddr = if dest.is_ipv4() {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local)
        .await
        .map_err(|e| TransferError::transport(format!("bind {}", local), e))?;
    socket
        .connect(dest)
        .await
        .map_err(|e| TransferError::transport(format!("connect {}", dest), e))?;
    Ok(socket)
}

/// Bind the listening socket, optionally requesting a receive buffer size.
pub async fn bind(addr: SocketAddr, receive_buffer: Option<usize>) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(addr)
        .await
        .map_err(|e| TransferError::transport(format!("bind {}", addr), e))?;

    if let Some(size) = receive_buffer {
        match sockbuf::set_receive_buffer_size(&socket, size) {
            Ok(()) => debug!(
                "Receive buffer requested {} bytes, got {:?}",
                size,
                sockbuf::receive_buffer_size(&socket).ok()
            ),
            Err(e) => warn!("Could not set receive buffer to {} bytes: {}", size, e),
        }
    }
    Ok(socket)
}

/// Sender worker: writes each rate-limited share as one datagram.
pub async fn run_sender(
    socket: Arc<UdpSocket>,
    input: SharedReceiver<Chunk>,
    cancel: CancellationToken,
) {
    while let Some(share) = input.recv(&cancel).await {
        let datagram = share.encode();
        let sent = tokio::select! {
            _ = cancel.cancelled() => return,
            sent = socket.send(&datagram) => sent,
        };
        if let Err(e) = sent {
            warn!(
                path = %share.path,
                hash = %share.hash_hex(),
                offset = share.data_offset,
                share = share.share_index,
                "Error sending share ({} bytes): {}",
                datagram.len(),
                e
            );
        }
    }
}

/// Receiver worker: decodes datagrams into shares.
///
/// Read errors on the live socket are logged and the read is retried.
pub async fn run_receiver(
    socket: Arc<UdpSocket>,
    output: mpsc::Sender<Chunk>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            received = socket.recv_from(&mut buf) => received,
        };
        let (len, peer) = match received {
            Ok(received) => received,
            Err(e) => {
                warn!("Error reading from socket: {}", e);
                continue;
            }
        };

        match Chunk::decode(Bytes::copy_from_slice(&buf[..len])) {
            Ok(share) => {
                if !forward(&output, share, &cancel).await {
                    return;
                }
            }
            Err(e) => warn!(peer = %peer, "Dropping datagram of {} bytes: {}", len, e),
        }
    }
}

/// Log where the receiver listens and what buffer it got.
pub fn log_listening(socket: &UdpSocket) {
    match (socket.local_addr(), sockbuf::receive_buffer_size(socket)) {
        (Ok(addr), Ok(size)) => info!("Listening on {} (receive buffer {} bytes)", addr, size),
        (Ok(addr), Err(_)) => info!("Listening on {}", addr),
        (Err(e), _) => warn!("Listening on unknown address: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::channel::stage_channel;
    use crate::streaming::protocol::HASH_SIZE;
    use std::time::Duration;

    fn share(index: u32) -> Chunk {
        Chunk {
            path: "/net/file".to_string(),
            hash: [5; HASH_SIZE],
            data_offset: 0,
            data_padding: 0,
            share_index: index,
            data: Bytes::from(vec![index as u8; 100]),
        }
    }

    #[tokio::test]
    async fn test_shares_cross_loopback() {
        let receiver = Arc::new(bind("127.0.0.1:0".parse().unwrap(), None).await.unwrap());
        let dest = receiver.local_addr().unwrap();
        let sender = Arc::new(connect(dest).await.unwrap());
        let cancel = CancellationToken::new();

        let (out_tx, mut out_rx) = mpsc::channel(16);
        let recv_task = tokio::spawn(run_receiver(Arc::clone(&receiver), out_tx, cancel.clone()));

        let (in_tx, in_rx) = stage_channel(16);
        let send_task = tokio::spawn(run_sender(sender, in_rx, cancel.clone()));
        for i in 0..3 {
            in_tx.send(share(i)).await.unwrap();
        }

        let mut got = Vec::new();
        for _ in 0..3 {
            let share = tokio::time::timeout(Duration::from_secs(5), out_rx.recv())
                .await
                .unwrap()
                .unwrap();
            got.push(share.share_index);
        }
        got.sort();
        assert_eq!(got, vec![0, 1, 2]);

        cancel.cancel();
        recv_task.await.unwrap();
        send_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_garbage_datagram_is_skipped() {
        let receiver = Arc::new(bind("127.0.0.1:0".parse().unwrap(), None).await.unwrap());
        let dest = receiver.local_addr().unwrap();
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let cancel = CancellationToken::new();

        let (out_tx, mut out_rx) = mpsc::channel(4);
        let task = tokio::spawn(run_receiver(receiver, out_tx, cancel.clone()));

        raw.send_to(&[0xFF; 7], dest).await.unwrap();
        raw.send_to(&share(4).encode(), dest).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.share_index, 4);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_transport_error() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let err = bind(taken.local_addr().unwrap(), None).await.unwrap_err();
        assert!(matches!(err, TransferError::Transport { .. }));
    }
}
