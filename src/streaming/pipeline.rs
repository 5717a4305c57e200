//! Pipeline orchestration.
//!
//! Wires the stages of each end together with bounded channels and spawns
//! a worker pool per stage. Everything stops on the shared cancellation
//! token; the returned handle joins the tasks afterwards.

use crate::config::Config;
use crate::queue::{Spool, TransferQueue};
use crate::streaming::assembler::ShareAssembler;
use crate::streaming::channel::{
    stage_channel, SharedReceiver, BATCH_CHANNEL_SIZE, CHUNK_CHANNEL_SIZE, DECODED_CHANNEL_SIZE,
    FINISHED_CHANNEL_SIZE, LIMITED_CHANNEL_SIZE, QUEUE_CHANNEL_SIZE, RECEIVED_CHANNEL_SIZE,
    SHARE_CHANNEL_SIZE,
};
use crate::streaming::closer::FileCloser;
use crate::streaming::fec::{FecDecoder, FecEncoder};
use crate::streaming::file_reader::FileReader;
use crate::streaming::limiter::{self, TokenBucket};
use crate::streaming::protocol::Chunk;
use crate::streaming::queue_reader;
use crate::streaming::writer::FileWriter;
use crate::transport::{sockbuf, udp};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Running tasks of one pipeline.
pub struct PipelineHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            tasks: Vec::new(),
        }
    }

    fn spawn<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(task));
    }

    fn extend(&mut self, other: PipelineHandle) {
        self.tasks.extend(other.tasks);
    }

    /// Wait for every task; returns once the token is cancelled and all
    /// workers have wound down.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Pipeline task failed: {}", e);
            }
        }
    }

    /// Cancel and join.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.join().await;
    }
}

// =============================================================================
// Sender
// =============================================================================

/// Start the sender: queue -> reader -> encoder -> limiter -> UDP.
pub async fn spawn_sender(
    config: &Config,
    queue: Arc<TransferQueue>,
    spool: Option<Spool>,
    cancel: CancellationToken,
) -> Result<PipelineHandle> {
    let workers = config.worker_count();
    let encoder = Arc::new(
        FecEncoder::new(config.chunk_fec_required, config.chunk_fec_total)
            .context("Failed to create FEC encoder")?,
    );

    let archive_dir = config.queue_dir.join("archives");
    std::fs::create_dir_all(&archive_dir)
        .with_context(|| format!("Failed to create {}", archive_dir.display()))?;

    let dest = config.receiver_addr()?;
    let socket = Arc::new(
        udp::connect(dest)
            .await
            .with_context(|| format!("Failed to open socket to {}", dest))?,
    );

    let reader = Arc::new(FileReader::new(
        Arc::clone(&queue),
        config.chunk_size,
        config.chunk_fec_required,
        archive_dir,
    ));
    // Burst of one datagram keeps the output smooth
    let bucket = Arc::new(TokenBucket::new(
        config.bandwidth_limit,
        config.chunk_size as u64,
    ));

    let (job_tx, job_rx) = stage_channel(QUEUE_CHANNEL_SIZE);
    let (chunk_tx, chunk_rx) = stage_channel(CHUNK_CHANNEL_SIZE);
    let (share_tx, share_rx) = stage_channel(SHARE_CHANNEL_SIZE);
    let (limited_tx, limited_rx) = stage_channel(LIMITED_CHANNEL_SIZE);

    let mut handle = PipelineHandle::new(cancel.clone());
    handle.spawn(queue_reader::run(
        queue,
        spool,
        config.timing.queue_poll(),
        job_tx,
        cancel.clone(),
    ));
    for _ in 0..workers {
        handle.spawn(Arc::clone(&reader).run(job_rx.clone(), chunk_tx.clone(), cancel.clone()));
        handle.spawn(Arc::clone(&encoder).run(
            chunk_rx.clone(),
            share_tx.clone(),
            cancel.clone(),
        ));
        handle.spawn(limiter::run(
            Arc::clone(&bucket),
            share_rx.clone(),
            limited_tx.clone(),
            cancel.clone(),
        ));
        handle.spawn(udp::run_sender(
            Arc::clone(&socket),
            limited_rx.clone(),
            cancel.clone(),
        ));
    }

    info!(
        dest = %dest,
        workers,
        required = config.chunk_fec_required,
        total = config.chunk_fec_total,
        "Sender started"
    );
    Ok(handle)
}

// =============================================================================
// Receiver
// =============================================================================

/// A running receiver and the address it listens on.
pub struct ReceiverHandle {
    local_addr: SocketAddr,
    pipeline: PipelineHandle,
}

impl ReceiverHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn join(self) {
        self.pipeline.join().await;
    }

    pub async fn shutdown(self) {
        self.pipeline.shutdown().await;
    }
}

/// Start the receiver: UDP -> assembler -> decoder -> writer -> closer.
pub async fn spawn_receiver(
    config: &Config,
    queue: Arc<TransferQueue>,
    cancel: CancellationToken,
) -> Result<ReceiverHandle> {
    let addr = config.receiver_addr()?;
    let socket = Arc::new(
        udp::bind(addr, config.receive_buffer_size)
            .await
            .with_context(|| format!("Failed to listen on {}", addr))?,
    );
    let local_addr = socket.local_addr().context("Failed to read bound address")?;
    udp::log_listening(&socket);

    let (share_tx, share_rx) = stage_channel(RECEIVED_CHANNEL_SIZE);
    let mut pipeline = PipelineHandle::new(cancel.clone());
    pipeline.extend(spawn_receive_stages(config, queue, share_rx, cancel.clone())?);

    for _ in 0..config.worker_count() {
        pipeline.spawn(udp::run_receiver(
            Arc::clone(&socket),
            share_tx.clone(),
            cancel.clone(),
        ));
    }
    pipeline.spawn(sockbuf::run_monitor(
        socket,
        config.timing.buffer_monitor(),
        cancel,
    ));

    Ok(ReceiverHandle {
        local_addr,
        pipeline,
    })
}

/// Start everything downstream of the socket, fed from `shares`.
pub fn spawn_receive_stages(
    config: &Config,
    queue: Arc<TransferQueue>,
    shares: SharedReceiver<Chunk>,
    cancel: CancellationToken,
) -> Result<PipelineHandle> {
    let workers = config.worker_count();
    let temp_dir = config.temp_dir();
    std::fs::create_dir_all(&temp_dir)
        .with_context(|| format!("Failed to create temp dir {}", temp_dir.display()))?;
    std::fs::create_dir_all(&config.out_dir)
        .with_context(|| format!("Failed to create output dir {}", config.out_dir.display()))?;

    let decoder = Arc::new(
        FecDecoder::new(config.chunk_fec_required, config.chunk_fec_total)
            .context("Failed to create FEC decoder")?,
    );
    let assembler = Arc::new(ShareAssembler::new(
        config.chunk_fec_required,
        config.chunk_fec_total,
    ));
    let closer = Arc::new(FileCloser::new(config.out_dir.clone(), queue));
    let writer = Arc::new(
        FileWriter::new(temp_dir, config.archived_output).with_closer(Arc::clone(&closer)),
    );

    let (batch_tx, batch_rx) = stage_channel(BATCH_CHANNEL_SIZE);
    let (decoded_tx, decoded_rx) = stage_channel(DECODED_CHANNEL_SIZE);
    let (finished_tx, finished_rx) = stage_channel(FINISHED_CHANNEL_SIZE);

    let mut handle = PipelineHandle::new(cancel.clone());
    for _ in 0..workers {
        handle.spawn(Arc::clone(&assembler).run(shares.clone(), batch_tx.clone(), cancel.clone()));
        handle.spawn(Arc::clone(&decoder).run(
            batch_rx.clone(),
            decoded_tx.clone(),
            cancel.clone(),
        ));
        handle.spawn(Arc::clone(&writer).run(decoded_rx.clone(), cancel.clone()));
        handle.spawn(Arc::clone(&closer).run(finished_rx.clone(), cancel.clone()));
    }
    handle.spawn(Arc::clone(&assembler).run_sweeper(
        config.timing.share_sweep_interval(),
        config.timing.share_quiet(),
        cancel.clone(),
    ));
    handle.spawn(writer.run_sweeper(
        config.timing.file_sweep_interval(),
        config.timing.file_quiet(),
        finished_tx,
        cancel,
    ));

    info!(
        out_dir = %config.out_dir.display(),
        workers,
        "Receiver stages started"
    );
    Ok(handle)
}
