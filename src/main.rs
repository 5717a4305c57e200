//! owsync command line.
//!
//! - `owsync send`       - run the sender daemon (and the watcher if configured)
//! - `owsync receive`    - run the receiver daemon
//! - `owsync queue-file` - queue one file for sending
//! - `owsync queue-dir`  - queue every file under a directory
//! - `owsync watch`      - queue files as they appear in a directory
//! - `owsync status`     - list transfer records

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use owsync::config::Config;
use owsync::queue::{self, Spool, TransferQueue};
use owsync::streaming::pipeline;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// One-way file synchronization over UDP with forward error correction.
#[derive(Parser)]
#[command(name = "owsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "OWSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Also append logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send queued files to the receiver until interrupted.
    Send,

    /// Receive files into the output directory until interrupted.
    Receive,

    /// Queue a single file for sending.
    QueueFile {
        file: PathBuf,

        /// Compress with zstd before sending (defaults to `archived_output`)
        #[arg(long)]
        archive: bool,
    },

    /// Queue every file below a directory for sending.
    QueueDir {
        dir: PathBuf,

        /// Compress with zstd before sending (defaults to `archived_output`)
        #[arg(long)]
        archive: bool,
    },

    /// Queue files that appear in a directory once they stop changing.
    Watch {
        /// Directory to watch (defaults to `watch_dir`)
        dir: Option<PathBuf>,
    },

    /// List transfer records as `path started finished success`.
    Status {
        /// Maximum number of records to print
        #[arg(long, default_value_t = 1000)]
        limit: usize,
    },
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Ok(Config::load(path)?),
        None => {
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn run_send(config: Config) -> Result<()> {
    let queue = Arc::new(
        TransferQueue::open(&config.database_dir()).context("Failed to open work queue")?,
    );
    let spool = Spool::open(config.spool_dir()).context("Failed to open submission spool")?;
    let cancel = CancellationToken::new();

    let sender =
        pipeline::spawn_sender(&config, queue, Some(spool.clone()), cancel.clone()).await?;

    #[cfg(feature = "watch")]
    let watcher = config.watch_dir.clone().map(|dir| {
        tokio::spawn(owsync::watch::run(
            dir,
            spool,
            config.archived_output,
            config.timing.watch_tick(),
            config.timing.watch_quiet(),
            cancel.clone(),
        ))
    });
    #[cfg(not(feature = "watch"))]
    if config.watch_dir.is_some() {
        tracing::warn!("watch_dir is set but this build has no watch support");
    }

    shutdown_signal().await;
    info!("Shutting down sender");
    sender.shutdown().await;

    #[cfg(feature = "watch")]
    if let Some(watcher) = watcher {
        watcher.await.context("Watcher task failed")??;
    }
    Ok(())
}

async fn run_receive(config: Config) -> Result<()> {
    let queue = Arc::new(
        TransferQueue::open(&config.database_dir()).context("Failed to open transfer records")?,
    );
    let cancel = CancellationToken::new();
    let receiver = pipeline::spawn_receiver(&config, queue, cancel).await?;
    info!("Receiving on {}", receiver.local_addr());

    shutdown_signal().await;
    info!("Shutting down receiver");
    receiver.shutdown().await;
    Ok(())
}

#[cfg(feature = "watch")]
async fn run_watch(config: Config, dir: Option<PathBuf>) -> Result<()> {
    let dir = dir
        .or_else(|| config.watch_dir.clone())
        .context("No directory given and watch_dir is not configured")?;
    let spool = Spool::open(config.spool_dir()).context("Failed to open submission spool")?;
    let cancel = CancellationToken::new();

    let mut watcher = tokio::spawn(owsync::watch::run(
        dir,
        spool,
        config.archived_output,
        config.timing.watch_tick(),
        config.timing.watch_quiet(),
        cancel.clone(),
    ));
    tokio::select! {
        _ = shutdown_signal() => cancel.cancel(),
        // The watcher only returns early on a startup failure
        res = &mut watcher => return res.context("Watcher task failed")?,
    }
    watcher.await.context("Watcher task failed")?
}

#[cfg(not(feature = "watch"))]
async fn run_watch(_config: Config, _dir: Option<PathBuf>) -> Result<()> {
    anyhow::bail!("this build has no watch support")
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Send => run_send(config).await,
        Commands::Receive => run_receive(config).await,
        Commands::QueueFile { file, archive } => {
            let spool = Spool::open(config.spool_dir())?;
            let queued = queue::submit_file(&spool, &file, archive || config.archived_output)
                .with_context(|| format!("Failed to queue {}", file.display()))?;
            println!("{}", queued.display());
            Ok(())
        }
        Commands::QueueDir { dir, archive } => {
            let spool = Spool::open(config.spool_dir())?;
            let count = queue::submit_tree(&spool, &dir, archive || config.archived_output)
                .with_context(|| format!("Failed to queue {}", dir.display()))?;
            println!("Queued {} files", count);
            Ok(())
        }
        Commands::Watch { dir } => run_watch(config, dir).await,
        Commands::Status { limit } => {
            let db = config.database_dir();
            if !db.is_dir() {
                anyhow::bail!("No transfer records at {}", db.display());
            }
            let queue = TransferQueue::open(&db).context("Failed to open transfer records")?;
            for record in queue.records()?.into_iter().take(limit) {
                println!(
                    "{} {} {} {}",
                    record.path, record.started, record.finished, record.success
                );
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = owsync::logging::init_logging(cli.verbose, cli.log_file.as_deref()) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
