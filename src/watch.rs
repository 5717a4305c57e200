//! Directory watcher.
//!
//! Files that are still being written must not be queued, since their hash
//! would not match what finally lands. Every create/modify event restarts a
//! per-path quiet timer; a path is submitted only after it has been silent
//! for the whole quiet period.

use crate::queue::{self, Spool};
use anyhow::{Context, Result};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-path quiet timers.
#[derive(Debug)]
pub struct Debouncer {
    quiet: Duration,
    last_seen: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            last_seen: HashMap::new(),
        }
    }

    pub fn touch(&mut self, path: PathBuf, now: Instant) {
        self.last_seen.insert(path, now);
    }

    /// Remove and return every path quiet since at least `quiet` before `now`.
    pub fn take_quiet(&mut self, now: Instant) -> Vec<PathBuf> {
        let quiet = self.quiet;
        let mut ready = Vec::new();
        self.last_seen.retain(|path, seen| {
            if now.saturating_duration_since(*seen) >= quiet {
                ready.push(path.clone());
                false
            } else {
                true
            }
        });
        ready.sort();
        ready
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

/// Watch `dir` and submit quiet files to `spool` until cancelled.
pub async fn run(
    dir: PathBuf,
    spool: Spool,
    archived: bool,
    tick: Duration,
    quiet: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = event_tx.send(res);
    })
    .context("Failed to create file watcher")?;
    watcher
        .watch(&dir, RecursiveMode::Recursive)
        .with_context(|| format!("Failed to watch {}", dir.display()))?;
    info!("Watching {}", dir.display());

    let mut debouncer = Debouncer::new(quiet);
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            event = event_rx.recv() => match event {
                Some(Ok(event)) => {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        for path in event.paths {
                            debouncer.touch(path, Instant::now());
                        }
                    }
                }
                Some(Err(e)) => warn!("Watch error: {}", e),
                None => return Ok(()),
            },
            _ = ticker.tick() => {
                for path in debouncer.take_quiet(Instant::now()) {
                    submit_quiet(&spool, &path, archived).await;
                }
            }
        }
    }
}

async fn submit_quiet(spool: &Spool, path: &Path, archived: bool) {
    if !path.is_file() {
        debug!(path = %path.display(), "Skipping non-file watch event");
        return;
    }
    let spool = spool.clone();
    let owned = path.to_path_buf();
    match tokio::task::spawn_blocking(move || queue::submit_file(&spool, &owned, archived)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(path = %path.display(), "Failed to queue watched file: {}", e),
        Err(e) => warn!(path = %path.display(), "Failed to queue watched file: {}", e),
    }
}
