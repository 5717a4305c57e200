//! Configuration file.
//!
//! One TOML file serves both ends of the link; every field has a default so
//! a config only needs to name what differs.
//!
//! ```toml
//! receiver_ip = "10.0.0.2"
//! receiver_port = 5000
//! bandwidth_limit = 1048576
//! chunk_size = 8192
//! chunk_fec_required = 5
//! chunk_fec_total = 10
//! out_dir = "/srv/incoming"
//!
//! [timing]
//! file_quiet_ms = 30000
//! ```

use crate::error::{Result, TransferError};
use crate::streaming::fec::MAX_TOTAL_SHARES;
use crate::streaming::protocol::FIXED_OVERHEAD;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest UDP payload over IPv4
pub const MAX_CHUNK_SIZE: usize = 65_507;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the receiver binds and the sender targets
    pub receiver_ip: String,
    pub receiver_port: u16,

    /// Sustained send rate in bytes per second
    pub bandwidth_limit: u64,

    /// Datagram size in bytes, protocol overhead included
    pub chunk_size: usize,

    /// Shares needed to rebuild a chunk
    pub chunk_fec_required: usize,

    /// Shares sent per chunk
    pub chunk_fec_total: usize,

    /// Root of the received tree
    pub out_dir: PathBuf,

    /// Temp files for in-flight transfers; `<out_dir>/tempfiles` if unset
    pub temp_dir: Option<PathBuf>,

    /// Directory the sender watches for new files
    pub watch_dir: Option<PathBuf>,

    /// Work queue database and submission spool
    pub queue_dir: PathBuf,

    /// Compress payloads with zstd before sending
    pub archived_output: bool,

    /// Workers per pipeline stage; twice the CPU count if unset
    pub workers: Option<usize>,

    /// Requested SO_RCVBUF for the receiver socket
    pub receive_buffer_size: Option<usize>,

    pub timing: Timing,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            receiver_ip: "127.0.0.1".to_string(),
            receiver_port: 5000,
            bandwidth_limit: 1024 * 1024,
            chunk_size: 8192,
            chunk_fec_required: 5,
            chunk_fec_total: 10,
            out_dir: PathBuf::from("out"),
            temp_dir: None,
            watch_dir: None,
            queue_dir: PathBuf::from("owsync-queue"),
            archived_output: false,
            workers: None,
            receive_buffer_size: None,
            timing: Timing::default(),
        }
    }
}

/// Periods of the background tasks, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timing {
    pub share_sweep_interval_ms: u64,
    pub share_quiet_ms: u64,
    pub file_sweep_interval_ms: u64,
    pub file_quiet_ms: u64,
    pub queue_poll_ms: u64,
    pub buffer_monitor_ms: u64,
    pub watch_tick_ms: u64,
    pub watch_quiet_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            share_sweep_interval_ms: 5_000,
            share_quiet_ms: 10_000,
            file_sweep_interval_ms: 15_000,
            file_quiet_ms: 30_000,
            queue_poll_ms: 300,
            buffer_monitor_ms: 200,
            watch_tick_ms: 10_000,
            watch_quiet_ms: 30_000,
        }
    }
}

impl Timing {
    pub fn share_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.share_sweep_interval_ms)
    }

    pub fn share_quiet(&self) -> Duration {
        Duration::from_millis(self.share_quiet_ms)
    }

    pub fn file_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.file_sweep_interval_ms)
    }

    pub fn file_quiet(&self) -> Duration {
        Duration::from_millis(self.file_quiet_ms)
    }

    pub fn queue_poll(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }

    pub fn buffer_monitor(&self) -> Duration {
        Duration::from_millis(self.buffer_monitor_ms)
    }

    pub fn watch_tick(&self) -> Duration {
        Duration::from_millis(self.watch_tick_ms)
    }

    pub fn watch_quiet(&self) -> Duration {
        Duration::from_millis(self.watch_quiet_ms)
    }

    fn validate(&self) -> Result<()> {
        let periods = [
            ("share_sweep_interval_ms", self.share_sweep_interval_ms),
            ("file_sweep_interval_ms", self.file_sweep_interval_ms),
            ("queue_poll_ms", self.queue_poll_ms),
            ("buffer_monitor_ms", self.buffer_monitor_ms),
            ("watch_tick_ms", self.watch_tick_ms),
        ];
        for (name, value) in periods {
            if value == 0 {
                return Err(TransferError::Config(format!("timing.{} must be > 0", name)));
            }
        }
        Ok(())
    }
}

impl Config {
    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TransferError::Config(format!("reading {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&text)
            .map_err(|e| TransferError::Config(format!("parsing {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let (required, total) = (self.chunk_fec_required, self.chunk_fec_total);
        if required < 1 || total < required || total > MAX_TOTAL_SHARES {
            return Err(TransferError::InvalidFecParameters { required, total });
        }
        if self.bandwidth_limit == 0 {
            return Err(TransferError::Config("bandwidth_limit must be > 0".into()));
        }
        if self.chunk_size <= FIXED_OVERHEAD || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(TransferError::Config(format!(
                "chunk_size must be between {} and {} bytes",
                FIXED_OVERHEAD + 1,
                MAX_CHUNK_SIZE
            )));
        }
        if self.workers == Some(0) {
            return Err(TransferError::Config("workers must be > 0".into()));
        }
        self.receiver_addr()?;
        self.timing.validate()
    }

    pub fn receiver_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.receiver_ip.parse().map_err(|_| {
            TransferError::Config(format!("receiver_ip {:?} is not an IP address", self.receiver_ip))
        })?;
        Ok(SocketAddr::new(ip, self.receiver_port))
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| self.out_dir.join("tempfiles"))
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| num_cpus::get() * 2).max(1)
    }

    /// fjall keyspace of the work queue
    pub fn database_dir(&self) -> PathBuf {
        self.queue_dir.join("db")
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.queue_dir.join("spool")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.temp_dir(), PathBuf::from("out/tempfiles"));
        assert_eq!(config.receiver_addr().unwrap().port(), 5000);
        assert!(config.worker_count() >= 2);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("owsync.toml");
        std::fs::write(
            &path,
            r#"
receiver_ip = "::1"
chunk_fec_required = 3
chunk_fec_total = 4
temp_dir = "/var/tmp/owsync"
workers = 3

[timing]
file_quiet_ms = 500
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert!(config.receiver_addr().unwrap().is_ipv6());
        assert_eq!(config.chunk_fec_total, 4);
        assert_eq!(config.chunk_size, 8192);
        assert_eq!(config.temp_dir(), PathBuf::from("/var/tmp/owsync"));
        assert_eq!(config.worker_count(), 3);
        assert_eq!(config.timing.file_quiet(), Duration::from_millis(500));
        assert_eq!(config.timing.share_quiet(), Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_fec_parameters() {
        for (required, total) in [(0, 1), (5, 4), (100, 257)] {
            let config = Config {
                chunk_fec_required: required,
                chunk_fec_total: total,
                ..Config::default()
            };
            assert!(matches!(
                config.validate(),
                Err(TransferError::InvalidFecParameters { .. })
            ));
        }
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad = [
            Config {
                bandwidth_limit: 0,
                ..Config::default()
            },
            Config {
                chunk_size: FIXED_OVERHEAD,
                ..Config::default()
            },
            Config {
                chunk_size: 70_000,
                ..Config::default()
            },
            Config {
                workers: Some(0),
                ..Config::default()
            },
            Config {
                receiver_ip: "receiver.local".into(),
                ..Config::default()
            },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(TransferError::Config(_))));
        }
    }

    #[test]
    fn test_unknown_field_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("owsync.toml");
        std::fs::write(&path, "chunksize = 10\n").unwrap();
        assert!(matches!(Config::load(&path), Err(TransferError::Config(_))));
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(Config::load(&dir.path().join("absent.toml")).is_err());
    }
}
