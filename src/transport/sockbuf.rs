//! Receive-buffer telemetry.
//!
//! The kernel drops datagrams silently once a socket's receive buffer is
//! full. Sampling the queued bytes against `SO_RCVBUF` gives operators an
//! early warning that loss is imminent. Advisory only: nothing here
//! throttles or drops.

use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Occupancy above which loss is considered likely
pub const LOSS_RISK_THRESHOLD: f64 = 0.8;

/// Fraction of the buffer in use.
pub fn occupancy(queued: usize, capacity: usize) -> f64 {
    if capacity == 0 {
        return 0.0;
    }
    queued as f64 / capacity as f64
}

#[cfg(unix)]
mod sys {
    use std::io;
    use std::os::fd::AsRawFd;
    use tokio::net::UdpSocket;

    pub fn receive_buffer_size(socket: &UdpSocket) -> io::Result<usize> {
        let mut value: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: value and len are valid for writes of the sizes passed
        let rc = unsafe {
            libc::getsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &mut value as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(value.max(0) as usize)
    }

    pub fn set_receive_buffer_size(socket: &UdpSocket, size: usize) -> io::Result<()> {
        let value = libc::c_int::try_from(size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "buffer size too large"))?;
        // SAFETY: value outlives the call and len matches its size
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &value as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    pub fn queued_bytes(socket: &UdpSocket) -> io::Result<Option<usize>> {
        let link = std::fs::read_link(format!("/proc/self/fd/{}", socket.as_raw_fd()))?;
        let inode = link
            .to_str()
            .and_then(|l| l.strip_prefix("socket:["))
            .and_then(|l| l.strip_suffix(']'))
            .and_then(|l| l.parse::<u64>().ok())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected socket link {}", link.display()),
                )
            })?;

        for table in ["/proc/net/udp", "/proc/net/udp6"] {
            let contents = match std::fs::read_to_string(table) {
                Ok(contents) => contents,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            if let Some(queued) = super::parse_rx_queue(&contents, inode) {
                return Ok(Some(queued));
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("socket inode {} not listed in /proc/net/udp", inode),
        ))
    }

    #[cfg(target_os = "macos")]
    pub fn queued_bytes(socket: &UdpSocket) -> io::Result<Option<usize>> {
        let mut queued: libc::c_int = 0;
        // SAFETY: FIONREAD writes one c_int
        let rc = unsafe { libc::ioctl(socket.as_raw_fd(), libc::FIONREAD, &mut queued) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Some(queued.max(0) as usize))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    pub fn queued_bytes(_socket: &UdpSocket) -> io::Result<Option<usize>> {
        Ok(None)
    }
}

#[cfg(not(unix))]
mod sys {
    use std::io;
    use tokio::net::UdpSocket;

    fn unsupported() -> io::Error {
        io::Error::new(io::ErrorKind::Unsupported, "socket buffer control unsupported")
    }

    pub fn receive_buffer_size(_socket: &UdpSocket) -> io::Result<usize> {
        Err(unsupported())
    }

    pub fn set_receive_buffer_size(_socket: &UdpSocket, _size: usize) -> io::Result<()> {
        Err(unsupported())
    }

    pub fn queued_bytes(_socket: &UdpSocket) -> io::Result<Option<usize>> {
        Ok(None)
    }
}

pub use sys::{queued_bytes, receive_buffer_size, set_receive_buffer_size};

/// Find the `rx_queue` of the socket with `inode` in a `/proc/net/udp`
/// table.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_rx_queue(table: &str, inode: u64) -> Option<usize> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 || fields[9].parse::<u64>().ok()? != inode {
            return None;
        }
        let (_, rx) = fields[4].split_once(':')?;
        usize::from_str_radix(rx, 16).ok()
    })
}

/// Change in buffer pressure between two samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pressure {
    /// Crossed above the loss-risk threshold
    Rising,
    /// Dropped back to or below it
    Recovered,
    Steady,
}

/// Update `at_risk` with a new occupancy sample.
fn track_pressure(at_risk: &mut bool, used: f64) -> Pressure {
    let now = used > LOSS_RISK_THRESHOLD;
    let change = match (*at_risk, now) {
        (false, true) => Pressure::Rising,
        (true, false) => Pressure::Recovered,
        _ => Pressure::Steady,
    };
    *at_risk = now;
    change
}

/// Sample the socket every `interval` and warn while the buffer is nearly
/// full. Exits quietly where sampling is unsupported.
pub async fn run_monitor(socket: Arc<UdpSocket>, interval: Duration, cancel: CancellationToken) {
    let capacity = match receive_buffer_size(&socket) {
        Ok(capacity) if capacity > 0 => capacity,
        Ok(_) => {
            info!("Receive buffer size unknown, buffer monitoring disabled");
            return;
        }
        Err(e) => {
            info!("Buffer monitoring disabled: {}", e);
            return;
        }
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut at_risk = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let queued = match queued_bytes(&socket) {
            Ok(Some(queued)) => queued,
            Ok(None) => {
                info!("Buffer monitoring not supported on this platform");
                return;
            }
            Err(e) => {
                warn!("Buffer monitoring stopped: {}", e);
                return;
            }
        };

        let used = occupancy(queued, capacity);
        match track_pressure(&mut at_risk, used) {
            Pressure::Rising => warn!(
                queued,
                capacity,
                "Receive buffer {:.0}% full, datagrams are likely to be dropped",
                used * 100.0
            ),
            Pressure::Recovered => {
                info!(queued, capacity, "Receive buffer back to {:.0}%", used * 100.0)
            }
            Pressure::Steady => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode ref pointer drops
  312: 00000000:0044 00000000:0000 07 00000000:00000000 00:00000000 00000000     0        0 17454 2 0000000000000000 0
  977: 0100007F:2710 00000000:0000 07 00000000:0001E240 00:00000000 00000000  1000        0 99871 2 0000000000000000 12
";

    #[test]
    fn test_pressure_warns_once_and_recovers() {
        let mut at_risk = false;
        let samples = [0.5, 0.81, 0.95, 0.9, 0.8, 0.2, 0.85];
        let changes: Vec<Pressure> = samples
            .iter()
            .map(|&used| track_pressure(&mut at_risk, used))
            .collect();
        assert_eq!(
            changes,
            vec![
                Pressure::Steady,
                Pressure::Rising,
                Pressure::Steady,
                Pressure::Steady,
                Pressure::Recovered,
                Pressure::Steady,
                Pressure::Rising,
            ]
        );
        assert!(at_risk);
    }

    #[test]
    fn test_parse_rx_queue() {
        assert_eq!(parse_rx_queue(TABLE, 99871), Some(0x1E240));
        assert_eq!(parse_rx_queue(TABLE, 17454), Some(0));
        assert_eq!(parse_rx_queue(TABLE, 1), None);
        assert_eq!(parse_rx_queue("", 1), None);
    }

    #[test]
    fn test_occupancy() {
        assert_eq!(occupancy(0, 0), 0.0);
        assert!(occupancy(900, 1000) > LOSS_RISK_THRESHOLD);
        assert!(occupancy(500, 1000) < LOSS_RISK_THRESHOLD);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_queued_bytes_sees_unread_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        assert_eq!(queued_bytes(&receiver).unwrap(), Some(0));

        for _ in 0..10 {
            sender
                .send_to(&[0u8; 512], receiver.local_addr().unwrap())
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(queued_bytes(&receiver).unwrap().unwrap() > 0);
        assert!(receive_buffer_size(&receiver).unwrap() > 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_set_receive_buffer_size() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        set_receive_buffer_size(&socket, 64 * 1024).unwrap();
        // Linux doubles the requested value for bookkeeping overhead
        assert!(receive_buffer_size(&socket).unwrap() >= 64 * 1024);
    }
}
