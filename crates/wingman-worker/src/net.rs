// Local port probing.

use std::net::TcpListener;
use std::ops::RangeInclusive;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PortError {
    #[error("no free port in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },
    #[error("port scan cancelled")]
    Cancelled,
}

pub fn is_port_free(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

/// Probe `range` in order and return the first port we can bind.
/// The scan stops early once `cancel` fires.
pub fn find_available_port(
    host: &str,
    range: RangeInclusive<u16>,
    cancel: &CancellationToken,
) -> Result<u16, PortError> {
    let (start, end) = (*range.start(), *range.end());
    for port in range {
        if cancel.is_cancelled() {
            return Err(PortError::Cancelled);
        }
        if port != 0 && is_port_free(host, port) {
            return Ok(port);
        }
    }
    Err(PortError::Exhausted { start, end })
}

/// Poll until something accepts connections on `host:port`.
pub async fn wait_for_port(host: &str, port: u16, timeout: Duration) -> bool {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if tokio::net::TcpStream::connect((host, port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skips_bound_port() {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = held.local_addr().unwrap().port();
        let never = CancellationToken::new();

        let found = find_available_port("127.0.0.1", taken..=taken.saturating_add(20), &never).unwrap();
        assert_ne!(found, taken);
    }

    #[test]
    fn test_exhausted_range() {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = held.local_addr().unwrap().port();
        let never = CancellationToken::new();

        assert_eq!(
            find_available_port("127.0.0.1", taken..=taken, &never),
            Err(PortError::Exhausted { start: taken, end: taken })
        );
    }

    #[test]
    fn test_cancelled_scan() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            find_available_port("127.0.0.1", 49152..=65535, &cancel),
            Err(PortError::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_wait_for_port() {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        assert!(wait_for_port("127.0.0.1", port, Duration::from_secs(2)).await);

        drop(held);
        assert!(!wait_for_port("127.0.0.1", port, Duration::from_millis(300)).await);
    }
}
