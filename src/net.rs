//! Loopback port allocation and TCP readiness probing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::LaunchError;
use crate::process::LOOPBACK_HOST;

/// Default first port offered to the gateway.
pub const DEFAULT_PORT: u16 = 18789;
/// Default number of ports tried before giving up.
pub const DEFAULT_PORT_SPAN: u16 = 100;

// Upper bound for a single connect attempt so a black-holed SYN cannot eat
// the whole readiness budget.
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of waiting for the gateway port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A TCP connection succeeded.
    Open,
    /// The timeout elapsed first.
    TimedOut,
    /// Shutdown was requested while waiting.
    Cancelled,
}

/// Finds a loopback port that is currently free, starting at `preferred`
/// and walking upward through at most `span` candidates.
///
/// The port is not held; the gateway may still lose a race for it, which
/// shows up later as a readiness timeout.
pub async fn pick_port(preferred: u16, span: u16) -> Result<u16, LaunchError> {
    for offset in 0..span {
        let port = preferred.wrapping_add(offset);
        if port == 0 {
            continue;
        }
        if port_is_free(port).await {
            debug!(port, preferred, "picked gateway port");
            return Ok(port);
        }
        trace!(port, "port in use");
    }
    Err(LaunchError::NoPortAvailable { preferred, span })
}

async fn port_is_free(port: u16) -> bool {
    // The listener is dropped at the end of this scope, releasing the port.
    TcpListener::bind((LOOPBACK_HOST, port)).await.is_ok()
}

/// Polls `host:port` every `interval` until it accepts a TCP connection or
/// `timeout` elapses.
///
/// `cancel` is checked before each attempt and again before reporting
/// success, so a probe that outlives shutdown never reports `Open`.
pub async fn wait_for_port_open(
    host: &str,
    port: u16,
    timeout: Duration,
    interval: Duration,
    cancel: &AtomicBool,
) -> Readiness {
    let addr = format!("{}:{}", host, port);
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return Readiness::Cancelled;
        }
        let now = Instant::now();
        if now >= deadline {
            debug!(port, attempts, "readiness probe timed out");
            return Readiness::TimedOut;
        }

        attempts += 1;
        let budget = (deadline - now).min(CONNECT_ATTEMPT_TIMEOUT);
        if let Ok(Ok(_stream)) = tokio::time::timeout(budget, TcpStream::connect(&addr)).await {
            if cancel.load(Ordering::SeqCst) {
                return Readiness::Cancelled;
            }
            debug!(port, attempts, "gateway port is open");
            return Readiness::Open;
        }

        let now = Instant::now();
        if now >= deadline {
            debug!(port, attempts, "readiness probe timed out");
            return Readiness::TimedOut;
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
