//! Port readiness probe
//!
//! Bounded polling of a TCP port until something accepts connections on it.

use super::{connect, resolve, Result};
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default time to wait for a port to open
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default delay between connection attempts
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Per-attempt connect timeout
const ATTEMPT_TIMEOUT: Duration = Duration::from_millis(250);

/// Polls a TCP port until it accepts a connection or the timeout expires
#[derive(Debug, Clone)]
pub struct PortReadinessProbe {
    addr: SocketAddr,
    timeout: Duration,
    interval: Duration,
}

impl PortReadinessProbe {
    /// Create a probe for `host:port` with default timing
    pub fn new(host: &str, port: u16) -> Result<Self> {
        Ok(Self::for_addr(resolve(host, port)?))
    }

    /// Create a probe for an already resolved address
    pub fn for_addr(addr: SocketAddr) -> Self {
        PortReadinessProbe {
            addr,
            timeout: DEFAULT_READY_TIMEOUT,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set the overall wait timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the delay between attempts
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Address being probed
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Single attempt: does the port accept a connection right now?
    pub fn is_ready(&self) -> bool {
        let attempt = ATTEMPT_TIMEOUT.min(self.timeout.max(Duration::from_millis(1)));
        match connect(self.addr, attempt) {
            Ok(stream) => {
                drop(stream);
                true
            }
            Err(_) => false,
        }
    }

    /// Poll until the port is ready; returns false once the timeout expires.
    pub fn wait(&self) -> bool {
        self.wait_while(|| true)
    }

    /// Poll until the port is ready, giving up early as soon as `keep_going`
    /// returns false.
    ///
    /// The supervisor uses this to stop waiting when the child process dies.
    pub fn wait_while<F>(&self, mut keep_going: F) -> bool
    where
        F: FnMut() -> bool,
    {
        debug!("waiting for {} to accept connections", self.addr);
        let deadline = Instant::now() + self.timeout;

        loop {
            if self.is_ready() {
                debug!("{} is accepting connections", self.addr);
                return true;
            }

            let now = Instant::now();
            if now >= deadline || !keep_going() {
                return false;
            }

            thread::sleep(self.interval.min(deadline - now));
        }
    }
}
