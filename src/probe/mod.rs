//! Concurrent connection probe
//!
//! Counts the connection slots a server will hand out by opening raw
//! connections and holding them, without ever starting HTTP/2 on them.
//! Each blocking connect and handshake runs on a worker thread so a stuck
//! attempt can never hang the test driving the probe.
//!
//! ```no_run
//! use ion_harness::probe::ConnectionProbe;
//!
//! let probe = ConnectionProbe::tls("localhost", 8443)?;
//! let mut report = probe.probe_limit(128)?;
//! assert_eq!(report.accepted(), 128);
//! assert!(report.limit_error_observed);
//!
//! // A freed slot can be used again
//! report.sockets.release_one();
//! # Ok::<(), ion_harness::probe::Error>(())
//! ```

pub mod connector;
pub mod sockets;

pub use connector::{PlainProbeConnector, ProbeConnector, TlsProbeConnector};
pub use sockets::{ProbeSocket, ProbeSocketSet};

use crate::http::tls::TlsError;
use crate::net;
use std::net::SocketAddr;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Extra attempts beyond the expected limit
pub const DEFAULT_MARGIN: usize = 5;

/// Default bound on each blocking connect and handshake step
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Result type for probe operations
pub type Result<T> = std::result::Result<T, Error>;

/// Probe errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The server refused or aborted the connection the way it does at capacity
    #[error("Connection limit reached: {reason}")]
    ConnectionLimitReached { reason: String },

    #[error("Network error: {0}")]
    Network(#[from] net::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::http::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection attempt did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Connection worker panicked")]
    WorkerPanicked,
}

impl Error {
    /// True for the expected at-capacity refusal
    pub fn is_limit_reached(&self) -> bool {
        matches!(self, Error::ConnectionLimitReached { .. })
    }
}

/// Outcome of [`ConnectionProbe::probe_limit`]
pub struct ProbeReport {
    /// Every connection the server accepted, still open
    pub sockets: ProbeSocketSet,
    /// An attempt failed with the at-capacity signature
    pub limit_error_observed: bool,
}

impl ProbeReport {
    pub fn accepted(&self) -> usize {
        self.sockets.len()
    }
}

/// Opens and holds raw connections to one server
pub struct ConnectionProbe {
    addr: SocketAddr,
    connector: Arc<dyn ProbeConnector>,
    margin: usize,
    connect_timeout: Duration,
}

impl ConnectionProbe {
    pub fn new(host: &str, port: u16, connector: impl ProbeConnector + 'static) -> Result<Self> {
        Ok(Self::for_addr(net::resolve(host, port)?, connector))
    }

    pub fn for_addr(addr: SocketAddr, connector: impl ProbeConnector + 'static) -> Self {
        ConnectionProbe {
            addr,
            connector: Arc::new(connector),
            margin: DEFAULT_MARGIN,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Probe using TLS connections offering `h2`
    pub fn tls(host: &str, port: u16) -> Result<Self> {
        Self::new(host, port, TlsProbeConnector::new()?)
    }

    /// Attempts beyond the target before giving up on seeing a refusal
    pub fn margin(mut self, margin: usize) -> Self {
        self.margin = margin;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Open one connection on a worker thread
    pub fn open_one(&self) -> Result<ProbeSocket> {
        let (tx, rx) = mpsc::channel();
        let connector = Arc::clone(&self.connector);
        let (addr, timeout) = (self.addr, self.connect_timeout);

        thread::Builder::new()
            .name("probe-connect".to_string())
            .spawn(move || {
                let _ = tx.send(connector.open(addr, timeout));
            })?;

        // TCP connect plus a handshake made of a few bounded reads
        let budget = timeout * 3;
        match rx.recv_timeout(budget) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(Error::Timeout(budget)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Error::WorkerPanicked),
        }
    }

    /// Open connections one at a time, up to `target` plus the margin,
    /// stopping at the first at-capacity refusal. Any other failure is
    /// returned as an error.
    pub fn probe_limit(&self, target: usize) -> Result<ProbeReport> {
        let mut sockets = ProbeSocketSet::new();

        for attempt in 1..=target + self.margin {
            match self.open_one() {
                Ok(socket) => sockets.push(socket),
                Err(err) if err.is_limit_reached() => {
                    info!(accepted = sockets.len(), attempt, "server refused connection: {}", err);
                    return Ok(ProbeReport {
                        sockets,
                        limit_error_observed: true,
                    });
                }
                Err(err) => return Err(err),
            }
            if attempt % 32 == 0 {
                debug!(open = sockets.len(), "probe progress");
            }
        }

        info!(accepted = sockets.len(), "no refusal observed");
        Ok(ProbeReport {
            sockets,
            limit_error_observed: false,
        })
    }

    /// Open `count` connections in parallel; the first failure wins
    pub fn open_concurrent(&self, count: usize) -> Result<ProbeSocketSet> {
        let results: Vec<Result<ProbeSocket>> = thread::scope(|scope| {
            let workers: Vec<_> = (0..count)
                .map(|_| scope.spawn(|| self.connector.open(self.addr, self.connect_timeout)))
                .collect();
            workers
                .into_iter()
                .map(|worker| worker.join().unwrap_or(Err(Error::WorkerPanicked)))
                .collect()
        });

        let mut sockets = ProbeSocketSet::new();
        for result in results {
            sockets.push(result?);
        }
        debug!(count, "concurrent probe connections open");
        Ok(sockets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Accepts `limit` connections, then reports refusals
    struct CountingConnector {
        opened: AtomicUsize,
        limit: usize,
        listener: TcpListener,
    }

    impl CountingConnector {
        fn new(limit: usize) -> Self {
            CountingConnector {
                opened: AtomicUsize::new(0),
                limit,
                listener: TcpListener::bind("127.0.0.1:0").unwrap(),
            }
        }
    }

    impl ProbeConnector for CountingConnector {
        fn open(&self, _addr: SocketAddr, _timeout: Duration) -> Result<ProbeSocket> {
            if self.opened.fetch_add(1, Ordering::SeqCst) >= self.limit {
                return Err(Error::ConnectionLimitReached {
                    reason: "full".to_string(),
                });
            }
            ProbeSocket::plain(std::net::TcpStream::connect(self.listener.local_addr()?)?)
        }
    }

    #[test]
    fn test_probe_stops_at_limit() {
        let probe = ConnectionProbe::for_addr("127.0.0.1:1".parse().unwrap(), CountingConnector::new(4));
        let report = probe.probe_limit(4).unwrap();
        assert_eq!(report.accepted(), 4);
        assert!(report.limit_error_observed);
    }

    #[test]
    fn test_probe_without_refusal() {
        let probe = ConnectionProbe::for_addr("127.0.0.1:1".parse().unwrap(), CountingConnector::new(100)).margin(2);
        let report = probe.probe_limit(3).unwrap();
        assert_eq!(report.accepted(), 5);
        assert!(!report.limit_error_observed);
    }

    #[test]
    fn test_unexpected_errors_propagate() {
        let closed = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let probe = ConnectionProbe::for_addr(closed, PlainProbeConnector::default())
            .connect_timeout(Duration::from_millis(500));
        let err = probe.probe_limit(2).err().unwrap();
        assert!(!err.is_limit_reached());
        assert!(matches!(err, Error::Network(_)));
    }

    #[test]
    fn test_open_concurrent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let probe = ConnectionProbe::for_addr(listener.local_addr().unwrap(), PlainProbeConnector::new(Duration::from_millis(10)));
        let sockets = probe.open_concurrent(8).unwrap();
        assert_eq!(sockets.len(), 8);
    }
}
