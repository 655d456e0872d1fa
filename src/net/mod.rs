//! Network utilities
//!
//! Socket construction shared by the HTTP/2 transport and the connection
//! probe, plus the port readiness probe used by the process supervisor.

pub mod readiness;

pub use readiness::PortReadinessProbe;

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Result type for network operations
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Could not resolve {0}")]
    Resolve(String),

    #[error("Connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },
}

/// Resolve `host:port`, preferring IPv4 addresses.
///
/// The server under test usually binds `0.0.0.0`, so `localhost` resolving to
/// `::1` first would look like a refused connection.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Resolve(format!("{}:{} ({})", host, port, e)))?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| Error::Resolve(format!("{}:{}", host, port)))
}

/// Open a TCP connection with a bounded connect time.
///
/// The returned stream is in blocking mode with `TCP_NODELAY` set and read and
/// write timeouts equal to `timeout`, so a stalled peer can never block the
/// caller forever.
pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.connect_timeout(&addr.into(), timeout).map_err(|e| {
        if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock {
            Error::ConnectTimeout { addr, timeout }
        } else {
            Error::Io(e)
        }
    })?;

    socket.set_nodelay(true)?;
    socket.set_read_timeout(Some(timeout))?;
    socket.set_write_timeout(Some(timeout))?;

    Ok(socket.into())
}
