//! Ways of opening one raw probe connection
//!
//! A connector either returns a socket the server accepted or decides that
//! the attempt failed the way a server at capacity makes it fail (the peer
//! closes or resets during the handshake). Every other failure is passed on
//! unchanged so tests do not mistake a broken setup for a full server.

use super::sockets::ProbeSocket;
use super::{Error, Result};
use crate::http::session::{poll_fd, PollEvents};
use crate::http::tls::{TlsConfig, TlsError};
use crate::net;
use openssl::ssl::ErrorCode;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;
use tracing::trace;

/// Opens one connection; implementations run on probe worker threads
pub trait ProbeConnector: Send + Sync {
    /// Connect to `addr`, bounding each blocking step by `timeout`
    fn open(&self, addr: SocketAddr, timeout: Duration) -> Result<ProbeSocket>;
}

/// I/O errors a server produces when it drops a connection it will not serve
pub(crate) fn is_refusal_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    ) || err.to_string().to_ascii_lowercase().contains("unexpected eof")
}

/// Handshake failures caused by the peer closing on us
pub(crate) fn is_refusal_ssl(err: &openssl::ssl::Error) -> bool {
    match err.code() {
        ErrorCode::ZERO_RETURN => true,
        // SYSCALL without an errno is a bare EOF
        ErrorCode::SYSCALL => err.io_error().map_or(true, is_refusal_io),
        ErrorCode::SSL => err
            .ssl_error()
            .map_or(false, |stack| stack.to_string().to_ascii_lowercase().contains("unexpected eof")),
        _ => err.io_error().map_or(false, is_refusal_io),
    }
}

fn refused(reason: impl ToString) -> Error {
    Error::ConnectionLimitReached {
        reason: reason.to_string(),
    }
}

fn connect_tcp(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    match net::connect(addr, timeout) {
        Ok(stream) => Ok(stream),
        Err(net::Error::Io(e)) if is_refusal_io(&e) => Err(refused(e)),
        Err(e) => Err(e.into()),
    }
}

/// Completes a TLS handshake (offering `h2`) and holds the session without
/// ever sending the HTTP/2 preface
pub struct TlsProbeConnector {
    config: TlsConfig,
}

impl TlsProbeConnector {
    /// No SNI, ALPN `h2`, no peer verification
    pub fn new() -> Result<Self> {
        let config = TlsConfig::client()?.alpn(&["h2"])?.build()?;
        Ok(Self::with_config(config))
    }

    pub fn with_config(config: TlsConfig) -> Self {
        TlsProbeConnector { config }
    }
}

impl ProbeConnector for TlsProbeConnector {
    fn open(&self, addr: SocketAddr, timeout: Duration) -> Result<ProbeSocket> {
        let tcp = connect_tcp(addr, timeout)?;
        let session = match self.config.connect(tcp) {
            Ok(session) => session,
            Err(TlsError::Handshake(e)) if is_refusal_ssl(&e) => return Err(refused(e)),
            Err(TlsError::Io(e)) if is_refusal_io(&e) => return Err(refused(e)),
            Err(e) => return Err(e.into()),
        };
        trace!(%addr, "probe TLS connection established");
        ProbeSocket::tls(session.into_stream())
    }
}

/// Opens cleartext TCP connections
///
/// A TCP connect succeeds as soon as the kernel accepts it, so the
/// connector waits `settle` for the server to close the socket before
/// counting it as held.
pub struct PlainProbeConnector {
    settle: Duration,
}

impl PlainProbeConnector {
    pub fn new(settle: Duration) -> Self {
        PlainProbeConnector { settle }
    }
}

impl Default for PlainProbeConnector {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

impl ProbeConnector for PlainProbeConnector {
    fn open(&self, addr: SocketAddr, timeout: Duration) -> Result<ProbeSocket> {
        let tcp = connect_tcp(addr, timeout)?;

        if poll_fd(tcp.as_raw_fd(), PollEvents::Read, Some(self.settle))? {
            let mut byte = [0u8; 1];
            match tcp.peek(&mut byte) {
                Ok(0) => return Err(refused("connection closed by peer")),
                Ok(_) => {}
                Err(e) if is_refusal_io(&e) => return Err(refused(e)),
                Err(e) => return Err(e.into()),
            }
        }
        trace!(%addr, "probe TCP connection established");
        ProbeSocket::plain(tcp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_refusal_io_kinds() {
        assert!(is_refusal_io(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_refusal_io(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(is_refusal_io(&io::Error::new(
            io::ErrorKind::Other,
            "error:0A000126:SSL routines::unexpected eof while reading"
        )));
        assert!(!is_refusal_io(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(!is_refusal_io(&io::Error::from(io::ErrorKind::TimedOut)));
    }

    #[test]
    fn test_tls_handshake_against_closing_peer_is_refusal() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let connector = TlsProbeConnector::new().unwrap();
        let err = connector.open(addr, Duration::from_secs(2)).unwrap_err();
        peer.join().unwrap();
        assert!(err.is_limit_reached(), "unexpected error: {err}");
    }

    #[test]
    fn test_connection_refused_is_not_a_limit() {
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let connector = PlainProbeConnector::default();
        let err = connector.open(addr, Duration::from_millis(500)).unwrap_err();
        assert!(!err.is_limit_reached());
    }

    #[test]
    fn test_plain_connector_detects_immediate_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let connector = PlainProbeConnector::new(Duration::from_secs(1));
        let err = connector.open(addr, Duration::from_secs(1)).unwrap_err();
        peer.join().unwrap();
        assert!(err.is_limit_reached());
    }

    #[test]
    fn test_plain_connector_holds_open_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = PlainProbeConnector::new(Duration::from_millis(20));
        let mut socket = connector.open(addr, Duration::from_secs(1)).unwrap();
        assert!(!socket.peer_closed());
        drop(listener);
    }
}
