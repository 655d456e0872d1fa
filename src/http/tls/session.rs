//! `SessionOps` over an OpenSSL stream

use super::config::{TlsConfig, TlsError};
use super::vars::TlsVars;
use crate::http::session::{poll_fd, PollEvents, SessionOps};
use crate::http::{Error, Result as HttpResult};
use openssl::ssl::{HandshakeError, Ssl, SslStream};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;
use tracing::debug;

/// Encrypted session
pub struct TlsSessionOps {
    stream: SslStream<TcpStream>,
    vars: TlsVars,
    failed: bool,
}

fn handshake_error(e: HandshakeError<TcpStream>) -> TlsError {
    match e {
        HandshakeError::SetupFailure(stack) => TlsError::OpenSsl(stack),
        HandshakeError::Failure(mid) | HandshakeError::WouldBlock(mid) => {
            TlsError::Handshake(mid.into_error())
        }
    }
}

impl TlsSessionOps {
    /// Client handshake (blocking, bounded by the socket's timeouts)
    pub fn connect(tcp_stream: TcpStream, config: &TlsConfig) -> Result<Self, TlsError> {
        let mut ssl = Ssl::new(&config.ctx)?;
        if let Some(ref servername) = config.servername {
            ssl.set_hostname(servername)?;
        }

        let stream = ssl.connect(tcp_stream).map_err(handshake_error)?;
        Ok(Self::established(stream))
    }

    /// Server handshake
    pub fn accept(tcp_stream: TcpStream, config: &TlsConfig) -> Result<Self, TlsError> {
        let ssl = Ssl::new(&config.ctx)?;
        let stream = ssl.accept(tcp_stream).map_err(handshake_error)?;
        Ok(Self::established(stream))
    }

    fn established(stream: SslStream<TcpStream>) -> Self {
        let vars = TlsVars::from_ssl(stream.ssl());
        debug!(version = %vars.version, alpn = ?vars.alpn, "TLS handshake complete");
        TlsSessionOps {
            stream,
            vars,
            failed: false,
        }
    }

    /// Negotiated parameters
    pub fn vars(&self) -> &TlsVars {
        &self.vars
    }

    /// True once a read or write has failed
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Underlying TCP stream
    pub fn get_ref(&self) -> &TcpStream {
        self.stream.get_ref()
    }

    /// Give up the session and keep the raw OpenSSL stream
    pub fn into_stream(self) -> SslStream<TcpStream> {
        self.stream
    }
}

impl SessionOps for TlsSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> HttpResult<bool> {
        // Decrypted bytes may already be buffered inside OpenSSL
        if events != PollEvents::Write && self.stream.ssl().pending() > 0 {
            return Ok(true);
        }
        poll_fd(self.stream.get_ref().as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> HttpResult<usize> {
        self.stream.read(buf).map_err(|e| {
            self.failed = true;
            Error::Io(e)
        })
    }

    fn write(&mut self, buf: &[u8]) -> HttpResult<usize> {
        self.stream.write(buf).map_err(|e| {
            self.failed = true;
            Error::Io(e)
        })
    }

    fn flush(&mut self) -> HttpResult<()> {
        self.stream.flush().map_err(|e| {
            self.failed = true;
            Error::Io(e)
        })
    }

    fn close(&mut self) -> HttpResult<()> {
        if !self.failed {
            // close_notify is best-effort; the peer may already be gone
            let _ = self.stream.shutdown();
        }
        match self.stream.get_mut().shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn server_config() -> TlsConfig {
        TlsConfig::server().unwrap().alpn(&["h2"]).unwrap().build().unwrap()
    }

    #[test]
    fn test_handshake_negotiates_h2() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server_config = server_config();

        let server = thread::spawn(move || {
            let (tcp, _) = listener.accept().unwrap();
            let mut session = server_config.accept(tcp).unwrap();
            assert!(session.vars().is_h2());

            let mut buf = [0u8; 5];
            let mut read = 0;
            while read < buf.len() {
                read += session.read(&mut buf[read..]).unwrap();
            }
            assert_eq!(&buf, b"hello");
            session.write(b"world").unwrap();
            session.flush().unwrap();
        });

        let client_config = TlsConfig::h2_client("localhost").unwrap();
        let mut session = client_config.connect(TcpStream::connect(addr).unwrap()).unwrap();
        assert!(session.vars().is_h2());
        assert!(session.vars().version.starts_with("TLS"));

        session.write(b"hello").unwrap();
        session.flush().unwrap();

        assert!(session.poll(PollEvents::Read, Some(Duration::from_secs(5))).unwrap());
        let mut buf = [0u8; 5];
        let mut read = 0;
        while read < buf.len() {
            read += session.read(&mut buf[read..]).unwrap();
        }
        assert_eq!(&buf, b"world");

        server.join().unwrap();
        session.close().unwrap();
    }

    #[test]
    fn test_no_alpn_overlap() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server_config = server_config();

        let server = thread::spawn(move || {
            let (tcp, _) = listener.accept().unwrap();
            server_config.accept(tcp).map(|s| s.vars().alpn.clone())
        });

        let client_config = TlsConfig::client()
            .unwrap()
            .alpn(&["http/1.1"])
            .unwrap()
            .build()
            .unwrap();
        let session = client_config.connect(TcpStream::connect(addr).unwrap()).unwrap();

        assert!(!session.vars().is_h2());
        assert_eq!(server.join().unwrap().unwrap(), None);
    }

    #[test]
    fn test_handshake_against_closed_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (tcp, _) = listener.accept().unwrap();
            drop(tcp);
        });

        let client_config = TlsConfig::h2_client("localhost").unwrap();
        let tcp = TcpStream::connect(addr).unwrap();
        server.join().unwrap();

        match client_config.connect(tcp) {
            Err(TlsError::Handshake(_)) => {}
            Err(other) => panic!("Expected handshake error, got {}", other),
            Ok(_) => panic!("Expected handshake to fail"),
        }
    }
}
