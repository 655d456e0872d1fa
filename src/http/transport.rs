//! Runtime choice between cleartext and TLS

use super::session::{FdSessionOps, PollEvents, SessionOps};
use super::tls::{TlsConfig, TlsSessionOps};
use super::Result;
use crate::net;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::debug;

/// Either a plain TCP session or a TLS one
pub enum Transport {
    Plain(FdSessionOps),
    Tls(TlsSessionOps),
}

impl Transport {
    /// Connect to `addr`, performing the TLS handshake if `tls` is given.
    ///
    /// `timeout` bounds the TCP connect and each handshake read. Call
    /// [`set_io_timeout`](Self::set_io_timeout) afterwards to bound later
    /// socket reads and writes differently.
    pub fn connect(addr: SocketAddr, tls: Option<&TlsConfig>, timeout: Duration) -> Result<Self> {
        let stream = net::connect(addr, timeout)?;
        match tls {
            Some(config) => {
                let session = config.connect(stream)?;
                debug!(%addr, alpn = ?session.vars().alpn, "TLS transport established");
                Ok(Transport::Tls(session))
            }
            None => {
                debug!(%addr, "cleartext transport established");
                Ok(Transport::Plain(FdSessionOps::new(stream)))
            }
        }
    }

    /// Replace the socket read and write timeouts
    pub fn set_io_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let stream = match self {
            Transport::Plain(s) => s.stream(),
            Transport::Tls(s) => s.get_ref(),
        };
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        Ok(())
    }

    /// True for TLS
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// Negotiated ALPN protocol, `None` for cleartext
    pub fn alpn(&self) -> Option<&str> {
        match self {
            Transport::Tls(session) => session.vars().alpn.as_deref(),
            Transport::Plain(_) => None,
        }
    }
}

impl SessionOps for Transport {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        match self {
            Transport::Plain(s) => s.poll(events, timeout),
            Transport::Tls(s) => s.poll(events, timeout),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::Tls(s) => s.flush(),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self {
            Transport::Plain(s) => s.close(),
            Transport::Tls(s) => s.close(),
        }
    }
}
