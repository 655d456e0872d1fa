//! Session operations abstraction
//!
//! `SessionOps` lets the HTTP/2 client run over plain TCP or TLS without
//! knowing which. `HttpSession` adds poll-based timeouts on top.

use super::{Error, Result};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

/// Operations a transport must provide
pub trait SessionOps {
    /// Wait until the session is ready for `events`.
    ///
    /// Returns false if `timeout` expired first.
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool>;

    /// Read available bytes; 0 means the peer closed the connection
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write some of `buf`
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Push buffered bytes to the socket
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close the session
    fn close(&mut self) -> Result<()>;
}

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

/// `poll(2)` a single descriptor
pub(crate) fn poll_fd(fd: RawFd, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
            PollEvents::Both => POLLIN | POLLOUT,
        },
        revents: 0,
    };

    // -1 = infinite
    let timeout_ms = timeout
        .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1);

    loop {
        let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };
        if result >= 0 {
            return Ok(result > 0);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(Error::Io(err));
        }
    }
}

/// A transport with read/write timeouts
pub struct HttpSession<S: SessionOps> {
    session: S,
    timeout: Option<Duration>,
}

impl<S: SessionOps> HttpSession<S> {
    /// Wrap a transport; the default timeout is 10 seconds
    pub fn new(session: S) -> Self {
        HttpSession {
            session,
            timeout: Some(Duration::from_secs(10)),
        }
    }

    /// Set the timeout for reads and writes (`None` waits forever)
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Current timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Read with timeout
    ///
    /// A readable socket does not guarantee application data: TLS may
    /// consume a record (a session ticket, say) and then block on the
    /// socket. A socket timeout hit that way is reported as `Timeout` too.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.session.poll(PollEvents::Read, self.timeout)? {
            return Err(Error::Timeout);
        }
        self.session.read(buf).map_err(socket_timeout)
    }

    /// Write with timeout
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.session.poll(PollEvents::Write, self.timeout)? {
            return Err(Error::Timeout);
        }
        self.session.write(buf).map_err(socket_timeout)
    }

    /// Write all of `buf` and flush
    pub fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.write(buf)? {
                0 => return Err(Error::ConnectionClosed),
                n => buf = &buf[n..],
            }
        }
        self.session.flush()
    }

    /// Close the session
    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }

    /// Underlying transport
    pub fn get_ref(&self) -> &S {
        &self.session
    }

    /// Underlying transport, mutably
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.session
    }

    /// Unwrap the transport
    pub fn into_inner(self) -> S {
        self.session
    }
}

/// `SO_RCVTIMEO`/`SO_SNDTIMEO` expiry surfaces as `WouldBlock` or `TimedOut`
fn socket_timeout(err: Error) -> Error {
    match err {
        Error::Io(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            Error::Timeout
        }
        other => other,
    }
}

/// Plain TCP session
pub struct FdSessionOps {
    stream: TcpStream,
}

impl FdSessionOps {
    /// Wrap a connected stream
    pub fn new(stream: TcpStream) -> Self {
        FdSessionOps { stream }
    }

    /// Underlying stream
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Give back the stream
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

impl SessionOps for FdSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        poll_fd(self.stream.as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf).map_err(Error::from)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.stream.write(buf).map_err(Error::from)
    }

    fn flush(&mut self) -> Result<()> {
        self.stream.flush().map_err(Error::from)
    }

    fn close(&mut self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
