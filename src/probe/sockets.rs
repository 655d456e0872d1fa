//! Held probe connections

use super::connector::is_refusal_io;
use super::Result;
use openssl::ssl::SslStream;
use std::io::{self, Read};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Delay between sweeps in [`ProbeSocketSet::await_all_closed`]
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One raw connection, non-blocking, never speaking HTTP/2
#[derive(Debug)]
pub enum ProbeSocket {
    Tls(SslStream<TcpStream>),
    Plain(TcpStream),
}

impl ProbeSocket {
    pub fn tls(stream: SslStream<TcpStream>) -> Result<Self> {
        stream.get_ref().set_nonblocking(true)?;
        Ok(ProbeSocket::Tls(stream))
    }

    pub fn plain(stream: TcpStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(ProbeSocket::Plain(stream))
    }

    pub fn tcp(&self) -> &TcpStream {
        match self {
            ProbeSocket::Tls(stream) => stream.get_ref(),
            ProbeSocket::Plain(stream) => stream,
        }
    }

    /// Has the server closed its end? Anything it sent (TLS session
    /// tickets, say) is read and discarded.
    pub fn peer_closed(&mut self) -> bool {
        let mut buf = [0u8; 4096];
        loop {
            let read = match self {
                ProbeSocket::Tls(stream) => stream.read(&mut buf),
                ProbeSocket::Plain(stream) => stream.read(&mut buf),
            };
            match read {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if !is_refusal_io(&e) {
                        debug!(error = %e, "probe socket failed");
                    }
                    return true;
                }
            }
        }
    }
}

/// The connections a probe is holding open
#[derive(Default)]
pub struct ProbeSocketSet {
    sockets: Vec<ProbeSocket>,
}

impl ProbeSocketSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, socket: ProbeSocket) {
        self.sockets.push(socket);
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProbeSocket> {
        self.sockets.iter()
    }

    /// Close the most recently opened socket, freeing its slot on the server
    pub fn release_one(&mut self) -> bool {
        match self.sockets.pop() {
            Some(socket) => {
                drop(socket);
                true
            }
            None => false,
        }
    }

    /// Number of sockets the server has closed
    pub fn count_closed(&mut self) -> usize {
        self.sockets
            .iter_mut()
            .map(|socket| socket.peer_closed())
            .filter(|closed| *closed)
            .count()
    }

    /// Wait until the server has closed every socket; false on timeout
    pub fn await_all_closed(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let total = self.sockets.len();
        let mut closed = vec![false; total];

        loop {
            for (socket, done) in self.sockets.iter_mut().zip(closed.iter_mut()) {
                if !*done {
                    *done = socket.peer_closed();
                }
            }
            let count = closed.iter().filter(|done| **done).count();
            if count == total {
                debug!(total, "all probe sockets closed by server");
                return true;
            }
            if Instant::now() >= deadline {
                debug!(closed = count, total, "probe sockets still open at deadline");
                return false;
            }
            thread::sleep(CLOSE_POLL_INTERVAL);
        }
    }
}

impl IntoIterator for ProbeSocketSet {
    type Item = ProbeSocket;
    type IntoIter = std::vec::IntoIter<ProbeSocket>;

    fn into_iter(self) -> Self::IntoIter {
        self.sockets.into_iter()
    }
}
