//! Captured child output
//!
//! Each output pipe is drained by its own thread into an [`OutputBuffer`].
//! The drain thread is the only writer; readers take snapshots at any time.

use super::{Error, Result};
use std::fmt;
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const DRAIN_CHUNK: usize = 8192;
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Which pipe a buffer or drain task belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Append-only byte buffer shared between a drain thread and its readers
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl OutputBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        OutputBuffer::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        // A panicking drain thread leaves the bytes intact
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn append(&self, data: &[u8]) {
        self.lock().extend_from_slice(data);
    }

    /// Current contents decoded as UTF-8 (lossy)
    pub fn snapshot(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }

    /// Current contents as raw bytes
    pub fn bytes(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Number of bytes captured so far
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if nothing has been captured
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if the decoded contents contain `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.snapshot().contains(needle)
    }

    /// Poll until `needle` shows up or `timeout` elapses
    pub fn wait_for(&self, needle: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.contains(needle) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

/// How a drain thread ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The pipe reached end-of-stream
    Eof,
    /// The thread observed the cancel flag
    Cancelled,
}

/// Background thread copying one pipe into an [`OutputBuffer`]
pub struct DrainTask {
    stream: OutputStream,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<io::Result<DrainOutcome>>>,
}

impl DrainTask {
    /// Start draining `pipe` into `buffer`
    pub fn spawn<R>(stream: OutputStream, pipe: R, buffer: OutputBuffer) -> Result<Self>
    where
        R: Read + AsRawFd + Send + 'static,
    {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);

        let handle = thread::Builder::new()
            .name(format!("drain-{}", stream))
            .spawn(move || drain(pipe, buffer, flag))?;

        Ok(DrainTask {
            stream,
            cancel,
            handle: Some(handle),
        })
    }

    /// Which pipe this task drains
    pub fn stream(&self) -> OutputStream {
        self.stream
    }

    /// True once the thread has returned
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Ask the thread to stop at its next poll
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Wait up to `grace` for end-of-stream, then cancel and join.
    ///
    /// Cancellation is not an error. I/O failures and panics in the drain
    /// thread are.
    pub fn finish(&mut self, grace: Duration) -> Result<DrainOutcome> {
        let deadline = Instant::now() + grace;
        while !self.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        self.cancel();
        self.join()
    }

    fn join(&mut self) -> Result<DrainOutcome> {
        let Some(handle) = self.handle.take() else {
            return Ok(DrainOutcome::Cancelled);
        };

        match handle.join() {
            Ok(Ok(outcome)) => {
                debug!(stream = %self.stream, ?outcome, "drain finished");
                Ok(outcome)
            }
            Ok(Err(source)) => Err(Error::Drain {
                stream: self.stream,
                source,
            }),
            Err(_) => Err(Error::DrainPanicked(self.stream)),
        }
    }
}

impl Drop for DrainTask {
    fn drop(&mut self) {
        // Detach; the thread exits at its next poll
        self.cancel();
    }
}

fn drain<R: Read + AsRawFd>(
    mut pipe: R,
    buffer: OutputBuffer,
    cancel: Arc<AtomicBool>,
) -> io::Result<DrainOutcome> {
    let mut chunk = [0u8; DRAIN_CHUNK];

    loop {
        if cancel.load(Ordering::SeqCst) {
            return Ok(DrainOutcome::Cancelled);
        }

        if !poll_readable(pipe.as_raw_fd(), DRAIN_POLL)? {
            continue;
        }

        match pipe.read(&mut chunk) {
            Ok(0) => return Ok(DrainOutcome::Eof),
            Ok(n) => {
                trace!(bytes = n, "drained");
                buffer.append(&chunk[..n]);
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {}
            Err(e) => return Err(e),
        }
    }
}

fn poll_readable(fd: std::os::fd::RawFd, timeout: Duration) -> io::Result<bool> {
    use libc::{poll, pollfd, POLLIN};

    let mut pfd = pollfd {
        fd,
        events: POLLIN,
        revents: 0,
    };

    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout.as_millis() as i32) };

    if result < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }

    // POLLHUP/POLLERR also wake us; the following read reports them
    Ok(result > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    #[test]
    fn test_buffer_snapshot() {
        let buffer = OutputBuffer::new();
        assert!(buffer.is_empty());

        buffer.append(b"hello ");
        buffer.append(b"world");

        assert_eq!(buffer.snapshot(), "hello world");
        assert_eq!(buffer.len(), 11);
        assert!(buffer.contains("lo wo"));
    }

    #[test]
    fn test_buffer_split_utf8() {
        let buffer = OutputBuffer::new();
        let bytes = "héllo".as_bytes();

        // Split inside the two-byte 'é'
        buffer.append(&bytes[..2]);
        buffer.append(&bytes[2..]);

        assert_eq!(buffer.snapshot(), "héllo");
    }

    #[test]
    fn test_drain_to_eof() {
        let mut child = Command::new("/bin/sh")
            .args(["-c", "echo one; echo two"])
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();

        let buffer = OutputBuffer::new();
        let stdout = child.stdout.take().unwrap();
        let mut task = DrainTask::spawn(OutputStream::Stdout, stdout, buffer.clone()).unwrap();

        child.wait().unwrap();
        let outcome = task.finish(Duration::from_secs(5)).unwrap();

        assert_eq!(outcome, DrainOutcome::Eof);
        assert_eq!(buffer.snapshot(), "one\ntwo\n");
    }

    #[test]
    fn test_drain_cancelled() {
        let mut child = Command::new("/bin/sh")
            .args(["-c", "echo started; sleep 5"])
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();

        let buffer = OutputBuffer::new();
        let stdout = child.stdout.take().unwrap();
        let mut task = DrainTask::spawn(OutputStream::Stdout, stdout, buffer.clone()).unwrap();

        assert!(buffer.wait_for("started", Duration::from_secs(5)));

        let begin = Instant::now();
        let outcome = task.finish(Duration::from_millis(0)).unwrap();
        assert_eq!(outcome, DrainOutcome::Cancelled);
        assert!(begin.elapsed() < Duration::from_secs(2));

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_stream_display() {
        assert_eq!(OutputStream::Stdout.to_string(), "stdout");
        assert_eq!(OutputStream::Stderr.to_string(), "stderr");
    }
}
