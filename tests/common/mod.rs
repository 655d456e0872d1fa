//! Shared fixtures for the integration tests
//!
//! `PeerServer` is a scripted HTTP/2 server assembled from the crate's own
//! frame codec and an HPACK encoder. It answers a fixed set of paths,
//! honours the client's flow-control windows and can cap the number of
//! connections it holds at once, which is all the client and probe tests
//! need from a server.

#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use ion_harness::http::h2::codec::FrameCodec;
use ion_harness::http::h2::frames::{
    DataFrame, GoawayFrame, PingFrame, RstStreamFrame, SettingsFrame,
};
use ion_harness::http::h2::{
    ErrorCode, Frame, FrameType, Settings, CONNECTION_PREFACE, DEFAULT_INITIAL_WINDOW_SIZE,
    DEFAULT_MAX_FRAME_SIZE,
};
use ion_harness::http::tls::TlsConfig;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Body size served by `/medium`
pub const MEDIUM_BODY: usize = 128 * 1024;

/// Body size served by `/large`
pub const LARGE_BODY: usize = 2 * 1024 * 1024;

/// Route logs through the test writer; `RUST_LOG` picks the level
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A port nothing is listening on (at the time of the call)
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Deterministic body content of `len` bytes
pub fn body_of(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Poll `condition` until it holds or `timeout` passes
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Builder for [`PeerServer`]
pub struct PeerBuilder {
    tls: bool,
    connection_limit: Option<usize>,
    idle_timeout: Duration,
    settings_delay: Duration,
}

impl PeerBuilder {
    /// Serve cleartext HTTP/2 (prior knowledge) instead of TLS
    pub fn cleartext(mut self) -> Self {
        self.tls = false;
        self
    }

    /// Close connections beyond `limit` right after accepting them
    pub fn connection_limit(mut self, limit: usize) -> Self {
        self.connection_limit = Some(limit);
        self
    }

    /// Drop a connection that stays silent this long
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Wait this long after the preface before sending SETTINGS
    pub fn settings_delay(mut self, delay: Duration) -> Self {
        self.settings_delay = delay;
        self
    }

    pub fn spawn(self) -> PeerServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let active = Arc::new(AtomicUsize::new(0));
        let accepted = Arc::new(AtomicUsize::new(0));

        let tls = self.tls.then(|| {
            TlsConfig::server()
                .unwrap()
                .alpn(&["h2"])
                .unwrap()
                .build()
                .unwrap()
        });

        let (limit, idle, delay) = (self.connection_limit, self.idle_timeout, self.settings_delay);
        let (active_count, accepted_count) = (Arc::clone(&active), Arc::clone(&accepted));
        thread::spawn(move || {
            for incoming in listener.incoming() {
                let Ok(tcp) = incoming else { continue };
                if limit.map_or(false, |limit| active_count.load(Ordering::SeqCst) >= limit) {
                    drop(tcp);
                    continue;
                }
                active_count.fetch_add(1, Ordering::SeqCst);
                accepted_count.fetch_add(1, Ordering::SeqCst);

                let slot = Slot(Arc::clone(&active_count));
                let tls = tls.clone();
                thread::spawn(move || {
                    let _slot = slot;
                    let _ = tcp.set_read_timeout(Some(idle));
                    let result = match tls {
                        Some(config) => match config.accept(tcp) {
                            Ok(session) => PeerConnection::new(session.into_stream(), delay).run(),
                            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
                        },
                        None => PeerConnection::new(tcp, delay).run(),
                    };
                    if let Err(e) = result {
                        tracing::debug!(error = %e, "peer connection ended");
                    }
                });
            }
        });

        PeerServer {
            port,
            active,
            accepted,
        }
    }
}

/// Releases a connection slot when the handler thread ends
struct Slot(Arc<AtomicUsize>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scripted HTTP/2 server running on background threads
///
/// Routes:
/// - `/ok`: 200 with body `ok`
/// - `/empty`: 204 without a body
/// - `/medium`, `/large`: 200 with [`MEDIUM_BODY`] / [`LARGE_BODY`] bytes of [`body_of`]
/// - `/trailers`: 200, body `ok`, then a trailer block carrying `x-checksum`
/// - `/reset`: RST_STREAM(INTERNAL_ERROR)
/// - `/goaway`: GOAWAY naming an earlier stream, then close
/// - `/drop`: close the connection without answering
/// - `/stall`: never answer
/// - anything else: 404
pub struct PeerServer {
    port: u16,
    active: Arc<AtomicUsize>,
    accepted: Arc<AtomicUsize>,
}

impl PeerServer {
    pub fn builder() -> PeerBuilder {
        PeerBuilder {
            tls: true,
            connection_limit: None,
            idle_timeout: Duration::from_secs(30),
            settings_delay: Duration::ZERO,
        }
    }

    /// TLS peer without limits
    pub fn spawn() -> PeerServer {
        Self::builder().spawn()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Connections currently held
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Connections accepted so far (refused ones excluded)
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

enum Reply {
    Respond {
        status: u16,
        body: Vec<u8>,
        trailers: bool,
    },
    Reset(ErrorCode),
    GoAway,
    Drop,
    Stall,
}

fn reply_for(path: &str) -> Reply {
    let respond = |status, body: Vec<u8>| Reply::Respond {
        status,
        body,
        trailers: false,
    };
    match path {
        "/ok" => respond(200, b"ok".to_vec()),
        "/empty" => respond(204, Vec::new()),
        "/medium" => respond(200, body_of(MEDIUM_BODY)),
        "/large" => respond(200, body_of(LARGE_BODY)),
        "/trailers" => Reply::Respond {
            status: 200,
            body: b"ok".to_vec(),
            trailers: true,
        },
        "/reset" => Reply::Reset(ErrorCode::InternalError),
        "/goaway" => Reply::GoAway,
        "/drop" => Reply::Drop,
        "/stall" => Reply::Stall,
        _ => respond(404, b"not found".to_vec()),
    }
}

fn invalid(message: impl ToString) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

struct PeerConnection<S> {
    io: S,
    codec: FrameCodec,
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
    read_buf: Vec<u8>,
    pending: VecDeque<Frame>,
    deferred: VecDeque<Frame>,
    header_block: Option<(u32, BytesMut)>,
    send_window: i64,
    initial_window: i64,
    stream_windows: HashMap<u32, i64>,
    settings_delay: Duration,
}

impl<S: Read + Write> PeerConnection<S> {
    fn new(io: S, settings_delay: Duration) -> Self {
        PeerConnection {
            io,
            codec: FrameCodec::new(),
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
            read_buf: vec![0u8; 16 * 1024],
            pending: VecDeque::new(),
            deferred: VecDeque::new(),
            header_block: None,
            send_window: DEFAULT_INITIAL_WINDOW_SIZE as i64,
            initial_window: DEFAULT_INITIAL_WINDOW_SIZE as i64,
            stream_windows: HashMap::new(),
            settings_delay,
        }
    }

    fn run(mut self) -> io::Result<()> {
        let mut preface = [0u8; 24];
        self.io.read_exact(&mut preface)?;
        if preface != CONNECTION_PREFACE {
            return Err(invalid("bad connection preface"));
        }
        thread::sleep(self.settings_delay);

        let settings = Settings {
            max_concurrent_streams: Some(100),
            ..Settings::new()
        };
        self.write(|dst| FrameCodec::encode_settings(dst, &SettingsFrame::new(settings)))?;

        loop {
            let frame = match self.deferred.pop_front() {
                Some(frame) => frame,
                None => match self.next_frame()? {
                    Some(frame) => frame,
                    None => return Ok(()),
                },
            };

            if self.handle_control(&frame)? {
                continue;
            }

            let block = match frame.frame_type() {
                Some(FrameType::Headers) => {
                    let fragment = frame.header_fragment().map_err(invalid)?;
                    if frame.flags.is_end_headers() {
                        Some((frame.stream_id, fragment))
                    } else {
                        self.header_block = Some((frame.stream_id, BytesMut::from(&fragment[..])));
                        None
                    }
                }
                Some(FrameType::Continuation) => {
                    let (stream_id, mut block) = self
                        .header_block
                        .take()
                        .ok_or_else(|| invalid("CONTINUATION without HEADERS"))?;
                    block.extend_from_slice(&frame.payload);
                    if frame.flags.is_end_headers() {
                        Some((stream_id, block.freeze()))
                    } else {
                        self.header_block = Some((stream_id, block));
                        None
                    }
                }
                Some(FrameType::Goaway) => return Ok(()),
                _ => None,
            };

            if let Some((stream_id, block)) = block {
                if !self.answer(stream_id, &block)? {
                    return Ok(());
                }
            }
        }
    }

    /// SETTINGS, WINDOW_UPDATE and PING; returns false for anything else
    fn handle_control(&mut self, frame: &Frame) -> io::Result<bool> {
        match frame.frame_type() {
            Some(FrameType::Settings) => {
                if !frame.flags.is_ack() {
                    for (id, value) in frame.settings_entries().map_err(invalid)? {
                        // SETTINGS_INITIAL_WINDOW_SIZE
                        if id == 0x4 {
                            let delta = value as i64 - self.initial_window;
                            self.stream_windows.values_mut().for_each(|w| *w += delta);
                            self.initial_window = value as i64;
                        }
                    }
                    self.write(|dst| FrameCodec::encode_settings(dst, &SettingsFrame::ack()))?;
                }
                Ok(true)
            }
            Some(FrameType::WindowUpdate) => {
                let increment = frame.window_increment().map_err(invalid)? as i64;
                if frame.stream_id == 0 {
                    self.send_window += increment;
                } else {
                    let initial = self.initial_window;
                    *self.stream_windows.entry(frame.stream_id).or_insert(initial) += increment;
                }
                Ok(true)
            }
            Some(FrameType::Ping) => {
                if !frame.flags.is_ack() {
                    let data = frame.ping_data().map_err(invalid)?;
                    self.write(|dst| FrameCodec::encode_ping(dst, &PingFrame::ack(data)))?;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Respond to one request; false means the connection should close
    fn answer(&mut self, stream_id: u32, block: &[u8]) -> io::Result<bool> {
        let headers = self
            .decoder
            .decode(block)
            .map_err(|e| invalid(format!("HPACK: {:?}", e)))?;
        let pseudo = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| n.as_slice() == name.as_bytes())
                .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default()
        };
        let (method, path) = (pseudo(":method"), pseudo(":path"));
        tracing::debug!(stream_id, %method, %path, "peer request");

        match reply_for(&path) {
            Reply::Respond {
                status,
                body,
                trailers,
            } => {
                self.respond(stream_id, status, &body, method == "HEAD", trailers)?;
                Ok(true)
            }
            Reply::Reset(code) => {
                let frame = RstStreamFrame {
                    stream_id,
                    error_code: code,
                };
                self.write(|dst| FrameCodec::encode_rst_stream(dst, &frame))?;
                Ok(true)
            }
            Reply::GoAway => {
                let frame = GoawayFrame::new(
                    stream_id.saturating_sub(2),
                    ErrorCode::NoError,
                    Bytes::from_static(b"shutting down"),
                );
                self.write(|dst| FrameCodec::encode_goaway(dst, &frame))?;
                Ok(false)
            }
            Reply::Drop => Ok(false),
            Reply::Stall => Ok(true),
        }
    }

    fn respond(
        &mut self,
        stream_id: u32,
        status: u16,
        body: &[u8],
        head: bool,
        trailers: bool,
    ) -> io::Result<()> {
        let status = status.to_string();
        let length = body.len().to_string();
        let block = self.encoder.encode(vec![
            (&b":status"[..], status.as_bytes()),
            (&b"server"[..], &b"ion-peer"[..]),
            (&b"content-length"[..], length.as_bytes()),
        ]);

        let headers_only = head || (body.is_empty() && !trailers);
        self.write(|dst| {
            FrameCodec::encode_header_block(
                dst,
                stream_id,
                Bytes::from(block),
                headers_only,
                DEFAULT_MAX_FRAME_SIZE as usize,
            )
        })?;
        if headers_only {
            return Ok(());
        }

        self.send_body(stream_id, body, !trailers)?;

        if trailers {
            let checksum = body.len().to_string();
            let block = self
                .encoder
                .encode(vec![(&b"x-checksum"[..], checksum.as_bytes())]);
            self.write(|dst| {
                FrameCodec::encode_header_block(
                    dst,
                    stream_id,
                    Bytes::from(block),
                    true,
                    DEFAULT_MAX_FRAME_SIZE as usize,
                )
            })?;
        }
        Ok(())
    }

    /// DATA frames within both windows, blocking on WINDOW_UPDATE when
    /// either is exhausted
    fn send_body(&mut self, stream_id: u32, body: &[u8], end_stream: bool) -> io::Result<()> {
        let initial = self.initial_window;
        let mut offset = 0;
        while offset < body.len() {
            let stream_window = *self.stream_windows.entry(stream_id).or_insert(initial);
            let window = self.send_window.min(stream_window);
            if window <= 0 {
                self.await_window_update()?;
                continue;
            }

            let len = (window as usize)
                .min(DEFAULT_MAX_FRAME_SIZE as usize)
                .min(body.len() - offset);
            let last = offset + len == body.len();
            let frame = DataFrame::new(
                stream_id,
                Bytes::copy_from_slice(&body[offset..offset + len]),
                end_stream && last,
            );
            self.write(|dst| FrameCodec::encode_data(dst, &frame))?;

            self.send_window -= len as i64;
            if let Some(w) = self.stream_windows.get_mut(&stream_id) {
                *w -= len as i64;
            }
            offset += len;
        }
        Ok(())
    }

    fn await_window_update(&mut self) -> io::Result<()> {
        let frame = self
            .next_frame()?
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        if !self.handle_control(&frame)? {
            self.deferred.push_back(frame);
        }
        Ok(())
    }

    fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            let n = self.io.read(&mut self.read_buf)?;
            if n == 0 {
                return Ok(None);
            }
            let frames = self.codec.decode(&self.read_buf[..n]).map_err(invalid)?;
            self.pending.extend(frames);
        }
    }

    fn write(&mut self, encode: impl FnOnce(&mut BytesMut)) -> io::Result<()> {
        let mut dst = BytesMut::new();
        encode(&mut dst);
        self.io.write_all(&dst)?;
        self.io.flush()
    }
}

/// Raw TCP connection to `port` on the loopback interface
pub fn tcp_to(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port)).unwrap()
}
