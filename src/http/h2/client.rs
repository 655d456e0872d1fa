//! Blocking HTTP/2 test client
//!
//! One connection, one request in flight at a time. Every response carries
//! the ordered list of engine events seen while waiting for it, so tests can
//! assert on protocol-level behaviour as well as on status and body.

use super::connection::{ConnectionState, H2Connection};
use super::error::{Error, ErrorCode, Result};
use super::events::Event;
use super::response::{H2Response, RequestStream};
use super::settings::SettingsBuilder;
use super::stream::StreamId;
use crate::http::tls::TlsConfig;
use crate::http::{self, HttpSession, SessionOps, Transport};
use crate::net;
use std::io;
use std::net::IpAddr;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Bytes requested from the transport per read
pub const DEFAULT_READ_CHUNK: usize = 64 * 1024;

/// HTTP/2 client over any [`SessionOps`] transport
pub struct H2Client<S: SessionOps = Transport> {
    session: HttpSession<S>,
    conn: H2Connection,
    authority: String,
    scheme: String,
    read_buf: Vec<u8>,
    close_grace: Duration,
    alpn: Option<String>,
}

impl H2Client<Transport> {
    /// Connect with default settings. With `use_tls` the handshake must
    /// negotiate `h2` over ALPN.
    pub fn connect(host: &str, port: u16, use_tls: bool) -> Result<Self> {
        H2ClientBuilder::new().connect(host, port, use_tls)
    }
}

impl<S: SessionOps> H2Client<S> {
    /// Protocol engine state
    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// The engine itself, for inspecting windows and settings
    pub fn connection(&self) -> &H2Connection {
        &self.conn
    }

    /// ALPN protocol negotiated by the transport
    pub fn alpn(&self) -> Option<&str> {
        self.alpn.as_deref()
    }

    pub fn session(&self) -> &HttpSession<S> {
        &self.session
    }

    /// Id the next request will use
    pub fn next_stream_id(&self) -> Result<StreamId> {
        self.conn.get_next_available_stream_id()
    }

    /// GET `path`
    pub fn get(&mut self, path: &str) -> Result<H2Response> {
        self.request("GET", path, &[])
    }

    /// HEAD `path`
    pub fn head(&mut self, path: &str) -> Result<H2Response> {
        self.request("HEAD", path, &[])
    }

    /// Send `method path` with the usual pseudo-headers followed by `extra`
    pub fn request(&mut self, method: &str, path: &str, extra: &[(&str, &str)]) -> Result<H2Response> {
        let authority = self.authority.clone();
        let scheme = self.scheme.clone();
        let mut headers = vec![
            (":method", method),
            (":path", path),
            (":authority", authority.as_str()),
            (":scheme", scheme.as_str()),
        ];
        headers.extend_from_slice(extra);
        self.send_request(&headers)
    }

    /// Send a complete header list on the next stream id and wait for the
    /// stream to end
    pub fn send_request(&mut self, headers: &[(&str, &str)]) -> Result<H2Response> {
        let stream_id = self.conn.get_next_available_stream_id()?;
        self.send_request_on(stream_id, headers)
    }

    /// Like [`send_request`](Self::send_request) on an explicit stream id.
    /// Ids that are even or not above every id used so far are refused
    /// with [`Error::InvalidStreamId`].
    pub fn send_request_on(&mut self, stream_id: StreamId, headers: &[(&str, &str)]) -> Result<H2Response> {
        let result = self.exchange(stream_id, headers);
        self.conn.forget_closed_streams();
        result
    }

    fn exchange(&mut self, stream_id: StreamId, headers: &[(&str, &str)]) -> Result<H2Response> {
        self.conn.send_headers(stream_id, headers, true)?;
        self.flush()?;
        debug!(stream_id, "request sent");

        let mut stream = RequestStream::new(stream_id, headers);
        while !stream.is_ended() {
            let events = match self.read_events() {
                Ok(Some(events)) => events,
                Ok(None) => {
                    return Err(Error::PrematureClose {
                        stream_id,
                        events: stream.into_events(),
                    })
                }
                Err(Error::Http(http::Error::Timeout)) => {
                    return Err(Error::ReadTimeout {
                        stream_id,
                        events: stream.into_events(),
                    })
                }
                Err(err) => return Err(err),
            };

            for event in events {
                if let Event::DataReceived {
                    stream_id: data_stream,
                    flow_controlled_length,
                    ..
                } = &event
                {
                    self.conn.acknowledge_received_data(*flow_controlled_length, *data_stream)?;
                }

                let failure = match &event {
                    Event::StreamReset {
                        stream_id: reset,
                        error_code,
                    } if *reset == stream_id => Some((true, *error_code, 0)),
                    Event::ConnectionTerminated {
                        error_code,
                        last_stream_id,
                        ..
                    } if *error_code != ErrorCode::NoError.as_u32() || *last_stream_id < stream_id => {
                        Some((false, *error_code, *last_stream_id))
                    }
                    _ => None,
                };
                stream.record(event);

                if let Some((reset, error_code, last_stream_id)) = failure {
                    let events = stream.into_events();
                    return Err(if reset {
                        Error::StreamReset {
                            stream_id,
                            error_code,
                            events,
                        }
                    } else {
                        Error::ConnectionTerminated {
                            last_stream_id,
                            error_code,
                            events,
                        }
                    });
                }
            }
            self.flush()?;
        }

        let response = stream.into_response()?;
        debug!(stream_id, status = response.status(), body = response.body().len(), "response complete");
        Ok(response)
    }

    /// Send a PING and collect events until its ACK arrives
    pub fn ping(&mut self, data: [u8; 8]) -> Result<Vec<Event>> {
        self.conn.ping(data)?;
        self.flush()?;

        let mut seen = Vec::new();
        loop {
            let events = self.read_events()?.ok_or(Error::PrematureClose {
                stream_id: 0,
                events: Vec::new(),
            })?;
            self.flush()?;
            let acked = events
                .iter()
                .any(|event| matches!(event, Event::PingAckReceived { data: echoed } if *echoed == data));
            seen.extend(events);
            if acked {
                return Ok(seen);
            }
        }
    }

    /// One read's worth of events; `None` when the peer closed the transport
    ///
    /// Data is not acknowledged here; callers decide when to return credit.
    pub fn next_events(&mut self) -> Result<Option<Vec<Event>>> {
        let events = self.read_events()?;
        self.flush()?;
        Ok(events)
    }

    /// GOAWAY, flush, close the transport and give the server a moment to
    /// observe the disconnect
    pub fn close(&mut self) -> Result<()> {
        if self.conn.state() == ConnectionState::Closed {
            return Ok(());
        }
        if self.conn.close_connection(ErrorCode::NoError).is_ok() {
            // The server may already have dropped the connection
            if let Err(err) = self.flush() {
                debug!(error = %err, "GOAWAY not delivered");
            }
        }
        let closed = self.session.close();
        thread::sleep(self.close_grace);
        self.conn.mark_closed();
        info!("HTTP/2 connection closed");
        closed.map_err(Error::from)
    }

    /// Write everything the engine has queued
    fn flush(&mut self) -> Result<()> {
        if self.conn.has_data_to_send() {
            let data = self.conn.data_to_send();
            self.session.write_all(&data)?;
        }
        Ok(())
    }

    fn read_events(&mut self) -> Result<Option<Vec<Event>>> {
        let n = match self.session.read(&mut self.read_buf) {
            Ok(n) => n,
            Err(http::Error::Io(e)) if is_disconnect(&e) => 0,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            debug!("transport closed by peer");
            return Ok(None);
        }

        match self.conn.receive_data(&self.read_buf[..n]) {
            Ok(events) => Ok(Some(events)),
            Err(err) => {
                // Push out the GOAWAY the engine queued, if the peer still listens
                if let Err(flush_err) = self.flush() {
                    debug!(error = %flush_err, "GOAWAY after protocol error not delivered");
                }
                Err(err)
            }
        }
    }
}

/// Errors that mean the peer went away rather than that something broke
fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    ) || err.to_string().contains("unexpected eof")
}

/// Builder for [`H2Client`]
pub struct H2ClientBuilder {
    settings: SettingsBuilder,
    read_chunk: usize,
    read_timeout: Duration,
    connect_timeout: Duration,
    close_grace: Duration,
    authority: Option<String>,
    scheme: String,
    servername: Option<String>,
}

impl H2ClientBuilder {
    /// Push disabled, 64 KiB reads, 10 s read timeout, 5 s connect timeout
    /// and a 50 ms grace period after close
    pub fn new() -> Self {
        H2ClientBuilder {
            settings: SettingsBuilder::new().enable_push(false),
            read_chunk: DEFAULT_READ_CHUNK,
            read_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            close_grace: Duration::from_millis(50),
            authority: None,
            scheme: "https".to_string(),
            servername: None,
        }
    }

    /// Set header table size
    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings = self.settings.header_table_size(size);
        self
    }

    /// Set initial window size
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings = self.settings.initial_window_size(size);
        self
    }

    /// Set max frame size
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings = self.settings.max_frame_size(size);
        self
    }

    /// Set max concurrent streams
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings = self.settings.max_concurrent_streams(max);
        self
    }

    pub fn read_chunk(mut self, size: usize) -> Self {
        self.read_chunk = size.max(1);
        self
    }

    /// Upper bound on each wait for server bytes
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    /// `:authority` value, `localhost` by default
    pub fn authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    /// `:scheme` value, `https` by default
    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// SNI name; defaults to the host unless it is an IP address
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.servername = Some(name.into());
        self
    }

    /// Open the transport to `host:port` and start the connection
    pub fn connect(self, host: &str, port: u16, use_tls: bool) -> Result<H2Client<Transport>> {
        let addr = net::resolve(host, port)?;

        let tls = if use_tls {
            let servername = self
                .servername
                .clone()
                .or_else(|| host.parse::<IpAddr>().is_err().then(|| host.to_string()));
            let config = match servername {
                Some(name) => TlsConfig::h2_client(&name)?,
                None => TlsConfig::client()?.alpn(&["h2"])?.build()?,
            };
            Some(config)
        } else {
            None
        };

        let transport = Transport::connect(addr, tls.as_ref(), self.connect_timeout)?;
        let alpn = transport.alpn().map(str::to_string);
        if use_tls && alpn.as_deref() != Some("h2") {
            return Err(Error::AlpnFailed(alpn));
        }
        transport.set_io_timeout(Some(self.read_timeout))?;
        info!(%addr, tls = use_tls, ?alpn, "HTTP/2 transport connected");

        let mut client = self.handshake(transport)?;
        client.alpn = alpn;
        Ok(client)
    }

    /// Start HTTP/2 on an already established transport: write the preface
    /// and our SETTINGS. The server's SETTINGS are processed with the first
    /// response.
    pub fn handshake<S: SessionOps>(self, transport: S) -> Result<H2Client<S>> {
        let mut conn = H2Connection::new(self.settings.build()?);
        conn.initiate_connection()?;

        let mut session = HttpSession::new(transport);
        session.set_timeout(Some(self.read_timeout));

        let mut client = H2Client {
            session,
            conn,
            authority: self.authority.unwrap_or_else(|| "localhost".to_string()),
            scheme: self.scheme,
            read_buf: vec![0u8; self.read_chunk],
            close_grace: self.close_grace,
            alpn: None,
        };
        client.flush()?;
        Ok(client)
    }
}

impl Default for H2ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
