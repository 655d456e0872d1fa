//! Client-side HTTP/2 protocol engine
//!
//! `H2Connection` does no I/O. Callers feed it the bytes they read with
//! [`H2Connection::receive_data`], act on the [`Event`]s it returns, and
//! write out whatever [`H2Connection::data_to_send`] hands back. Frames the
//! protocol requires in reply (SETTINGS ACK, PING ACK, RST_STREAM for
//! closed streams) are queued automatically; flow control credit is only
//! returned when the caller acknowledges data.

use super::codec::FrameCodec;
use super::error::{Error, ErrorCode, Result};
use super::events::Event;
use super::flow_control::FlowControl;
use super::frames::*;
use super::settings::Settings;
use super::stream::{StreamId, StreamManager};
use super::{CONNECTION_PREFACE, CONNECTION_STREAM_ID, DEFAULT_INITIAL_WINDOW_SIZE};
use bytes::{Bytes, BytesMut};
use std::fmt;
use tracing::{debug, trace, warn};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    /// Preface and SETTINGS queued, server SETTINGS not yet seen
    ConnectionInitiated,
    Active,
    /// GOAWAY sent or received
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::ConnectionInitiated => "connection-initiated",
            ConnectionState::Active => "active",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Header block still waiting for CONTINUATION frames
struct PendingHeaders {
    stream_id: StreamId,
    end_stream: bool,
    block: BytesMut,
}

/// Sans-I/O client connection
pub struct H2Connection {
    state: ConnectionState,
    local_settings: Settings,
    remote_settings: Settings,
    remote_settings_received: bool,
    codec: FrameCodec,
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
    streams: StreamManager,
    flow: FlowControl,
    pending_headers: Option<PendingHeaders>,
    outbound: BytesMut,
}

impl H2Connection {
    /// Engine announcing `local_settings` in its preface
    pub fn new(local_settings: Settings) -> Self {
        let mut codec = FrameCodec::new();
        codec.set_max_frame_size(local_settings.get_max_frame_size());

        H2Connection {
            state: ConnectionState::Idle,
            local_settings,
            remote_settings: Settings::new(),
            remote_settings_received: false,
            codec,
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
            streams: StreamManager::new(),
            flow: FlowControl::new(DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_INITIAL_WINDOW_SIZE),
            pending_headers: None,
            outbound: BytesMut::with_capacity(4096),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn local_settings(&self) -> &Settings {
        &self.local_settings
    }

    /// Everything the server has announced so far
    pub fn remote_settings(&self) -> &Settings {
        &self.remote_settings
    }

    /// Connection-level windows
    pub fn flow(&self) -> &FlowControl {
        &self.flow
    }

    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    /// Queue the client preface followed by our SETTINGS
    pub fn initiate_connection(&mut self) -> Result<()> {
        if self.state != ConnectionState::Idle {
            return Err(Error::InvalidState(format!(
                "Connection already initiated ({})",
                self.state
            )));
        }
        self.outbound.extend_from_slice(CONNECTION_PREFACE);
        FrameCodec::encode_settings(&mut self.outbound, &SettingsFrame::new(self.local_settings.clone()));
        self.state = ConnectionState::ConnectionInitiated;
        debug!(settings = ?self.local_settings.entries(), "HTTP/2 preface queued");
        Ok(())
    }

    /// Lowest stream id a new request may use
    pub fn get_next_available_stream_id(&self) -> Result<StreamId> {
        self.streams.next_stream_id()
    }

    /// Open `stream_id` with a request header block
    ///
    /// Pseudo-headers must come first; names must be lowercase. The block
    /// is split into CONTINUATION frames when it exceeds the server's
    /// SETTINGS_MAX_FRAME_SIZE.
    pub fn send_headers(&mut self, stream_id: StreamId, headers: &[(&str, &str)], end_stream: bool) -> Result<()> {
        self.ensure_open()?;

        for (name, _) in headers {
            if name.is_empty() || name.bytes().any(|b| b.is_ascii_uppercase()) {
                return Err(Error::InvalidHeader(format!(
                    "Header name {:?} must be non-empty lowercase",
                    name
                )));
            }
        }

        let send_window = self.remote_settings.get_initial_window_size();
        let recv_window = self.local_settings.get_initial_window_size();
        self.streams
            .open(stream_id, send_window, recv_window)?
            .send_headers(end_stream)?;

        let block = self
            .encoder
            .encode(headers.iter().map(|(name, value)| (name.as_bytes(), value.as_bytes())));
        FrameCodec::encode_header_block(
            &mut self.outbound,
            stream_id,
            Bytes::from(block),
            end_stream,
            self.remote_settings.get_max_frame_size() as usize,
        );

        trace!(stream_id, end_stream, count = headers.len(), "HEADERS queued");
        Ok(())
    }

    /// Feed bytes read from the transport, get back what the server did
    ///
    /// On a connection error a GOAWAY carrying the matching code is queued
    /// before the error is returned.
    pub fn receive_data(&mut self, data: &[u8]) -> Result<Vec<Event>> {
        if matches!(self.state, ConnectionState::Idle | ConnectionState::Closed) {
            return Err(Error::InvalidState(format!("Cannot receive data while {}", self.state)));
        }

        let mut events = Vec::new();
        if let Err(err) = self.receive_frames(data, &mut events) {
            if let Some(code) = Self::goaway_code(&err) {
                warn!(error = %err, "HTTP/2 connection error, sending GOAWAY {}", code);
                self.queue_goaway(code);
            }
            return Err(err);
        }
        Ok(events)
    }

    /// Return `acknowledged_size` bytes of credit for DATA received on
    /// `stream_id`. The stream window is only refreshed while the server
    /// can still send on the stream.
    pub fn acknowledge_received_data(&mut self, acknowledged_size: usize, stream_id: StreamId) -> Result<()> {
        if acknowledged_size == 0 {
            return Ok(());
        }
        let increment = u32::try_from(acknowledged_size)
            .map_err(|_| Error::FlowControl(format!("Cannot acknowledge {} bytes at once", acknowledged_size)))?;

        self.flow.recv.increase(increment)?;
        FrameCodec::encode_window_update(
            &mut self.outbound,
            &WindowUpdateFrame::new(CONNECTION_STREAM_ID, increment),
        );

        if let Some(stream) = self.streams.get_mut(stream_id) {
            if stream.state().can_receive() {
                stream.flow_mut().recv.increase(increment)?;
                FrameCodec::encode_window_update(&mut self.outbound, &WindowUpdateFrame::new(stream_id, increment));
            }
        }
        Ok(())
    }

    /// Queue a PING; the answer arrives as [`Event::PingAckReceived`]
    pub fn ping(&mut self, data: [u8; 8]) -> Result<()> {
        self.ensure_open()?;
        FrameCodec::encode_ping(&mut self.outbound, &PingFrame::new(data));
        Ok(())
    }

    /// Drop the state of finished streams. Late frames for them are still
    /// recognised through the highest id used.
    pub fn forget_closed_streams(&mut self) {
        self.streams.cleanup_closed();
    }

    /// Streams the engine still holds state for, closed ones included
    pub fn tracked_streams(&self) -> usize {
        self.streams.len()
    }

    /// Queue GOAWAY and stop accepting new streams
    pub fn close_connection(&mut self, error_code: ErrorCode) -> Result<()> {
        if matches!(self.state, ConnectionState::Idle | ConnectionState::Closed) {
            return Err(Error::InvalidState(format!("Cannot close a connection that is {}", self.state)));
        }
        self.queue_goaway(error_code);
        Ok(())
    }

    /// The transport is gone
    pub fn mark_closed(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Drain the queued outbound bytes
    pub fn data_to_send(&mut self) -> Bytes {
        self.outbound.split().freeze()
    }

    pub fn has_data_to_send(&self) -> bool {
        !self.outbound.is_empty()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            ConnectionState::ConnectionInitiated | ConnectionState::Active => Ok(()),
            state => Err(Error::InvalidState(format!("Connection is {}", state))),
        }
    }

    fn queue_goaway(&mut self, error_code: ErrorCode) {
        // No server-initiated streams are ever accepted
        FrameCodec::encode_goaway(&mut self.outbound, &GoawayFrame::new(0, error_code, Bytes::new()));
        self.state = ConnectionState::Closing;
    }

    fn goaway_code(err: &Error) -> Option<ErrorCode> {
        match err {
            Error::Protocol(_) | Error::InvalidSettings(_) => Some(ErrorCode::ProtocolError),
            Error::FlowControl(_) => Some(ErrorCode::FlowControlError),
            Error::FrameSize(_) => Some(ErrorCode::FrameSizeError),
            Error::Compression(_) => Some(ErrorCode::CompressionError),
            _ => None,
        }
    }

    fn receive_frames(&mut self, data: &[u8], events: &mut Vec<Event>) -> Result<()> {
        for frame in self.codec.decode(data)? {
            self.handle_frame(frame, events)?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame, events: &mut Vec<Event>) -> Result<()> {
        let frame_type = match frame.frame_type() {
            Some(frame_type) => frame_type,
            None if self.pending_headers.is_none() => {
                trace!(raw_type = frame.raw_type, "Ignoring unknown frame type");
                return Ok(());
            }
            None => {
                return Err(Error::Protocol(format!(
                    "Frame type 0x{:x} interrupts a header block",
                    frame.raw_type
                )))
            }
        };
        trace!(frame = %frame_type, stream_id = frame.stream_id, len = frame.payload_len(), "frame received");

        if let Some(pending) = &self.pending_headers {
            if frame_type != FrameType::Continuation || frame.stream_id != pending.stream_id {
                return Err(Error::Protocol(format!(
                    "Expected CONTINUATION on stream {}, got {}",
                    pending.stream_id, frame_type
                )));
            }
        }

        if !self.remote_settings_received && (frame_type != FrameType::Settings || frame.flags.is_ack()) {
            return Err(Error::Protocol(format!(
                "Server preface must start with SETTINGS, got {}",
                frame_type
            )));
        }

        let connection_frame = matches!(
            frame_type,
            FrameType::Settings | FrameType::Ping | FrameType::Goaway
        );
        let stream_frame = matches!(
            frame_type,
            FrameType::Data
                | FrameType::Headers
                | FrameType::Priority
                | FrameType::RstStream
                | FrameType::PushPromise
                | FrameType::Continuation
        );
        if connection_frame && frame.stream_id != CONNECTION_STREAM_ID {
            return Err(Error::Protocol(format!("{} on stream {}", frame_type, frame.stream_id)));
        }
        if stream_frame && frame.stream_id == CONNECTION_STREAM_ID {
            return Err(Error::Protocol(format!("{} on stream 0", frame_type)));
        }

        match frame_type {
            FrameType::Data => self.handle_data(frame, events),
            FrameType::Headers => {
                let fragment = frame.header_fragment()?;
                let end_stream = frame.flags.is_end_stream();
                if frame.flags.is_end_headers() {
                    self.handle_header_block(frame.stream_id, &fragment, end_stream, events)
                } else {
                    self.pending_headers = Some(PendingHeaders {
                        stream_id: frame.stream_id,
                        end_stream,
                        block: BytesMut::from(&fragment[..]),
                    });
                    Ok(())
                }
            }
            FrameType::Continuation => {
                let mut pending = self
                    .pending_headers
                    .take()
                    .ok_or_else(|| Error::Protocol("CONTINUATION without HEADERS".to_string()))?;
                pending.block.extend_from_slice(&frame.payload);
                if frame.flags.is_end_headers() {
                    self.handle_header_block(pending.stream_id, &pending.block, pending.end_stream, events)
                } else {
                    self.pending_headers = Some(pending);
                    Ok(())
                }
            }
            FrameType::Priority => Ok(()),
            FrameType::RstStream => {
                let error_code = frame.rst_error_code()?;
                self.check_not_idle(frame.stream_id, frame_type)?;
                if let Some(stream) = self.streams.get_mut(frame.stream_id) {
                    stream.reset();
                    debug!(stream_id = frame.stream_id, "Stream reset by peer: {}", ErrorCode::describe(error_code));
                    events.push(Event::StreamReset {
                        stream_id: frame.stream_id,
                        error_code,
                    });
                }
                Ok(())
            }
            FrameType::Settings => self.handle_settings(frame, events),
            FrameType::PushPromise => Err(Error::Protocol("PUSH_PROMISE received with push disabled".to_string())),
            FrameType::Ping => {
                let data = frame.ping_data()?;
                if frame.flags.is_ack() {
                    events.push(Event::PingAckReceived { data });
                } else {
                    FrameCodec::encode_ping(&mut self.outbound, &PingFrame::ack(data));
                    events.push(Event::PingReceived { data });
                }
                Ok(())
            }
            FrameType::Goaway => {
                let (last_stream_id, error_code, additional_data) = frame.goaway()?;
                debug!(last_stream_id, "GOAWAY received: {}", ErrorCode::describe(error_code));
                if self.state != ConnectionState::Closed {
                    self.state = ConnectionState::Closing;
                }
                events.push(Event::ConnectionTerminated {
                    error_code,
                    last_stream_id,
                    additional_data,
                });
                Ok(())
            }
            FrameType::WindowUpdate => {
                let delta = frame.window_increment()?;
                if delta == 0 {
                    return Err(Error::Protocol(format!(
                        "WINDOW_UPDATE of 0 on stream {}",
                        frame.stream_id
                    )));
                }
                if frame.stream_id == CONNECTION_STREAM_ID {
                    self.flow.send.increase(delta)?;
                } else if let Some(stream) = self.streams.get_mut(frame.stream_id) {
                    stream.flow_mut().send.increase(delta)?;
                }
                events.push(Event::WindowUpdated {
                    stream_id: frame.stream_id,
                    delta,
                });
                Ok(())
            }
        }
    }

    /// Frames naming a stream we never opened are a connection error
    fn check_not_idle(&self, stream_id: StreamId, frame_type: FrameType) -> Result<()> {
        if stream_id > self.streams.highest_id() || stream_id % 2 == 0 {
            return Err(Error::Protocol(format!("{} on idle stream {}", frame_type, stream_id)));
        }
        Ok(())
    }

    fn can_receive(&self, stream_id: StreamId) -> bool {
        self.streams
            .get(stream_id)
            .map_or(false, |stream| stream.state().can_receive())
    }

    /// Tell the server a closed stream is closed
    fn refuse_closed(&mut self, stream_id: StreamId) {
        trace!(stream_id, "frame on closed stream, sending RST_STREAM");
        FrameCodec::encode_rst_stream(
            &mut self.outbound,
            &RstStreamFrame {
                stream_id,
                error_code: ErrorCode::StreamClosed,
            },
        );
    }

    fn handle_data(&mut self, frame: Frame, events: &mut Vec<Event>) -> Result<()> {
        let stream_id = frame.stream_id;
        let flow_controlled_length = frame.payload_len();
        self.check_not_idle(stream_id, FrameType::Data)?;
        self.flow.recv.consume(flow_controlled_length)?;
        let data = frame.unpadded()?;

        if !self.can_receive(stream_id) {
            // Nobody will acknowledge this, so give the credit back now
            if let Ok(increment) = u32::try_from(flow_controlled_length) {
                if increment > 0 {
                    self.flow.recv.increase(increment)?;
                    FrameCodec::encode_window_update(
                        &mut self.outbound,
                        &WindowUpdateFrame::new(CONNECTION_STREAM_ID, increment),
                    );
                }
            }
            self.refuse_closed(stream_id);
            return Ok(());
        }

        let Some(stream) = self.streams.get_mut(stream_id) else {
            return Ok(());
        };
        stream.flow_mut().recv.consume(flow_controlled_length)?;
        events.push(Event::DataReceived {
            stream_id,
            data,
            flow_controlled_length,
        });
        if frame.flags.is_end_stream() {
            stream.end_remote();
            events.push(Event::StreamEnded { stream_id });
        }
        Ok(())
    }

    fn handle_header_block(
        &mut self,
        stream_id: StreamId,
        block: &[u8],
        end_stream: bool,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        // Decode even for dead streams so the HPACK table stays in sync
        let headers: Vec<(String, String)> = self
            .decoder
            .decode(block)
            .map_err(|e| Error::Compression(format!("HPACK decode error: {:?}", e)))?
            .into_iter()
            .map(|(name, value)| {
                (
                    String::from_utf8_lossy(&name).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                )
            })
            .collect();

        self.check_not_idle(stream_id, FrameType::Headers)?;
        if !self.can_receive(stream_id) {
            self.refuse_closed(stream_id);
            return Ok(());
        }
        let Some(stream) = self.streams.get_mut(stream_id) else {
            return Ok(());
        };

        if stream.response_received() {
            if !end_stream {
                return Err(Error::Protocol(format!(
                    "Trailers on stream {} without END_STREAM",
                    stream_id
                )));
            }
            events.push(Event::TrailersReceived { stream_id, headers });
        } else {
            let informational = headers
                .iter()
                .find(|(name, _)| name == ":status")
                .map_or(false, |(_, value)| value.starts_with('1'));
            if !informational {
                stream.set_response_received();
            }
            events.push(Event::ResponseReceived { stream_id, headers });
        }

        if end_stream {
            stream.end_remote();
            events.push(Event::StreamEnded { stream_id });
        }
        Ok(())
    }

    fn handle_settings(&mut self, frame: Frame, events: &mut Vec<Event>) -> Result<()> {
        if frame.flags.is_ack() {
            if frame.payload_len() != 0 {
                return Err(Error::FrameSize("SETTINGS ACK with a payload".to_string()));
            }
            events.push(Event::SettingsAcknowledged);
            return Ok(());
        }

        let changed = Settings::from_entries(&frame.settings_entries()?)?;
        changed.validate()?;

        if let Some(size) = changed.initial_window_size {
            for stream in self.streams.iter_mut() {
                stream.flow_mut().send.update_initial_size(size)?;
            }
        }
        self.remote_settings.merge(&changed);
        FrameCodec::encode_settings(&mut self.outbound, &SettingsFrame::ack());

        if !self.remote_settings_received {
            self.remote_settings_received = true;
            if self.state == ConnectionState::ConnectionInitiated {
                self.state = ConnectionState::Active;
            }
            debug!(settings = ?changed.entries(), "Server preface received");
        }
        events.push(Event::RemoteSettingsChanged { changed });
        Ok(())
    }
}

impl fmt::Debug for H2Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("H2Connection")
            .field("state", &self.state)
            .field("remote_settings", &self.remote_settings)
            .field("streams", &self.streams.active_count())
            .field("outbound", &self.outbound.len())
            .finish()
    }
}
