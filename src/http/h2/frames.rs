//! Frame types (RFC 7540 Section 6)
//!
//! Inbound frames are kept raw (`Frame`) and interpreted on demand by the
//! `Frame::*` accessors; outbound frames are built from the typed structs
//! and serialized by `FrameCodec`.

use super::error::{Error, ErrorCode, Result};
use super::settings::Settings;
use bytes::Bytes;
use std::fmt;

/// Frame type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    Goaway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

impl FrameType {
    /// Wire value
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Known type for a wire value; extension frames yield `None`
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(FrameType::Data),
            0x1 => Some(FrameType::Headers),
            0x2 => Some(FrameType::Priority),
            0x3 => Some(FrameType::RstStream),
            0x4 => Some(FrameType::Settings),
            0x5 => Some(FrameType::PushPromise),
            0x6 => Some(FrameType::Ping),
            0x7 => Some(FrameType::Goaway),
            0x8 => Some(FrameType::WindowUpdate),
            0x9 => Some(FrameType::Continuation),
            _ => None,
        }
    }

    /// RFC name
    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Data => "DATA",
            FrameType::Headers => "HEADERS",
            FrameType::Priority => "PRIORITY",
            FrameType::RstStream => "RST_STREAM",
            FrameType::Settings => "SETTINGS",
            FrameType::PushPromise => "PUSH_PROMISE",
            FrameType::Ping => "PING",
            FrameType::Goaway => "GOAWAY",
            FrameType::WindowUpdate => "WINDOW_UPDATE",
            FrameType::Continuation => "CONTINUATION",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u8())
    }
}

/// Frame flags byte
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const END_STREAM: u8 = 0x1;
    /// Same bit as END_STREAM, used by SETTINGS and PING
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;

    pub fn empty() -> Self {
        FrameFlags(0)
    }

    pub fn from_u8(flags: u8) -> Self {
        FrameFlags(flags)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    /// Set `flag` if `on`
    pub fn with(mut self, flag: u8, on: bool) -> Self {
        if on {
            self.set(flag);
        }
        self
    }

    pub fn is_set(&self, flag: u8) -> bool {
        (self.0 & flag) != 0
    }

    pub fn is_end_stream(&self) -> bool {
        self.is_set(Self::END_STREAM)
    }

    pub fn is_ack(&self) -> bool {
        self.is_set(Self::ACK)
    }

    pub fn is_end_headers(&self) -> bool {
        self.is_set(Self::END_HEADERS)
    }

    pub fn is_padded(&self) -> bool {
        self.is_set(Self::PADDED)
    }

    pub fn is_priority(&self) -> bool {
        self.is_set(Self::PRIORITY)
    }
}

/// A decoded frame with its payload still raw
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Wire type byte (may be an extension type)
    pub raw_type: u8,
    pub flags: FrameFlags,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, flags: FrameFlags, stream_id: u32, payload: Bytes) -> Self {
        Frame {
            raw_type: frame_type.as_u8(),
            flags,
            stream_id,
            payload,
        }
    }

    /// Known frame type, `None` for extension frames
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.raw_type)
    }

    /// Payload length as counted against flow control
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Payload with padding removed (DATA, HEADERS, PUSH_PROMISE)
    pub fn unpadded(&self) -> Result<Bytes> {
        if !self.flags.is_padded() {
            return Ok(self.payload.clone());
        }
        let pad_len = *self
            .payload
            .first()
            .ok_or_else(|| Error::FrameSize("PADDED frame without pad length".into()))?
            as usize;
        let end = self
            .payload
            .len()
            .checked_sub(pad_len)
            .filter(|&end| end >= 1)
            .ok_or_else(|| Error::Protocol(format!("padding {} exceeds payload", pad_len)))?;
        Ok(self.payload.slice(1..end))
    }

    /// Header block fragment of a HEADERS frame (padding and priority removed)
    pub fn header_fragment(&self) -> Result<Bytes> {
        let body = self.unpadded()?;
        if self.flags.is_priority() {
            if body.len() < 5 {
                return Err(Error::FrameSize("HEADERS priority block truncated".into()));
            }
            return Ok(body.slice(5..));
        }
        Ok(body)
    }

    /// SETTINGS entries as `(identifier, value)` pairs
    pub fn settings_entries(&self) -> Result<Vec<(u16, u32)>> {
        if self.payload.len() % 6 != 0 {
            return Err(Error::FrameSize(format!(
                "SETTINGS payload length {} is not a multiple of 6",
                self.payload.len()
            )));
        }
        Ok(self
            .payload
            .chunks_exact(6)
            .map(|c| {
                (
                    u16::from_be_bytes([c[0], c[1]]),
                    u32::from_be_bytes([c[2], c[3], c[4], c[5]]),
                )
            })
            .collect())
    }

    /// Opaque PING data
    pub fn ping_data(&self) -> Result<[u8; 8]> {
        self.payload[..]
            .try_into()
            .map_err(|_| Error::FrameSize(format!("PING payload is {} bytes", self.payload.len())))
    }

    fn fixed_u32(&self, what: &str) -> Result<u32> {
        let bytes: [u8; 4] = self.payload[..]
            .try_into()
            .map_err(|_| Error::FrameSize(format!("{} payload is {} bytes", what, self.payload.len())))?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// WINDOW_UPDATE increment (reserved bit cleared)
    pub fn window_increment(&self) -> Result<u32> {
        Ok(self.fixed_u32("WINDOW_UPDATE")? & 0x7FFF_FFFF)
    }

    /// RST_STREAM error code
    pub fn rst_error_code(&self) -> Result<u32> {
        self.fixed_u32("RST_STREAM")
    }

    /// GOAWAY fields: last stream id, error code, debug data
    pub fn goaway(&self) -> Result<(u32, u32, Bytes)> {
        if self.payload.len() < 8 {
            return Err(Error::FrameSize(format!(
                "GOAWAY payload is {} bytes",
                self.payload.len()
            )));
        }
        let p = &self.payload;
        let last = u32::from_be_bytes([p[0], p[1], p[2], p[3]]) & 0x7FFF_FFFF;
        let code = u32::from_be_bytes([p[4], p[5], p[6], p[7]]);
        Ok((last, code, self.payload.slice(8..)))
    }
}

/// Outbound DATA
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub stream_id: u32,
    pub data: Bytes,
    pub end_stream: bool,
    pub padding: Option<u8>,
}

impl DataFrame {
    pub fn new(stream_id: u32, data: Bytes, end_stream: bool) -> Self {
        DataFrame {
            stream_id,
            data,
            end_stream,
            padding: None,
        }
    }

    pub fn with_padding(mut self, padding: u8) -> Self {
        self.padding = Some(padding);
        self
    }

    /// Bytes this frame charges against flow control
    pub fn flow_controlled_len(&self) -> usize {
        self.data.len() + self.padding.map_or(0, |p| 1 + p as usize)
    }
}

/// Outbound HEADERS (one fragment)
#[derive(Debug, Clone)]
pub struct HeadersFrame {
    pub stream_id: u32,
    pub header_block: Bytes,
    pub end_stream: bool,
    pub end_headers: bool,
    pub padding: Option<u8>,
}

impl HeadersFrame {
    pub fn new(stream_id: u32, header_block: Bytes, end_stream: bool, end_headers: bool) -> Self {
        HeadersFrame {
            stream_id,
            header_block,
            end_stream,
            end_headers,
            padding: None,
        }
    }

    pub fn with_padding(mut self, padding: u8) -> Self {
        self.padding = Some(padding);
        self
    }
}

/// Outbound CONTINUATION
#[derive(Debug, Clone)]
pub struct ContinuationFrame {
    pub stream_id: u32,
    pub header_block: Bytes,
    pub end_headers: bool,
}

/// Outbound SETTINGS
#[derive(Debug, Clone)]
pub struct SettingsFrame {
    pub ack: bool,
    pub settings: Settings,
}

impl SettingsFrame {
    pub fn new(settings: Settings) -> Self {
        SettingsFrame {
            ack: false,
            settings,
        }
    }

    pub fn ack() -> Self {
        SettingsFrame {
            ack: true,
            settings: Settings::default(),
        }
    }
}

/// Outbound PING
#[derive(Debug, Clone, Copy)]
pub struct PingFrame {
    pub ack: bool,
    pub data: [u8; 8],
}

impl PingFrame {
    pub fn new(data: [u8; 8]) -> Self {
        PingFrame { ack: false, data }
    }

    pub fn ack(data: [u8; 8]) -> Self {
        PingFrame { ack: true, data }
    }
}

/// Outbound GOAWAY
#[derive(Debug, Clone)]
pub struct GoawayFrame {
    pub last_stream_id: u32,
    pub error_code: ErrorCode,
    pub debug_data: Bytes,
}

impl GoawayFrame {
    pub fn new(last_stream_id: u32, error_code: ErrorCode, debug_data: Bytes) -> Self {
        GoawayFrame {
            last_stream_id,
            error_code,
            debug_data,
        }
    }
}

/// Outbound WINDOW_UPDATE (stream 0 = connection)
#[derive(Debug, Clone, Copy)]
pub struct WindowUpdateFrame {
    pub stream_id: u32,
    pub size_increment: u32,
}

impl WindowUpdateFrame {
    pub fn new(stream_id: u32, size_increment: u32) -> Self {
        WindowUpdateFrame {
            stream_id,
            size_increment,
        }
    }
}

/// Outbound RST_STREAM
#[derive(Debug, Clone, Copy)]
pub struct RstStreamFrame {
    pub stream_id: u32,
    pub error_code: ErrorCode,
}
