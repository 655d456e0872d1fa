//! HTTP/2 error types
//!
//! `Error` covers everything the engine and client can fail with;
//! `ErrorCode` is the RFC 7540 Section 7 wire code carried by RST_STREAM
//! and GOAWAY.

use super::events::Event;
use std::fmt;

/// HTTP/2 errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Http(#[from] crate::http::Error),

    #[error("Network error: {0}")]
    Network(#[from] crate::net::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] crate::http::tls::TlsError),

    /// The peer sent something RFC 7540 forbids
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The connection hit EOF before the stream ended
    #[error("Connection closed before stream {stream_id} ended ({} events observed)", events.len())]
    PrematureClose { stream_id: u32, events: Vec<Event> },

    /// The peer reset the stream we were waiting on
    #[error("Stream {stream_id} reset by peer: {}", ErrorCode::describe(*error_code))]
    StreamReset {
        stream_id: u32,
        error_code: u32,
        events: Vec<Event>,
    },

    /// GOAWAY arrived and our stream will not be completed
    #[error("Connection terminated by peer (last stream {last_stream_id}): {}", ErrorCode::describe(*error_code))]
    ConnectionTerminated {
        last_stream_id: u32,
        error_code: u32,
        events: Vec<Event>,
    },

    /// No bytes arrived within the read timeout
    #[error("Timed out waiting for stream {stream_id} ({} events observed)", events.len())]
    ReadTimeout { stream_id: u32, events: Vec<Event> },

    #[error("Flow control error: {0}")]
    FlowControl(String),

    #[error("Frame size error: {0}")]
    FrameSize(String),

    #[error("Compression error: {0}")]
    Compression(String),

    /// Client-side misuse: ids must be odd and strictly increasing
    #[error("Invalid stream ID {0}: client stream ids must be odd and increasing")]
    InvalidStreamId(u32),

    #[error("Stream ids exhausted")]
    StreamIdsExhausted,

    #[error("Invalid connection state: {0}")]
    InvalidState(String),

    #[error("ALPN negotiation failed: expected h2, got {0:?}")]
    AlpnFailed(Option<String>),

    #[error("Invalid settings value: {0}")]
    InvalidSettings(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),
}

impl Error {
    /// True for failures caused by the peer's behaviour on the wire, as
    /// opposed to local misuse or setup problems
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::PrematureClose { .. }
                | Error::StreamReset { .. }
                | Error::ConnectionTerminated { .. }
                | Error::FlowControl(_)
                | Error::FrameSize(_)
                | Error::Compression(_)
        )
    }

    /// Events observed before the failure, when the error carries them
    pub fn events(&self) -> Option<&[Event]> {
        match self {
            Error::PrematureClose { events, .. }
            | Error::StreamReset { events, .. }
            | Error::ConnectionTerminated { events, .. }
            | Error::ReadTimeout { events, .. } => Some(events),
            _ => None,
        }
    }
}

/// HTTP/2 error codes (RFC 7540 Section 7)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Wire value
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Known code for a wire value
    pub fn from_u32(code: u32) -> Option<Self> {
        use ErrorCode::*;
        const ALL: [ErrorCode; 14] = [
            NoError,
            ProtocolError,
            InternalError,
            FlowControlError,
            SettingsTimeout,
            StreamClosed,
            FrameSizeError,
            RefusedStream,
            Cancel,
            CompressionError,
            ConnectError,
            EnhanceYourCalm,
            InadequateSecurity,
            Http11Required,
        ];
        ALL.get(code as usize).copied()
    }

    /// RFC name, e.g. `PROTOCOL_ERROR`
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }

    /// Readable form of any wire value, known or not
    pub fn describe(code: u32) -> String {
        match ErrorCode::from_u32(code) {
            Some(known) => known.to_string(),
            None => format!("UNKNOWN (0x{:x})", code),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

/// Result type for HTTP/2 operations
pub type Result<T> = std::result::Result<T, Error>;
