//! Events produced by the HTTP/2 engine
//!
//! `H2Connection::receive_data` turns raw bytes into an ordered list of
//! these. Callers match on them instead of inspecting frames.

use super::settings::Settings;
use bytes::Bytes;

/// One thing the peer did
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// First complete header block on a stream (may be informational 1xx)
    ResponseReceived {
        stream_id: u32,
        headers: Vec<(String, String)>,
    },
    /// Header block after the response headers
    TrailersReceived {
        stream_id: u32,
        headers: Vec<(String, String)>,
    },
    /// Body bytes. `flow_controlled_length` includes padding and is what
    /// must be acknowledged.
    DataReceived {
        stream_id: u32,
        data: Bytes,
        flow_controlled_length: usize,
    },
    /// The peer set END_STREAM
    StreamEnded { stream_id: u32 },
    /// The peer sent RST_STREAM
    StreamReset { stream_id: u32, error_code: u32 },
    /// The peer sent (non-ACK) SETTINGS; `changed` holds only what it sent
    RemoteSettingsChanged { changed: Settings },
    /// The peer acknowledged our SETTINGS
    SettingsAcknowledged,
    /// The peer pinged us; the ACK is already queued
    PingReceived { data: [u8; 8] },
    /// The peer answered our PING
    PingAckReceived { data: [u8; 8] },
    /// WINDOW_UPDATE on a stream, or the connection when `stream_id` is 0
    WindowUpdated { stream_id: u32, delta: u32 },
    /// The peer sent GOAWAY
    ConnectionTerminated {
        error_code: u32,
        last_stream_id: u32,
        additional_data: Bytes,
    },
}

impl Event {
    /// Stream the event belongs to, `None` for connection-level events
    pub fn stream_id(&self) -> Option<u32> {
        match self {
            Event::ResponseReceived { stream_id, .. }
            | Event::TrailersReceived { stream_id, .. }
            | Event::DataReceived { stream_id, .. }
            | Event::StreamEnded { stream_id }
            | Event::StreamReset { stream_id, .. } => Some(*stream_id),
            Event::WindowUpdated { stream_id, .. } if *stream_id != 0 => Some(*stream_id),
            _ => None,
        }
    }

    /// Short name for logs and assertions
    pub fn name(&self) -> &'static str {
        match self {
            Event::ResponseReceived { .. } => "ResponseReceived",
            Event::TrailersReceived { .. } => "TrailersReceived",
            Event::DataReceived { .. } => "DataReceived",
            Event::StreamEnded { .. } => "StreamEnded",
            Event::StreamReset { .. } => "StreamReset",
            Event::RemoteSettingsChanged { .. } => "RemoteSettingsChanged",
            Event::SettingsAcknowledged => "SettingsAcknowledged",
            Event::PingReceived { .. } => "PingReceived",
            Event::PingAckReceived { .. } => "PingAckReceived",
            Event::WindowUpdated { .. } => "WindowUpdated",
            Event::ConnectionTerminated { .. } => "ConnectionTerminated",
        }
    }
}
