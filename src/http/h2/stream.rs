//! HTTP/2 stream management
//!
//! Client side only: streams are opened by our HEADERS, carry odd ids
//! that strictly increase, and are never reused on a connection.

use super::error::{Error, Result};
use super::flow_control::FlowControl;
use super::MAX_STREAM_ID;
use std::collections::HashMap;

/// Stream ID type
pub type StreamId = u32;

/// Stream state as defined in RFC 7540 Section 5.1 (without the push states)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    /// We sent END_STREAM, the peer may still send
    HalfClosedLocal,
    /// The peer sent END_STREAM
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    /// Check if the peer may still send frames on the stream
    pub fn can_receive(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

/// One stream as the engine tracks it
#[derive(Debug)]
pub struct H2Stream {
    id: StreamId,
    state: StreamState,
    flow: FlowControl,
    /// A final (non-1xx) response header block arrived
    response_received: bool,
}

impl H2Stream {
    pub fn new(id: StreamId, send_window: u32, recv_window: u32) -> Self {
        H2Stream {
            id,
            state: StreamState::Idle,
            flow: FlowControl::new(send_window, recv_window),
            response_received: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn flow(&self) -> &FlowControl {
        &self.flow
    }

    pub fn flow_mut(&mut self) -> &mut FlowControl {
        &mut self.flow
    }

    pub fn response_received(&self) -> bool {
        self.response_received
    }

    pub fn set_response_received(&mut self) {
        self.response_received = true;
    }

    /// Our HEADERS went out
    pub fn send_headers(&mut self, end_stream: bool) -> Result<()> {
        self.state = match (self.state, end_stream) {
            (StreamState::Idle, false) => StreamState::Open,
            (StreamState::Idle, true) | (StreamState::Open, true) => StreamState::HalfClosedLocal,
            (StreamState::Open, false) => StreamState::Open,
            (StreamState::HalfClosedRemote, true) => StreamState::Closed,
            (state, _) => {
                return Err(Error::InvalidState(format!(
                    "Cannot send HEADERS on stream {} in state {:?}",
                    self.id, state
                )))
            }
        };
        Ok(())
    }

    /// The peer set END_STREAM
    pub fn end_remote(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            _ => StreamState::Closed,
        };
    }

    /// RST_STREAM sent or received
    pub fn reset(&mut self) {
        self.state = StreamState::Closed;
    }
}

/// All streams of one connection
#[derive(Debug, Default)]
pub struct StreamManager {
    streams: HashMap<StreamId, H2Stream>,
    /// Highest id opened so far, 0 before the first stream
    highest_id: StreamId,
}

impl StreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowest id a new stream may use: 1, 3, 5, ...
    pub fn next_stream_id(&self) -> Result<StreamId> {
        let next = if self.highest_id == 0 { 1 } else { self.highest_id + 2 };
        if next > MAX_STREAM_ID {
            return Err(Error::StreamIdsExhausted);
        }
        Ok(next)
    }

    pub fn highest_id(&self) -> StreamId {
        self.highest_id
    }

    /// Open a client stream. Even, reused or decreasing ids are refused.
    pub fn open(&mut self, id: StreamId, send_window: u32, recv_window: u32) -> Result<&mut H2Stream> {
        if id % 2 == 0 || id <= self.highest_id || id > MAX_STREAM_ID {
            return Err(Error::InvalidStreamId(id));
        }
        self.highest_id = id;
        Ok(self
            .streams
            .entry(id)
            .or_insert_with(|| H2Stream::new(id, send_window, recv_window)))
    }

    pub fn get(&self, id: StreamId) -> Option<&H2Stream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut H2Stream> {
        self.streams.get_mut(&id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut H2Stream> {
        self.streams.values_mut()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.streams.values().filter(|s| !s.state().is_closed()).count()
    }

    /// Forget closed streams
    pub fn cleanup_closed(&mut self) {
        self.streams.retain(|_, stream| !stream.state().is_closed());
    }
}
