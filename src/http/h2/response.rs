//! Per-request stream state and the finished response

use super::error::{Error, Result};
use super::events::Event;
use super::stream::StreamId;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;

/// What the client knows about one request while it is in flight
#[derive(Debug)]
pub struct RequestStream {
    id: StreamId,
    request_headers: Vec<(String, String)>,
    response_headers: Option<Vec<(String, String)>>,
    trailers: Vec<(String, String)>,
    body: BytesMut,
    ended: bool,
    events: Vec<Event>,
}

impl RequestStream {
    pub fn new(id: StreamId, request_headers: &[(&str, &str)]) -> Self {
        RequestStream {
            id,
            request_headers: request_headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            response_headers: None,
            trailers: Vec::new(),
            body: BytesMut::new(),
            ended: false,
            events: Vec::new(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn request_headers(&self) -> &[(String, String)] {
        &self.request_headers
    }

    /// END_STREAM seen
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Record one engine event. Every event is logged; only those for this
    /// stream change its state. A later header block replaces an earlier
    /// informational one.
    pub fn record(&mut self, event: Event) {
        match &event {
            Event::ResponseReceived { stream_id, headers } if *stream_id == self.id => {
                self.response_headers = Some(headers.clone());
            }
            Event::TrailersReceived { stream_id, headers } if *stream_id == self.id => {
                self.trailers = headers.clone();
            }
            Event::DataReceived { stream_id, data, .. } if *stream_id == self.id => {
                self.body.extend_from_slice(data);
            }
            Event::StreamEnded { stream_id } if *stream_id == self.id => {
                self.ended = true;
            }
            _ => {}
        }
        self.events.push(event);
    }

    /// Give up the event log, for error reporting
    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    /// Freeze into a response; the stream must have ended with a `:status`
    pub fn into_response(self) -> Result<H2Response> {
        let headers = match self.response_headers {
            Some(headers) => headers,
            None => {
                return Err(Error::Protocol(format!(
                    "Stream {} ended without response headers",
                    self.id
                )))
            }
        };

        let status = headers
            .iter()
            .find(|(name, _)| name == ":status")
            .and_then(|(_, value)| value.parse::<u16>().ok())
            .filter(|status| (100..1000).contains(status))
            .ok_or_else(|| Error::Protocol(format!("Stream {} has no valid :status", self.id)))?;

        Ok(H2Response {
            stream_id: self.id,
            status,
            headers: header_map(&headers),
            trailers: header_map(&self.trailers),
            body: self.body.freeze(),
            events: self.events,
        })
    }
}

/// Regular fields only; repeated names are joined with ", "
fn header_map(fields: &[(String, String)]) -> HashMap<String, String> {
    let mut map: HashMap<String, String> = HashMap::new();
    for (name, value) in fields.iter().filter(|(name, _)| !name.starts_with(':')) {
        map.entry(name.clone())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.clone());
    }
    map
}

/// A completed response
#[derive(Debug, Clone)]
pub struct H2Response {
    stream_id: StreamId,
    status: u16,
    headers: HashMap<String, String>,
    trailers: HashMap<String, String>,
    body: Bytes,
    events: Vec<Event>,
}

impl H2Response {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Header value by lowercase name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn trailers(&self) -> &HashMap<String, String> {
        &self.trailers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_bytes(&self) -> Bytes {
        self.body.clone()
    }

    /// Body as UTF-8
    pub fn body_str(&self) -> std::result::Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.body)
    }

    /// Every event observed while the request was in flight, in order
    pub fn events(&self) -> &[Event] {
        &self.events
    }
}
