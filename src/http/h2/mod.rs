//! HTTP/2 client engine for driving a server under test
//!
//! The layers, bottom up:
//!
//! - [`frames`] / [`codec`]: RFC 7540 frame types and their wire encoding,
//!   with incremental decoding of partial reads
//! - [`settings`], [`flow_control`], [`stream`]: connection parameters,
//!   windows and client stream ids
//! - [`connection`]: `H2Connection`, a sans-I/O engine turning received
//!   bytes into [`Event`]s and queueing the frames to send back
//! - [`client`]: `H2Client`, one request at a time over a real transport
//!
//! The client is deliberately minimal: requests carry no body, push is
//! disabled, and every received DATA frame is acknowledged as soon as it
//! is seen so the server never stalls on flow control.
//!
//! # Examples
//!
//! ```no_run
//! use ion_harness::http::h2::H2ClientBuilder;
//! use std::time::Duration;
//!
//! let mut client = H2ClientBuilder::new()
//!     .read_timeout(Duration::from_secs(2))
//!     .connect("127.0.0.1", 8443, true)?;
//!
//! for _ in 0..10 {
//!     let response = client.get("/_tests/ok")?;
//!     assert_eq!(response.status(), 200);
//! }
//! client.close()?;
//! # Ok::<(), ion_harness::http::h2::Error>(())
//! ```

pub mod client;
pub mod codec;
pub mod connection;
pub mod error;
pub mod events;
pub mod flow_control;
pub mod frames;
pub mod response;
pub mod settings;
pub mod stream;

pub use client::{H2Client, H2ClientBuilder};
pub use connection::{ConnectionState, H2Connection};
pub use error::{Error, ErrorCode, Result};
pub use events::Event;
pub use frames::{Frame, FrameFlags, FrameType};
pub use response::{H2Response, RequestStream};
pub use settings::{Settings, SettingsBuilder};
pub use stream::{StreamId, StreamState};

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 7540 Section 3.5:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFFFFFF;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;
