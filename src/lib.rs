//! ion-harness - HTTP/2 server test harness
//!
//! This crate supervises an externally built HTTP/2 server binary as a child
//! process and speaks HTTP/2 to it at the frame level, so tests can reach
//! behaviors ordinary clients hide: connection-slot exhaustion, flow control,
//! slow clients and raw frame sequencing.
//!
//! - [`process`] starts, readiness-gates and stops the server under test.
//! - [`http::h2`] is the low-level HTTP/2 test client and protocol engine.
//! - [`probe`] holds many raw connections open to count connection slots.
//! - [`net`] has the port readiness probe and socket helpers.
//! - [`access_log`] parses the server's Combined Log Format lines.

pub mod access_log;
pub mod http;
pub mod net;
pub mod probe;
pub mod process;
