//! HTTP transport and protocol layers
//!
//! - [`session`]: the `SessionOps` abstraction with poll-based timeouts
//! - [`tls`]: OpenSSL client/server configuration and sessions
//! - [`transport`]: runtime choice between cleartext and TLS
//! - [`h2`]: the HTTP/2 engine and test client
//!
//! # Examples
//!
//! ```no_run
//! use ion_harness::http::h2::H2Client;
//!
//! let mut client = H2Client::connect("localhost", 8443, true)?;
//! let response = client.get("/_tests/ok")?;
//! assert_eq!(response.status(), 200);
//! client.close()?;
//! # Ok::<(), ion_harness::http::h2::Error>(())
//! ```

pub mod h2;
pub mod session;
pub mod tls;
pub mod transport;

pub use session::{FdSessionOps, HttpSession, PollEvents, SessionOps};
pub use transport::Transport;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] crate::net::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] tls::TlsError),

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,
}
