//! TLS transport for HTTP/2 connections
//!
//! `TlsConfig` builds an OpenSSL context for either side of a connection and
//! `TlsSessionOps` implements [`SessionOps`](crate::http::SessionOps) over the
//! resulting `SslStream`, so the HTTP/2 client is oblivious to encryption.
//!
//! The client side never verifies the peer: the server under test runs with
//! self-signed material. The server side exists for in-process test peers
//! and falls back to a built-in certificate.
//!
//! # Examples
//!
//! ```no_run
//! use ion_harness::http::tls::TlsConfig;
//! use std::net::TcpStream;
//!
//! let config = TlsConfig::client()?
//!     .servername("localhost")
//!     .alpn(&["h2"])?
//!     .build()?;
//!
//! let tcp = TcpStream::connect("127.0.0.1:8443")?;
//! let session = config.connect(tcp)?;
//! assert_eq!(session.vars().alpn.as_deref(), Some("h2"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod builtin_cert;
pub mod config;
pub mod session;
pub mod vars;

pub use config::{ClientConfigBuilder, ServerConfigBuilder, TlsConfig, TlsError, TlsVersion};
pub use session::TlsSessionOps;
pub use vars::TlsVars;

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
