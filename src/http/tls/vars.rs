//! Negotiated TLS parameters

use openssl::ssl::{NameType, SslRef};

/// What a handshake settled on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsVars {
    /// Protocol version, e.g. `TLSv1.3`
    pub version: String,
    pub cipher: Option<String>,
    /// SNI name (as sent by the client or received by the server)
    pub servername: Option<String>,
    /// Selected ALPN protocol
    pub alpn: Option<String>,
}

impl TlsVars {
    /// Read the negotiated parameters off a completed handshake
    pub fn from_ssl(ssl: &SslRef) -> Self {
        TlsVars {
            version: ssl.version_str().to_string(),
            cipher: ssl.current_cipher().map(|c| c.name().to_string()),
            servername: ssl.servername(NameType::HOST_NAME).map(str::to_string),
            alpn: ssl
                .selected_alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
        }
    }

    /// True if the peers agreed on HTTP/2
    pub fn is_h2(&self) -> bool {
        self.alpn.as_deref() == Some("h2")
    }
}
