//! TLS configuration builders

use openssl::pkey::PKey;
use openssl::ssl::{AlpnError, SslContext, SslContextBuilder, SslMethod, SslVerifyMode};
use openssl::x509::X509;
use std::fs;
use std::net::TcpStream;
use std::path::Path;

/// TLS protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    /// Parse a version name such as `TLSv1.3` (case-insensitive)
    pub fn parse(s: &str) -> Result<Self, TlsError> {
        match s.to_uppercase().as_str() {
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }

    fn to_openssl(self) -> openssl::ssl::SslVersion {
        match self {
            TlsVersion::Tls12 => openssl::ssl::SslVersion::TLS1_2,
            TlsVersion::Tls13 => openssl::ssl::SslVersion::TLS1_3,
        }
    }

    /// Version name as OpenSSL reports it
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    /// The handshake itself failed; the OpenSSL error is kept intact so
    /// callers can tell a refused connection from a broken one.
    #[error("Handshake failed: {0}")]
    Handshake(#[source] openssl::ssl::Error),
}

/// Encode protocol names in ALPN wire format (length-prefixed)
fn encode_alpn(protocols: &[&str]) -> Result<Vec<u8>, TlsError> {
    let mut wire = Vec::new();
    for proto in protocols {
        let len = u8::try_from(proto.len())
            .map_err(|_| TlsError::InvalidConfig(format!("ALPN protocol too long: {}", proto)))?;
        if len == 0 {
            return Err(TlsError::InvalidConfig("empty ALPN protocol".to_string()));
        }
        wire.push(len);
        wire.extend_from_slice(proto.as_bytes());
    }
    Ok(wire)
}

/// Pick the first client protocol we also support
fn select_alpn<'a>(ours: &[Vec<u8>], client_protos: &'a [u8]) -> Option<&'a [u8]> {
    let mut pos = 0;
    while pos < client_protos.len() {
        let len = client_protos[pos] as usize;
        pos += 1;
        let proto = client_protos.get(pos..pos + len)?;
        if ours.iter().any(|p| p.as_slice() == proto) {
            return Some(proto);
        }
        pos += len;
    }
    None
}

/// Immutable TLS configuration
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) ctx: SslContext,
    pub(crate) is_server: bool,
    pub(crate) servername: Option<String>,
}

impl TlsConfig {
    /// Client configuration builder (peer verification off)
    pub fn client() -> Result<ClientConfigBuilder, TlsError> {
        ClientConfigBuilder::new()
    }

    /// Server configuration builder
    pub fn server() -> Result<ServerConfigBuilder, TlsError> {
        ServerConfigBuilder::new()
    }

    /// Client configuration for talking to an HTTP/2 server: ALPN `h2`,
    /// SNI `servername`, no verification.
    pub fn h2_client(servername: &str) -> Result<TlsConfig, TlsError> {
        TlsConfig::client()?
            .servername(servername)
            .alpn(&["h2"])?
            .build()
    }

    /// SNI name sent by a client configuration
    pub fn servername(&self) -> Option<&str> {
        self.servername.as_deref()
    }

    /// Client handshake over `stream`
    pub fn connect(&self, stream: TcpStream) -> Result<super::TlsSessionOps, TlsError> {
        if self.is_server {
            return Err(TlsError::InvalidConfig(
                "Cannot use server config for client connection".to_string(),
            ));
        }
        super::session::TlsSessionOps::connect(stream, self)
    }

    /// Server handshake over `stream`
    pub fn accept(&self, stream: TcpStream) -> Result<super::TlsSessionOps, TlsError> {
        if !self.is_server {
            return Err(TlsError::InvalidConfig(
                "Cannot use client config for server accept".to_string(),
            ));
        }
        super::session::TlsSessionOps::accept(stream, self)
    }
}

/// Client configuration builder
pub struct ClientConfigBuilder {
    ctx_builder: SslContextBuilder,
    servername: Option<String>,
}

impl ClientConfigBuilder {
    fn new() -> Result<Self, TlsError> {
        let mut ctx_builder = SslContextBuilder::new(SslMethod::tls_client())?;
        ctx_builder.set_verify(SslVerifyMode::NONE);

        Ok(ClientConfigBuilder {
            ctx_builder,
            servername: None,
        })
    }

    /// Pin a single protocol version
    pub fn version(self, version: TlsVersion) -> Result<Self, TlsError> {
        self.version_range(version, version)
    }

    /// Restrict the protocol version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Result<Self, TlsError> {
        self.ctx_builder.set_min_proto_version(Some(min.to_openssl()))?;
        self.ctx_builder.set_max_proto_version(Some(max.to_openssl()))?;
        Ok(self)
    }

    /// Offer these application protocols
    pub fn alpn(mut self, protocols: &[&str]) -> Result<Self, TlsError> {
        self.ctx_builder.set_alpn_protos(&encode_alpn(protocols)?)?;
        Ok(self)
    }

    /// Send SNI
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.servername = Some(name.into());
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        Ok(TlsConfig {
            ctx: self.ctx_builder.build(),
            is_server: false,
            servername: self.servername,
        })
    }
}

/// Server configuration builder
pub struct ServerConfigBuilder {
    ctx_builder: SslContextBuilder,
    has_cert: bool,
}

impl ServerConfigBuilder {
    fn new() -> Result<Self, TlsError> {
        Ok(ServerConfigBuilder {
            ctx_builder: SslContextBuilder::new(SslMethod::tls_server())?,
            has_cert: false,
        })
    }

    /// Pin a single protocol version
    pub fn version(self, version: TlsVersion) -> Result<Self, TlsError> {
        self.version_range(version, version)
    }

    /// Restrict the protocol version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Result<Self, TlsError> {
        self.ctx_builder.set_min_proto_version(Some(min.to_openssl()))?;
        self.ctx_builder.set_max_proto_version(Some(max.to_openssl()))?;
        Ok(self)
    }

    /// Accept these application protocols, in client preference order.
    /// A client offering none of them gets no ALPN acknowledgement.
    pub fn alpn(mut self, protocols: &[&str]) -> Result<Self, TlsError> {
        let ours: Vec<Vec<u8>> = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();

        self.ctx_builder
            .set_alpn_select_callback(move |_ssl, client_protos| {
                select_alpn(&ours, client_protos).ok_or(AlpnError::NOACK)
            });

        Ok(self)
    }

    /// Load certificate and private key from one PEM bundle
    pub fn cert_file<P: AsRef<Path>>(self, path: P) -> Result<Self, TlsError> {
        let pem = fs::read(path.as_ref())?;
        self.load_pem(&pem)
    }

    fn load_pem(mut self, pem: &[u8]) -> Result<Self, TlsError> {
        let cert = X509::from_pem(pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load certificate: {}", e)))?;
        self.ctx_builder.set_certificate(&cert)?;

        let key = PKey::private_key_from_pem(pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load private key: {}", e)))?;
        self.ctx_builder.set_private_key(&key)?;

        self.has_cert = true;
        Ok(self)
    }

    /// Build the configuration, using the built-in certificate if none was
    /// loaded
    pub fn build(mut self) -> Result<TlsConfig, TlsError> {
        if !self.has_cert {
            self = self.load_pem(super::builtin_cert::BUILTIN_CERT.as_bytes())?;
        }

        Ok(TlsConfig {
            ctx: self.ctx_builder.build(),
            is_server: true,
            servername: None,
        })
    }
}
