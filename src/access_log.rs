//! Access log parsing
//!
//! The server writes one Combined Log Format line per request:
//!
//! ```text
//! 127.0.0.1 - - [10/Oct/2025:13:55:36 +0000] "GET /_tests/ok HTTP/2" 200 2 "-" "curl/8.5.0"
//! ```

use std::fmt;
use std::net::IpAddr;

/// Access log parse errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Access log is empty")]
    Empty,

    #[error("Malformed {field} in access log line: {line:?}")]
    Malformed { field: &'static str, line: String },
}

/// One parsed access log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLogEntry {
    pub client_ip: IpAddr,
    /// Bracketed timestamp, verbatim
    pub timestamp: String,
    pub method: String,
    pub path: String,
    pub protocol: String,
    pub status: u16,
    /// `None` when the server logged `-`
    pub size: Option<u64>,
    pub referrer: String,
    pub user_agent: String,
}

impl AccessLogEntry {
    /// Parse one line; the request must be HTTP/2
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim();
        let malformed = |field: &'static str| ParseError::Malformed {
            field,
            line: line.to_string(),
        };

        let (ip, rest) = line.split_once(' ').ok_or_else(|| malformed("client address"))?;
        let client_ip = ip.parse::<IpAddr>().map_err(|_| malformed("client address"))?;

        let rest = rest.strip_prefix("- - [").ok_or_else(|| malformed("ident/user"))?;
        let (timestamp, rest) = rest.split_once("] \"").ok_or_else(|| malformed("timestamp"))?;

        let (request, rest) = rest.split_once("\" ").ok_or_else(|| malformed("request line"))?;
        let mut parts = request.split(' ');
        let (method, path, protocol) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(path), Some(protocol), None) if !method.is_empty() && !path.is_empty() => {
                (method, path, protocol)
            }
            _ => return Err(malformed("request line")),
        };
        if protocol != "HTTP/2" {
            return Err(malformed("protocol"));
        }

        let (status, rest) = rest.split_once(' ').ok_or_else(|| malformed("status"))?;
        if status.len() != 3 {
            return Err(malformed("status"));
        }
        let status = status.parse::<u16>().map_err(|_| malformed("status"))?;

        let (size, rest) = rest.split_once(' ').ok_or_else(|| malformed("size"))?;
        let size = match size {
            "-" => None,
            digits => Some(digits.parse::<u64>().map_err(|_| malformed("size"))?),
        };

        let quoted = rest
            .strip_prefix('"')
            .and_then(|r| r.strip_suffix('"'))
            .ok_or_else(|| malformed("referrer/user agent"))?;
        let (referrer, user_agent) = quoted
            .split_once("\" \"")
            .ok_or_else(|| malformed("referrer/user agent"))?;

        Ok(AccessLogEntry {
            client_ip,
            timestamp: timestamp.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            protocol: protocol.to_string(),
            status,
            size,
            referrer: referrer.to_string(),
            user_agent: user_agent.to_string(),
        })
    }

    /// Parse the first non-blank line of captured output
    pub fn first_entry(buffer: &str) -> Result<Self, ParseError> {
        let line = buffer
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or(ParseError::Empty)?;
        Self::parse(line)
    }
}

impl fmt::Display for AccessLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - - [{}] \"{} {} {}\" {} ",
            self.client_ip, self.timestamp, self.method, self.path, self.protocol, self.status
        )?;
        match self.size {
            Some(size) => write!(f, "{}", size)?,
            None => f.write_str("-")?,
        }
        write!(f, " \"{}\" \"{}\"", self.referrer, self.user_agent)
    }
}
