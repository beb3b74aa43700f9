//! Peer endpoint addresses
//!
//! Communicators are constructed from an endpoint string. Both the URL form
//! `tcp://host:port` and a bare `host:port` are accepted.

use core::fmt;
use core::str::FromStr;

use crate::errors::TransportError;

const TCP_SCHEME: &str = "tcp";

/// Parsed TCP peer address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new<T: Into<String>>(host: T, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn parse(input: &str) -> Result<Self, TransportError> {
        let input = input.trim();
        let candidate = if input.contains("://") {
            input.to_string()
        } else {
            format!("{TCP_SCHEME}://{input}")
        };

        let url = url::Url::parse(&candidate).map_err(|e| invalid(input, e.to_string()))?;
        if url.scheme() != TCP_SCHEME {
            return Err(invalid(
                input,
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }

        let host = url
            .host_str()
            .ok_or_else(|| invalid(input, "missing host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port().ok_or_else(|| invalid(input, "missing port"))?;

        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` form accepted by socket connect and bind calls
    pub fn socket_address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn invalid<R: Into<String>>(endpoint: &str, reason: R) -> TransportError {
    TransportError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: reason.into(),
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TCP_SCHEME}://{}", self.socket_address())
    }
}
