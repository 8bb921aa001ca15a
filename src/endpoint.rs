//! Server endpoint addressing.
//!
//! Every server exposes two ports: an HTTP port for the REST surface and a
//! stream port for the duplex channel. By convention the stream port sits at
//! a fixed offset above the HTTP port; either side can be pinned explicitly
//! through the URL fragment (`#streamPort=9848` / `#httpPort=8848`).

use std::fmt;

use url::Url;

use crate::error::ClientError;

/// Default HTTP port when the endpoint string does not name one.
pub const DEFAULT_HTTP_PORT: u16 = 8848;
/// Offset from the HTTP port to the derived stream port.
pub const STREAM_PORT_OFFSET: u16 = 1000;

/// A single resolved server address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerEndpoint {
    pub host: String,
    pub http_port: u16,
    pub stream_port: u16,
    /// Use TLS for both surfaces.
    pub secure: bool,
}

impl ServerEndpoint {
    /// Parses an endpoint string.
    ///
    /// Accepts `http://` / `https://` URLs as well as bare `host[:port]`
    /// strings, which are treated as plain HTTP. The fragment may override
    /// the derived ports.
    pub fn parse(input: &str) -> Result<Self, ClientError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ClientError::InvalidEndpoint("empty address".to_string()));
        }
        let normalized = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("http://{trimmed}")
        };
        let url = Url::parse(&normalized)
            .map_err(|err| ClientError::InvalidEndpoint(format!("{trimmed}: {err}")))?;

        let secure = match url.scheme() {
            "http" => false,
            "https" => true,
            other => {
                return Err(ClientError::InvalidEndpoint(format!(
                    "{trimmed}: unsupported scheme {other:?}"
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| ClientError::InvalidEndpoint(format!("{trimmed}: missing host")))?
            .to_string();
        let http_port = url.port().unwrap_or(DEFAULT_HTTP_PORT);

        let mut endpoint = ServerEndpoint {
            host,
            http_port,
            stream_port: http_port.saturating_add(STREAM_PORT_OFFSET),
            secure,
        };
        for (key, value) in fragment_pairs(url.fragment()) {
            let port: u16 = value
                .parse()
                .map_err(|_| ClientError::InvalidEndpoint(format!("{trimmed}: bad port {value:?}")))?;
            match key {
                "streamPort" => endpoint.stream_port = port,
                "httpPort" => endpoint.http_port = port,
                _ => {}
            }
        }
        Ok(endpoint)
    }

    /// Base URL for the HTTP surface, without a trailing slash.
    pub fn http_url(&self, path: &str) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}:{}{path}", self.host, self.http_port)
    }

    /// URL for the duplex stream surface.
    pub fn stream_url(&self, path: &str) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}:{}{path}", self.host, self.stream_port)
    }
}

impl std::str::FromStr for ServerEndpoint {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.http_port, self.stream_port)
    }
}

fn fragment_pairs(fragment: Option<&str>) -> impl Iterator<Item = (&str, &str)> {
    fragment
        .unwrap_or_default()
        .split('&')
        .filter_map(|pair| pair.split_once('='))
}
