//! Publish destinations.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use url::Url;

pub const RTMP_DEFAULT_PORT: u16 = 1935;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A TCP peer; `path` is the application/stream-key part of the URI.
    Stream {
        scheme: String,
        host: String,
        port: u16,
        path: String,
    },
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("Please specify rtmp link to publish")]
    Missing,

    #[error("Invalid location '{0}': {1}")]
    Malformed(String, String),

    #[error("Unsupported scheme '{0}' (expected rtmp, tcp or file)")]
    UnsupportedScheme(String),
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EndpointError::Missing);
        }
        let url = Url::parse(s).map_err(|e| EndpointError::Malformed(s.to_string(), e.to_string()))?;
        let malformed = |why: &str| EndpointError::Malformed(s.to_string(), why.to_string());

        match url.scheme() {
            "file" => url
                .to_file_path()
                .map(Endpoint::File)
                .map_err(|_| malformed("not an absolute file path")),
            scheme @ ("rtmp" | "tcp") => {
                let host = url.host_str().ok_or_else(|| malformed("missing host"))?;
                let port = match (url.port(), scheme) {
                    (Some(port), _) => port,
                    (None, "rtmp") => RTMP_DEFAULT_PORT,
                    (None, _) => return Err(malformed("tcp locations need a port")),
                };
                Ok(Endpoint::Stream {
                    scheme: scheme.to_string(),
                    host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
                    port,
                    path: url.path().to_string(),
                })
            }
            other => Err(EndpointError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl Endpoint {
    /// `host:port` for stream endpoints.
    pub fn socket_addr(&self) -> Option<String> {
        match self {
            Endpoint::Stream { host, port, .. } if host.contains(':') => Some(format!("[{host}]:{port}")),
            Endpoint::Stream { host, port, .. } => Some(format!("{host}:{port}")),
            Endpoint::File(_) => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Stream {
                scheme,
                host,
                port,
                path,
            } => write!(f, "{scheme}://{host}:{port}{path}"),
            Endpoint::File(path) => write!(f, "file://{}", path.display()),
        }
    }
}
