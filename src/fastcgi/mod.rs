//! FastCGI Gateway
//!
//! Runs one Responder request per script invocation against an external
//! FastCGI application server (PHP-FPM and friends). Every request opens its
//! own TCP connection; nothing is pooled or multiplexed.
//!
//! ## CGI Environment Variables
//!
//! The backend receives a fixed parameter set, in this order:
//! - `SCRIPT_FILENAME`: configured FastCGI root joined with the normalized
//!   request path
//! - `QUERY_STRING`: everything after the first `?`
//! - `REQUEST_METHOD`: always `GET`
//! - `GATEWAY_INTERFACE`: `CGI/1.1`
//! - `SERVER_SOFTWARE`: `MyServer/<version>`

pub mod protocol;

pub use protocol::Params;

use crate::config::FastCgiConfig;
use crate::server::normalize_path;

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tracing::debug;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Failed to connect to FastCGI backend {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("FastCGI I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("FastCGI backend did not answer within {0:?}")]
    Timeout(Duration),
    #[error("FastCGI parameter too long: {0}")]
    ParamTooLong(String),
    #[error("Malformed FastCGI data: {0}")]
    Protocol(String),
}

impl GatewayError {
    /// Whether the request ran out of time rather than failing outright
    pub fn is_timeout(&self) -> bool {
        matches!(self, GatewayError::Timeout(_))
    }
}

/// Client for the FastCGI application server
pub struct FastCgiGateway {
    /// Backend address as `host:port`
    addr: String,

    /// Prefix for SCRIPT_FILENAME
    root: String,

    /// Deadline for connect, write and read together
    timeout: Duration,

    /// Limits simultaneous backend connections
    permits: Arc<Semaphore>,
}

impl FastCgiGateway {
    /// Create a gateway for the configured backend
    pub fn new(config: &FastCgiConfig) -> Self {
        Self {
            addr: format!("{}:{}", config.host, config.port),
            root: config.root.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout),
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
        }
    }

    /// Backend address
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// CGI parameters for a script request
    pub fn params(&self, path: &str, query: &str) -> Params {
        let script_filename = format!("{}{}", self.root, normalize_path(path));

        let mut params = Params::new();
        params.insert("SCRIPT_FILENAME", &script_filename);
        params.insert("QUERY_STRING", query);
        params.insert("REQUEST_METHOD", "GET");
        params.insert("GATEWAY_INTERFACE", "CGI/1.1");
        params.insert("SERVER_SOFTWARE", crate::SERVER_SOFTWARE);
        params
    }

    /// Run `path` on the backend and return its raw STDOUT stream
    pub async fn request(&self, path: &str, query: &str) -> Result<Bytes, GatewayError> {
        let request = protocol::encode_request(protocol::REQUEST_ID, &self.params(path, query))?;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| GatewayError::Protocol("gateway is shut down".to_string()))?;

        debug!("FastCGI request: {} ({} bytes) -> {}", path, request.len(), self.addr);

        match tokio::time::timeout(self.timeout, self.exchange(&request)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(self.timeout)),
        }
    }

    async fn exchange(&self, request: &[u8]) -> Result<Bytes, GatewayError> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| GatewayError::Connect {
                addr: self.addr.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;

        stream.write_all(request).await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let stdout = protocol::read_stdout(&mut reader).await?;
        debug!("FastCGI response: {} bytes from {}", stdout.len(), self.addr);

        Ok(stdout)
    }
}

/// Status from a CGI `Status:` header at the start of a STDOUT stream
///
/// Only the header block, up to the first blank line, is inspected. Returns
/// the code and reason as written, e.g. `404 Not Found`.
pub fn cgi_status(stdout: &[u8]) -> Option<String> {
    let end = find(stdout, b"\r\n\r\n")
        .or_else(|| find(stdout, b"\n\n"))
        .unwrap_or(stdout.len());
    let headers = String::from_utf8_lossy(&stdout[..end]);

    for line in headers.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("status") {
            continue;
        }
        let value = value.trim();
        let code = value.split_whitespace().next()?;
        if code.len() == 3 && code.bytes().all(|b| b.is_ascii_digit()) {
            return Some(value.to_string());
        }
        return None;
    }

    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
