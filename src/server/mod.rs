//! HTTP Server module
//!
//! Accept loop and per-connection handling. Each connection carries exactly
//! one request: the request is read, routed, answered and the connection is
//! closed.

mod request;
mod router;
mod static_files;

pub use request::{ParseError, RequestTarget};
pub use router::{Outcome, Resolution, Router};
pub use static_files::{normalize_path, StaticFiles};

use crate::config::Config;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// MyServer HTTP Server
pub struct Server {
    config: Arc<Config>,
    router: Arc<Router>,
    listener: TcpListener,
}

impl Server {
    /// Load the pinned pages and bind the listening socket
    pub async fn bind(config: Config) -> Result<Self> {
        let router = Arc::new(Router::new(&config).await?);

        let addr = tokio::net::lookup_host(config.listen_addr())
            .await
            .with_context(|| format!("Failed to resolve {}", config.listen_addr()))?
            .next()
            .with_context(|| format!("No address for {}", config.listen_addr()))?;
        let listener = listen(addr, config.server.backlog)
            .with_context(|| format!("Failed to bind {}", addr))?;

        Ok(Self {
            config: Arc::new(config),
            router,
            listener,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Run the server until Ctrl-C
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Accept connections until `shutdown` completes
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            "Server listening on http://{} (backend {})",
            self.local_addr()?,
            self.router.gateway().addr()
        );
        tokio::pin!(shutdown);

        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        continue;
                    }
                },
            };
            debug!("Accepted connection from {}", remote_addr);

            let config = self.config.clone();
            let router = self.router.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, remote_addr, &config, &router).await {
                    if !is_connection_closed_error(&e) {
                        error!("Connection error from {}: {}", remote_addr, e);
                    }
                }
            });
        }

        info!("Cache stats: {}", self.router.cache().stats());
        Ok(())
    }
}

/// Bind a listener with the configured backlog
fn listen(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    TcpListener::from_std(socket.into())
}

/// Serve the single request carried by one connection
async fn handle_connection(
    mut stream: TcpStream,
    remote_addr: SocketAddr,
    config: &Config,
    router: &Router,
) -> std::io::Result<()> {
    let read_timeout = Duration::from_secs(config.server.read_timeout);
    let raw = match tokio::time::timeout(
        read_timeout,
        read_request(&mut stream, config.server.max_request_size),
    )
    .await
    {
        Ok(raw) => raw?,
        Err(_) => {
            debug!("Read from {} timed out", remote_addr);
            return Ok(());
        }
    };

    if raw.is_empty() {
        return Ok(());
    }

    let Some(response) = router.dispatch(&raw, remote_addr).await else {
        return Ok(());
    };

    stream.write_all(&response).await?;
    stream.shutdown().await
}

/// Read until a newline arrives, the buffer is full or the peer stops sending
async fn read_request(stream: &mut TcpStream, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; limit];
    let mut filled = 0;

    while filled < limit {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        let seen_newline = buf[filled..filled + n].contains(&b'\n');
        filled += n;
        if seen_newline {
            break;
        }
    }

    buf.truncate(filled);
    Ok(buf)
}

/// Check if error is just a closed connection (not worth logging)
fn is_connection_closed_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tokio::sync::oneshot;

    struct Running {
        addr: SocketAddr,
        router: Arc<Router>,
        stop: oneshot::Sender<()>,
        handle: tokio::task::JoinHandle<Result<()>>,
        _dir: tempfile::TempDir,
    }

    async fn start() -> Running {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), b"<h1>home</h1>").unwrap();
        std::fs::write(dir.path().join("404.html"), b"<h1>missing</h1>").unwrap();
        std::fs::write(dir.path().join("app.js"), b"console.log(1);").unwrap();

        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config.server.read_timeout = 2;
        config.site.doc_root = dir.path().to_string_lossy().into_owned();

        let server = Server::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let router = server.router().clone();
        let (stop, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async move {
            let _ = rx.await;
        }));

        Running {
            addr,
            router,
            stop,
            handle,
            _dir: dir,
        }
    }

    async fn exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        response
    }

    fn split(response: &[u8]) -> (String, Vec<u8>) {
        let end = response.windows(2).position(|w| w == b"\n\n").unwrap() + 2;
        let mut body = Vec::new();
        GzDecoder::new(&response[end..]).read_to_end(&mut body).unwrap();
        (String::from_utf8_lossy(&response[..end]).into_owned(), body)
    }

    #[tokio::test]
    async fn test_static_file_served_twice_from_one_read() {
        let server = start().await;
        let reads = server.router.static_files().disk_reads();

        let first = exchange(server.addr, b"GET /app.js HTTP/1.1\r\n").await;
        let second = exchange(server.addr, b"GET /app.js HTTP/1.1\r\n").await;

        let (header, body) = split(&first);
        assert_eq!(
            header,
            "HTTP/1.1 200 OK\nContent-Encoding: gzip\nContent-Type: application/javascript\n\n"
        );
        assert_eq!(body, b"console.log(1);");
        assert_eq!(first, second);
        assert_eq!(server.router.static_files().disk_reads(), reads + 1);

        server.stop.send(()).unwrap();
        server.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_root_serves_index() {
        let server = start().await;

        let response = exchange(server.addr, b"GET / HTTP/1.1\r\n").await;
        let (header, body) = split(&response);
        assert!(header.starts_with("HTTP/1.1 200 OK\n"));
        assert_eq!(body, b"<h1>home</h1>");

        server.stop.send(()).unwrap();
        server.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_gets_404_page() {
        let server = start().await;

        let response = exchange(server.addr, b"GET /gone.html HTTP/1.1\r\n").await;
        let (header, body) = split(&response);
        assert!(header.starts_with("HTTP/1.1 404 Not Found\n"));
        assert_eq!(body, b"<h1>missing</h1>");

        server.stop.send(()).unwrap();
        server.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_request_closes_without_response() {
        let server = start().await;

        let response = exchange(server.addr, b"GARBAGE\n").await;
        assert!(response.is_empty());

        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        stream.shutdown().await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());

        server.stop.send(()).unwrap();
        server.handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_connection_closed_errors() {
        use std::io::{Error, ErrorKind};
        assert!(is_connection_closed_error(&Error::from(ErrorKind::BrokenPipe)));
        assert!(is_connection_closed_error(&Error::from(ErrorKind::ConnectionReset)));
        assert!(!is_connection_closed_error(&Error::from(ErrorKind::PermissionDenied)));
    }
}
