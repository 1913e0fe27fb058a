//! Request Router
//!
//! Turns raw request bytes into a response buffer. Processing order:
//! 1. Cache hit (including the pinned index and error pages)
//! 2. Dynamic script, handed to the FastCGI gateway and never cached
//! 3. Static file, gzip-compressed and inserted into the cache
//! 4. Not found, answered with the shared 404 page

use crate::cache::{CachedResponse, ContentCache};
use crate::config::Config;
use crate::fastcgi::{self, FastCgiGateway};
use crate::framing;
use crate::server::request::RequestTarget;
use crate::server::static_files::{self, StaticFiles, NOT_FOUND_HEADER};

use anyhow::{Context, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use tracing::{debug, warn};

/// How a request was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Cached,
    Static,
    Dynamic,
    NotFound,
    BadGateway,
    GatewayTimeout,
}

/// Response bytes plus how they were produced
#[derive(Debug, Clone)]
pub struct Resolution {
    pub outcome: Outcome,
    pub data: Bytes,
}

/// Request router
pub struct Router {
    cache: ContentCache,
    gateway: FastCgiGateway,
    static_files: StaticFiles,

    index_page: String,
    script_extension: String,

    /// Shared 404 response and the bytes it is charged at
    not_found: CachedResponse,
    not_found_size: u64,

    cache_not_found: bool,
    count_headers: bool,
}

impl Router {
    /// Build the router, loading and pinning the index and error pages
    pub async fn new(config: &Config) -> Result<Self> {
        let static_files = StaticFiles::new(&config.site.doc_root);
        let index_page = static_files::normalize_path(&config.site.index_page);
        let error_page = static_files::normalize_path(&config.site.error_page);
        let mut cache = ContentCache::new(config.cache.capacity_bytes());

        let error_body = static_files
            .load(&error_page)
            .await
            .with_context(|| format!("Failed to load error page {}", error_page))?;
        let not_found = CachedResponse::not_found(framing::concat(
            NOT_FOUND_HEADER.as_bytes(),
            &error_body,
        ));
        let not_found_size = if config.cache.count_headers {
            not_found.data.len() as u64
        } else {
            error_body.len() as u64
        };
        cache.pin(&error_page, not_found.clone());

        // A dynamic index page is routed to the backend instead
        let index_ext = static_files::extension(&index_page);
        if index_ext != config.fastcgi.script_extension {
            let index_body = static_files
                .load(&index_page)
                .await
                .with_context(|| format!("Failed to load index page {}", index_page))?;
            let header = static_files::response_header(index_ext);
            cache.pin(
                &index_page,
                CachedResponse::found(framing::concat(header.as_bytes(), &index_body)),
            );
        }

        Ok(Self {
            cache,
            gateway: FastCgiGateway::new(&config.fastcgi),
            static_files,
            index_page,
            script_extension: config.fastcgi.script_extension.clone(),
            not_found,
            not_found_size,
            cache_not_found: config.cache.cache_not_found,
            count_headers: config.cache.count_headers,
        })
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn static_files(&self) -> &StaticFiles {
        &self.static_files
    }

    pub fn gateway(&self) -> &FastCgiGateway {
        &self.gateway
    }

    /// Resolve raw request bytes from `client` into a response
    ///
    /// Returns `None` for an unparseable request line; the caller closes the
    /// connection without answering.
    pub async fn dispatch(&self, raw: &[u8], client: SocketAddr) -> Option<Bytes> {
        let target = RequestTarget::parse(raw).ok()?;
        let resolution = self.route(&target.path, &target.query).await;

        if resolution.outcome == Outcome::NotFound {
            warn!(
                target: "myserver::not_found",
                client = %client.ip(),
                path = %target.path,
                "{} - {}",
                client.ip(),
                target.path
            );
        }

        debug!("{} {} -> {:?}", client, target.path, resolution.outcome);
        Some(resolution.data)
    }

    /// Resolve a path and query
    ///
    /// Classification and the cache key both use the normalized path.
    pub async fn route(&self, path: &str, query: &str) -> Resolution {
        let normalized = static_files::normalize_path(path);
        let path = if normalized == "/" {
            self.index_page.as_str()
        } else {
            normalized.as_str()
        };

        if let Some(cached) = self.cache.get(path) {
            let outcome = if cached.not_found {
                Outcome::NotFound
            } else {
                Outcome::Cached
            };
            return Resolution {
                outcome,
                data: cached.data,
            };
        }

        let ext = static_files::extension(path);
        if ext == self.script_extension {
            return self.dynamic(path, query).await;
        }

        match self.static_files.load(path).await {
            Ok(body) => {
                let header = static_files::response_header(ext);
                let data = framing::concat(header.as_bytes(), &body);
                let size = if self.count_headers {
                    data.len()
                } else {
                    body.len()
                };
                self.cache
                    .put(path, CachedResponse::found(data.clone()), size as u64);

                Resolution {
                    outcome: Outcome::Static,
                    data,
                }
            }
            Err(e) => {
                debug!("Static load failed for {}: {}", path, e);
                if self.cache_not_found {
                    self.cache
                        .put(path, self.not_found.clone(), self.not_found_size);
                }

                Resolution {
                    outcome: Outcome::NotFound,
                    data: self.not_found.data.clone(),
                }
            }
        }
    }

    /// Run a script on the FastCGI backend
    async fn dynamic(&self, path: &str, query: &str) -> Resolution {
        match self.gateway.request(path, query).await {
            Ok(stdout) => {
                let status = fastcgi::cgi_status(&stdout).unwrap_or_else(|| "200 OK".to_string());
                let status_line = format!("HTTP/1.1 {}\n", status);

                Resolution {
                    outcome: Outcome::Dynamic,
                    data: framing::concat(status_line.as_bytes(), &stdout),
                }
            }
            Err(e) if e.is_timeout() => {
                warn!("FastCGI request for {} timed out: {}", path, e);
                Resolution {
                    outcome: Outcome::GatewayTimeout,
                    data: gateway_error("504 Gateway Timeout"),
                }
            }
            Err(e) => {
                warn!("FastCGI request for {} failed: {}", path, e);
                Resolution {
                    outcome: Outcome::BadGateway,
                    data: gateway_error("502 Bad Gateway"),
                }
            }
        }
    }
}

/// Plain-text response for a failed backend exchange
fn gateway_error(status: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 {status}\nContent-Type: text/plain\nServer: {server}\n\n{status}\n",
        status = status,
        server = crate::SERVER_SOFTWARE
    ))
}
