//! Static File Loader
//!
//! Reads files below the document root and gzip-compresses them once, at
//! cache-insertion time. Response header lines are chosen from a fixed
//! extension table.

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Status and header block for the shared 404 page
pub const NOT_FOUND_HEADER: &str =
    "HTTP/1.1 404 Not Found\nContent-Encoding: gzip\nContent-Type: text/html\n\n";

/// Loader for files under the document root
pub struct StaticFiles {
    doc_root: PathBuf,

    /// Completed disk reads
    disk_reads: AtomicU64,
}

impl StaticFiles {
    pub fn new<P: Into<PathBuf>>(doc_root: P) -> Self {
        Self {
            doc_root: doc_root.into(),
            disk_reads: AtomicU64::new(0),
        }
    }

    pub fn doc_root(&self) -> &Path {
        &self.doc_root
    }

    /// Number of files read from disk so far
    pub fn disk_reads(&self) -> u64 {
        self.disk_reads.load(Ordering::Relaxed)
    }

    /// Read `path` from the document root and return its gzip-compressed bytes
    pub async fn load(&self, path: &str) -> std::io::Result<Bytes> {
        let file_path = resolve_path(&self.doc_root, path);
        let raw = tokio::fs::read(&file_path).await?;
        self.disk_reads.fetch_add(1, Ordering::Relaxed);

        let raw_len = raw.len();
        let compressed = tokio::task::spawn_blocking(move || gzip(&raw))
            .await
            .map_err(std::io::Error::other)??;

        debug!(
            "Loaded {:?} ({} bytes, {} gzipped)",
            file_path,
            raw_len,
            compressed.len()
        );

        Ok(Bytes::from(compressed))
    }
}

/// Gzip-compress a buffer
pub fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 64), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Extension of a request path: the text after the last `.` of the final
/// segment
pub fn extension(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("")
}

/// MIME type for an extension; unrecognized extensions are plain text
pub fn content_type(extension: &str) -> &'static str {
    match extension {
        "html" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "png" => "image/png",
        "jpg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        _ => "text/plain",
    }
}

/// Status and header block for a static file with the given extension
pub fn response_header(extension: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\nContent-Encoding: gzip\nContent-Type: {}\n\n",
        content_type(extension)
    )
}

/// Canonical form of a request path
///
/// The path is percent-decoded and reduced to its normal components, so
/// `..`, repeated or trailing slashes and embedded roots all disappear. The
/// result always starts with `/`.
pub fn normalize_path(path: &str) -> String {
    let decoded = percent_encoding::percent_decode_str(path).decode_utf8_lossy();

    let segments: Vec<&str> = Path::new(&*decoded)
        .components()
        .filter_map(|c| match c {
            Component::Normal(segment) => segment.to_str(),
            _ => None,
        })
        .collect();

    format!("/{}", segments.join("/"))
}

/// Map a request path onto `root`; the result never leaves `root`
pub fn resolve_path(root: &Path, path: &str) -> PathBuf {
    root.join(normalize_path(path).trim_start_matches('/'))
}
