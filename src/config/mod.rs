//! Configuration module for MyServer
//!
//! Handles TOML-based configuration for the server. The flat `KEY=VALUE`
//! properties format of older deployments is accepted as well.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Document root and pinned pages
    #[serde(default)]
    pub site: SiteConfig,

    /// Content cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// FastCGI backend settings
    #[serde(default)]
    pub fastcgi: FastCgiConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    ///
    /// Files ending in `.properties` are read with [`Config::from_properties`],
    /// everything else is parsed as TOML.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        if path.extension().and_then(|e| e.to_str()) == Some("properties") {
            Self::from_properties(&contents)
        } else {
            Self::from_str(&contents)
        }
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `KEY=VALUE` properties
    pub fn from_properties(contents: &str) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let Some((key, value)) = line.split_once(|c: char| c == '=' || c == ':') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            match key {
                "HOST" => config.server.host = value.to_string(),
                "PORT" => config.server.port = parse_number(key, value)?,
                "BACKLOG" => config.server.backlog = parse_number(key, value)?,
                "THREAD_POOL" => config.server.workers = value.to_string(),
                "REQUEST_LENGTH" => config.server.max_request_size = parse_number(key, value)?,
                "DOC_ROOT" => config.site.doc_root = value.to_string(),
                "INDEX_PAGE" => config.site.index_page = value.to_string(),
                "ERROR_PAGE" => config.site.error_page = value.to_string(),
                "FILE_CACHE" => config.cache.capacity = value.to_string(),
                "FASTCGI_HOST" => config.fastcgi.host = value.to_string(),
                "FASTCGI_PORT" => config.fastcgi.port = parse_number(key, value)?,
                "FASTCGI_ROOT" => config.fastcgi.root = value.to_string(),
                // Logging is configured through [logging] filter directives
                "LOG_XML" => {}
                _ => {}
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.backlog == 0 {
            return Err(ConfigError::ValidationError(
                "server.backlog must be greater than 0".to_string(),
            ));
        }

        if self.server.max_request_size == 0 {
            return Err(ConfigError::ValidationError(
                "server.max_request_size must be greater than 0".to_string(),
            ));
        }

        if !self.site.index_page.starts_with('/') || !self.site.error_page.starts_with('/') {
            return Err(ConfigError::ValidationError(
                "site.index_page and site.error_page must start with '/'".to_string(),
            ));
        }

        if parse_size(&self.cache.capacity).is_none() {
            return Err(ConfigError::ValidationError(format!(
                "cache.capacity is not a size: {}",
                self.cache.capacity
            )));
        }

        if self.fastcgi.script_extension.is_empty() {
            return Err(ConfigError::ValidationError(
                "fastcgi.script_extension must not be empty".to_string(),
            ));
        }

        if self.fastcgi.max_concurrent == 0 {
            return Err(ConfigError::ValidationError(
                "fastcgi.max_concurrent must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the number of worker threads
    pub fn worker_threads(&self) -> usize {
        match self.server.workers.as_str() {
            "auto" => num_cpus::get(),
            n => n
                .parse()
                .ok()
                .filter(|n| *n > 0)
                .unwrap_or_else(num_cpus::get),
        }
    }

    /// Host and port the listener binds to
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("{} is not a number: {}", key, value)))
}

/// Parse size string (e.g., "512M", "2G") to bytes
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim().to_uppercase();

    let (num, unit) = if let Some(num) = s.strip_suffix('G') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = s.strip_suffix('M') {
        (num, 1024 * 1024)
    } else if let Some(num) = s.strip_suffix('K') {
        (num, 1024)
    } else {
        (s.as_str(), 1)
    };

    num.trim().parse::<u64>().ok()?.checked_mul(unit)
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind (0 picks an ephemeral port)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Pending connection queue length
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Number of worker threads ("auto" or a number)
    #[serde(default = "default_workers")]
    pub workers: String,

    /// Largest request read from a client, in bytes
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,

    /// Read timeout in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            workers: default_workers(),
            max_request_size: default_max_request_size(),
            read_timeout: default_read_timeout(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_backlog() -> u32 {
    1024
}

fn default_workers() -> String {
    "auto".to_string()
}

fn default_max_request_size() -> usize {
    4096
}

fn default_read_timeout() -> u64 {
    30
}

/// Site configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Directory static files are served from
    #[serde(default = "default_doc_root")]
    pub doc_root: String,

    /// Page served for `/`
    #[serde(default = "default_index_page")]
    pub index_page: String,

    /// Page served with 404 responses
    #[serde(default = "default_error_page")]
    pub error_page: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            doc_root: default_doc_root(),
            index_page: default_index_page(),
            error_page: default_error_page(),
        }
    }
}

fn default_doc_root() -> String {
    "/var/www/html".to_string()
}

fn default_index_page() -> String {
    "/index.html".to_string()
}

fn default_error_page() -> String {
    "/404.html".to_string()
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Capacity of the content cache
    #[serde(default = "default_cache_capacity")]
    pub capacity: String,

    /// Count response header bytes toward capacity
    #[serde(default)]
    pub count_headers: bool,

    /// Remember missing paths as 404 responses
    #[serde(default = "default_true")]
    pub cache_not_found: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            count_headers: false,
            cache_not_found: true,
        }
    }
}

impl CacheConfig {
    /// Capacity in bytes
    pub fn capacity_bytes(&self) -> u64 {
        parse_size(&self.capacity).unwrap_or(64 * 1024 * 1024)
    }
}

fn default_cache_capacity() -> String {
    "64M".to_string()
}

fn default_true() -> bool {
    true
}

/// FastCGI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastCgiConfig {
    /// Backend host
    #[serde(default = "default_fastcgi_host")]
    pub host: String,

    /// Backend port
    #[serde(default = "default_fastcgi_port")]
    pub port: u16,

    /// Script root as seen by the backend
    #[serde(default = "default_fastcgi_root")]
    pub root: String,

    /// Extension routed to the backend
    #[serde(default = "default_script_extension")]
    pub script_extension: String,

    /// Deadline for one round-trip in seconds
    #[serde(default = "default_fastcgi_timeout")]
    pub timeout: u64,

    /// Maximum simultaneous backend connections
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for FastCgiConfig {
    fn default() -> Self {
        Self {
            host: default_fastcgi_host(),
            port: default_fastcgi_port(),
            root: default_fastcgi_root(),
            script_extension: default_script_extension(),
            timeout: default_fastcgi_timeout(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_fastcgi_host() -> String {
    "127.0.0.1".to_string()
}

fn default_fastcgi_port() -> u16 {
    9000
}

fn default_fastcgi_root() -> String {
    "/var/www/html".to_string()
}

fn default_script_extension() -> String {
    "php".to_string()
}

fn default_fastcgi_timeout() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    num_cpus::get() * 16
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directives
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "myserver=info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:8080");
        assert_eq!(config.site.index_page, "/index.html");
        assert_eq!(config.fastcgi.script_extension, "php");
        assert!(!config.cache.count_headers);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
            [server]
            host = "127.0.0.1"
            port = 9090
            workers = "4"
            max_request_size = 2048

            [site]
            doc_root = "/srv/www"

            [cache]
            capacity = "1M"

            [fastcgi]
            port = 9001
            timeout = 5
        "#;

        let config = Config::from_str(toml).unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:9090");
        assert_eq!(config.worker_threads(), 4);
        assert_eq!(config.server.max_request_size, 2048);
        assert_eq!(config.site.doc_root, "/srv/www");
        assert_eq!(config.cache.capacity_bytes(), 1024 * 1024);
        assert_eq!(config.fastcgi.port, 9001);
        assert_eq!(config.fastcgi.host, "127.0.0.1");
    }

    #[test]
    fn test_parse_properties() {
        let props = "\
# server
HOST=127.0.0.1
PORT=8888
DOC_ROOT=/srv/www
INDEX_PAGE=/index.html
ERROR_PAGE=/404.html
REQUEST_LENGTH=1024
FILE_CACHE=10485760
THREAD_POOL=8
BACKLOG=100
LOG_XML=log4j2.xml
FASTCGI_HOST=127.0.0.1
FASTCGI_PORT=9000
FASTCGI_ROOT=/var/www/php
";
        let config = Config::from_properties(props).unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:8888");
        assert_eq!(config.server.max_request_size, 1024);
        assert_eq!(config.server.backlog, 100);
        assert_eq!(config.worker_threads(), 8);
        assert_eq!(config.cache.capacity_bytes(), 10485760);
        assert_eq!(config.fastcgi.root, "/var/www/php");
    }

    #[test]
    fn test_properties_bad_number() {
        let err = Config::from_properties("PORT=eighty").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.server.max_request_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cache.capacity = "lots".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.site.index_page = "index.html".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512M"), Some(512 * 1024 * 1024));
        assert_eq!(parse_size("2G"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("1024K"), Some(1024 * 1024));
        assert_eq!(parse_size("1048576"), Some(1048576));
        assert_eq!(parse_size("many"), None);
        assert_eq!(parse_size("99999999999G"), None);
        assert_eq!(parse_size("18446744073709551615K"), None);
    }

    #[test]
    fn test_oversized_capacity_rejected() {
        let err = Config::from_str("[cache]\ncapacity = \"99999999999G\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_worker_threads() {
        let mut config = Config::default();
        config.server.workers = "4".to_string();
        assert_eq!(config.worker_threads(), 4);

        config.server.workers = "auto".to_string();
        assert!(config.worker_threads() > 0);

        config.server.workers = "0".to_string();
        assert!(config.worker_threads() > 0);
    }
}
