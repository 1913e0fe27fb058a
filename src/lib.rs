//! MyServer - Small caching web server with a FastCGI backend
//!
//! MyServer answers one HTTP request per connection:
//! - Static files are gzip-compressed once and kept in a size-bounded FIFO cache
//! - Scripts are handed to an external FastCGI server (PHP-FPM and friends)
//! - Missing files get a shared 404 page
//!
//! # Example
//!
//! ```rust,no_run
//! use myserver::config::Config;
//! use myserver::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("myserver.toml")?;
//!     let server = Server::bind(config).await?;
//!     server.run().await
//! }
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod fastcgi;
pub mod framing;
pub mod server;

pub use config::Config;
pub use server::Server;

/// MyServer version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Value of the SERVER_SOFTWARE parameter sent to the FastCGI backend
pub const SERVER_SOFTWARE: &str = concat!("MyServer/", env!("CARGO_PKG_VERSION"));
