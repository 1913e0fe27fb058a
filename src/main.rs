//! MyServer - Small caching web server
//!
//! Entry point for the MyServer binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use myserver::cli::{self, ConfigCommand};
use myserver::config::Config;
use myserver::server::Server;

/// MyServer - Small caching web server with a FastCGI backend
#[derive(Parser)]
#[command(name = "myserver")]
#[command(version = myserver::VERSION)]
#[command(about = "Small caching web server with a FastCGI backend", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "myserver.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Start,
    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config { command }) => cli::handle_config_command(&cli.config, command),
        Some(Commands::Start) | None => {
            let config = cli::load_config(&cli.config)?;
            init_logging(&config, cli.verbose);

            if cli.config.exists() {
                info!("Loaded configuration from {:?}", cli.config);
            } else {
                info!("Using default configuration");
            }

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(config.worker_threads())
                .enable_all()
                .build()?;

            runtime.block_on(start_server(config))
        }
    }
}

/// Install the tracing subscriber; RUST_LOG overrides the configured filter
fn init_logging(config: &Config, verbose: bool) {
    let default_filter = if verbose {
        "myserver=debug".to_string()
    } else {
        config.logging.filter.clone()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn start_server(config: Config) -> anyhow::Result<()> {
    info!("MyServer v{} starting...", myserver::VERSION);
    info!(
        "Document root {}, {} worker threads",
        config.site.doc_root,
        config.worker_threads()
    );

    let server = match Server::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start server: {:#}", e);
            return Err(e);
        }
    };

    server.run().await
}
