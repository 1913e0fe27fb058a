//! CLI Module
//!
//! Configuration tooling for the `myserver config` subcommands.

use anyhow::{anyhow, Result};
use clap::Subcommand;
use std::path::Path;

use crate::config::Config;

/// Configuration subcommands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Validate configuration file
    Validate,
    /// Test configuration and show parsed result
    Test,
    /// Show default configuration
    ShowDefault,
}

/// Load `path`, falling back to defaults when the file does not exist
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        Ok(Config::load(path)?)
    } else {
        Ok(Config::default())
    }
}

/// Handle configuration commands
pub fn handle_config_command(config_path: &Path, cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Validate => {
            println!("Validating configuration: {:?}", config_path);
            if !config_path.exists() {
                println!("Configuration file not found, using defaults.");
                println!("Configuration is valid.");
                return Ok(());
            }

            match Config::load(config_path) {
                Ok(_) => {
                    println!("✓ Configuration is valid.");
                }
                Err(e) => {
                    println!("✗ Configuration error: {}", e);
                    return Err(anyhow!("Invalid configuration"));
                }
            }
        }
        ConfigCommand::Test => {
            println!("Testing configuration: {:?}", config_path);
            if !config_path.exists() {
                println!("(Using default configuration)");
            }
            let config = load_config(config_path)?;

            println!("\n=== Parsed Configuration ===\n");
            print!("{}", render_config(&config)?);
            println!("\n✓ Configuration test passed.");
        }
        ConfigCommand::ShowDefault => {
            println!("{}", default_config_toml()?);
        }
    }
    Ok(())
}

/// Effective settings rendered as TOML
pub fn render_config(config: &Config) -> Result<String> {
    Ok(toml::to_string_pretty(config)?)
}

/// Default configuration rendered as TOML
pub fn default_config_toml() -> Result<String> {
    let body = render_config(&Config::default())?;
    Ok(format!("# MyServer Configuration\n\n{}", body))
}
