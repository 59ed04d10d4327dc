use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::PathBuf;

use super::load_config;
use crate::config::{Config, DEFAULT_CONFIG_TEMPLATE};
use crate::context::SecurityContext;
use crate::paths::Paths;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration (secrets masked)
    Show {
        /// Output format: toml (default) or json
        #[arg(short, long, default_value = "toml")]
        format: String,
    },

    /// Get a configuration value
    Get {
        /// Config key (e.g., rate_limits.failed_auth)
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Config key (e.g., rate_limits.failed_auth)
        key: String,

        /// Value to set
        value: String,
    },

    /// Show config file path
    Path,

    /// Initialize default config file
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the config and environment without deriving keys
    Check,
}

pub fn run(args: ConfigArgs, config_path: Option<&str>) -> Result<()> {
    match args.command {
        ConfigCommands::Show { format } => show_config(config_path, &format),
        ConfigCommands::Get { key } => get_config(config_path, &key),
        ConfigCommands::Set { key, value } => set_config(config_path, &key, &value),
        ConfigCommands::Path => show_path(config_path),
        ConfigCommands::Init { force } => init_config(config_path, force),
        ConfigCommands::Check => check_config(config_path),
    }
}

fn resolve_path(config_path: Option<&str>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(PathBuf::from(shellexpand::tilde(path).to_string())),
        None => Config::config_path(),
    }
}

fn show_config(config_path: Option<&str>, format: &str) -> Result<()> {
    let config = load_config(config_path)?.redacted();

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{}", json);
        }
        _ => {
            let toml = toml::to_string_pretty(&config)?;
            println!("{}", toml);
        }
    }

    Ok(())
}

fn get_config(config_path: Option<&str>, key: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let value = config.get_value(key)?;
    println!("{}", value);
    Ok(())
}

fn set_config(config_path: Option<&str>, key: &str, value: &str) -> Result<()> {
    let path = resolve_path(config_path)?;
    if !path.exists() {
        anyhow::bail!(
            "No config file at {}. Run `phiguard config init` first.",
            path.display()
        );
    }

    let mut config = Config::load_unexpanded(&path, Paths::resolve()?)?;
    config.set_value(key, value)?;
    config.save_to(&path)?;
    println!("Set {} = {}", key, value);
    Ok(())
}

fn show_path(config_path: Option<&str>) -> Result<()> {
    let path = resolve_path(config_path)?;
    println!("{}", path.display());
    Ok(())
}

fn init_config(config_path: Option<&str>, force: bool) -> Result<()> {
    let path = resolve_path(config_path)?;

    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;

    println!("Created config file at {}", path.display());
    println!("Generate a secret and salt with `phiguard keygen`.");
    Ok(())
}

fn check_config(config_path: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    let ctx = SecurityContext::from_config(&config)?;
    let settings = ctx.settings();

    println!("Configuration: VALID");
    println!("  kdf iterations:   {}", settings.crypto.kdf_iterations);
    println!("  envelope version: {}", settings.crypto.envelope_version);
    println!(
        "  session timeout:  {} min",
        settings.session_timeout.as_secs() / 60
    );
    println!(
        "  audit store:      {}",
        settings
            .audit
            .database
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(disabled)".to_string())
    );
    Ok(())
}
