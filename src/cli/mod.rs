pub mod audit;
pub mod config;
pub mod crypt;
pub mod health;
pub mod keygen;
pub mod paths;
pub mod state;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::Path;

use crate::config::Config;
use crate::core::{Caller, SecurityCore};
use crate::paths::Paths;

#[derive(Parser)]
#[command(name = "phiguard")]
#[command(author, version, about = "Local security substrate for protected health information")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "PHIGUARD_CONFIG")]
    pub config: Option<String>,

    /// Subject recorded in the audit trail for this invocation
    #[arg(
        short,
        long,
        global = true,
        default_value = "admin",
        env = "PHIGUARD_SUBJECT"
    )]
    pub subject: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a fresh secret and salt
    Keygen(keygen::KeygenArgs),

    /// Seal text into an envelope token
    Seal(crypt::SealArgs),

    /// Open an envelope token
    Open(crypt::OpenArgs),

    /// Encrypted state files
    State(state::StateArgs),

    /// Audit trail inspection and maintenance
    Audit(audit::AuditArgs),

    /// Check encryption, audit file, audit store and breaker
    Health(health::HealthArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Show resolved XDG directory paths
    Paths,
}

/// Load the config from `--config` if given, else the default location.
pub fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => {
            let path = shellexpand::tilde(path).to_string();
            Config::load_from(Path::new(&path), Paths::resolve()?)
                .with_context(|| format!("Failed to load config from {}", path))
        }
        None => Config::load(),
    }
}

/// Validate settings, derive keys and open the core.
pub fn open_core(config: &Config) -> Result<SecurityCore> {
    SecurityCore::from_config(config).context("Failed to start security core")
}

pub fn caller(subject: &str) -> Caller {
    Caller::new(subject)
}

/// `arg` if present, otherwise everything on stdin.
pub fn input_or_stdin(arg: Option<String>) -> Result<String> {
    match arg {
        Some(value) => Ok(value),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read stdin")?;
            Ok(buf)
        }
    }
}
