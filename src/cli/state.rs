//! CLI subcommand: `phiguard state`
//!
//! Save and load encrypted JSON state files through the atomic store.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde_json::Value;

use super::{caller, input_or_stdin, load_config, open_core};

#[derive(Args)]
pub struct StateArgs {
    #[command(subcommand)]
    pub command: StateCommands,
}

#[derive(Subcommand)]
pub enum StateCommands {
    /// Seal and atomically write a JSON document
    Save {
        /// Logical file name (e.g., progress.json)
        name: String,

        /// JSON document (reads stdin if omitted)
        json: Option<String>,
    },

    /// Open and print a state file
    Load {
        /// Logical file name
        name: String,
    },

    /// List snapshots kept for a state file
    Backups {
        /// Logical file name
        name: String,
    },
}

pub fn run(args: StateArgs, config_path: Option<&str>, subject: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let core = open_core(&config)?;
    let caller = caller(subject);

    match args.command {
        StateCommands::Save { name, json } => {
            let raw = input_or_stdin(json)?;
            let value: Value = serde_json::from_str(&raw).context("State must be valid JSON")?;
            core.save_state(&caller, &name, &value)?;
            println!("Saved {}", name);
        }
        StateCommands::Load { name } => {
            let value: Value = core.load_state(&caller, &name, Value::Null)?;
            if value.is_null() {
                println!("No state stored for {}", name);
            } else {
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
        }
        StateCommands::Backups { name } => {
            let backups = core.store().backups(&name)?;
            if backups.is_empty() {
                println!("No backups for {}", name);
            }
            for path in backups {
                println!("{}", path.display());
            }
        }
    }

    Ok(())
}
