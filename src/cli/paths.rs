//! CLI subcommand: `phiguard paths`
//!
//! Prints all resolved XDG-compliant paths for debugging and scripting.

use anyhow::Result;

use super::load_config;

pub fn run(config_path: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    let paths = &config.paths;

    println!("phiguard Paths (XDG Base Directory)");
    println!("===================================");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    println!("  config.toml:    {}", paths.config_file().display());
    println!();
    println!("Data:       {}", paths.data_dir.display());
    println!("  state files:    {}", config.store_dir().display());
    println!("  backups:        {}", config.backup_dir().display());
    println!();
    println!("State:      {}", paths.state_dir.display());
    println!("  audit logs:     {}", config.audit_log_dir().display());
    match config.audit_database() {
        Some(db) => println!("  audit store:    {}", db.display()),
        None => println!("  audit store:    (disabled)"),
    }
    println!();
    match paths.runtime_dir {
        Some(ref dir) => println!("Runtime:    {}", dir.display()),
        None => println!("Runtime:    (not available)"),
    }
    println!("  locks:          {}", paths.locks_dir().display());

    Ok(())
}
