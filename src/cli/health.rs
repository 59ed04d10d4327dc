use anyhow::Result;
use clap::Args;

use super::{load_config, open_core};
use crate::core::HealthStatus;

#[derive(Args)]
pub struct HealthArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run(args: HealthArgs, config_path: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    let core = open_core(&config)?;
    let report = core.health_check();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let c = &report.checks;
        println!("Status: {}", report.overall_status.as_str().to_uppercase());
        println!("  encryption:      {}", ok(c.encryption));
        println!(
            "  audit store:     {}",
            c.database.map(ok).unwrap_or("disabled")
        );
        println!("  audit file:      {}", ok(c.audit_file));
        println!("  circuit breaker: {}", c.circuit_breaker);
    }

    if report.overall_status == HealthStatus::Unhealthy {
        anyhow::bail!("security core is unhealthy");
    }
    Ok(())
}

fn ok(up: bool) -> &'static str {
    if up { "ok" } else { "FAILED" }
}
