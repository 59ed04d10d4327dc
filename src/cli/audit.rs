//! CLI subcommand: `phiguard audit`
//!
//! Audit trail inspection: recent events, checksum verification, summary
//! report, and retention purge of the backing store.

use anyhow::Result;
use clap::{Args, Subcommand};

use super::{load_config, open_core};
use crate::audit::AuditEvent;

#[derive(Args)]
pub struct AuditArgs {
    #[command(subcommand)]
    pub command: AuditCommands,
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Show recent audit events
    Show {
        /// Number of events to show
        #[arg(short = 'n', long, default_value = "20")]
        count: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Filter by action (e.g., login_failed, anomaly_detected)
        #[arg(long)]
        filter: Option<String>,
    },

    /// Verify the checksum of every audit line
    Verify,

    /// Summarize the audit trail
    Report {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete backing-store events older than the retention window
    Purge,
}

pub fn run(args: AuditArgs, config_path: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    let core = open_core(&config)?;

    match args.command {
        AuditCommands::Show {
            count,
            json,
            filter,
        } => {
            let mut events = core.recent_audit(count)?;
            if let Some(ref action) = filter {
                events.retain(|e| e.action.as_str() == action);
            }
            show_events(&events, json, filter.as_deref())
        }
        AuditCommands::Verify => {
            let verification = core.verify_audit_log()?;
            if verification.is_intact() {
                println!("Audit log: INTACT ({} lines)", verification.total);
                return Ok(());
            }
            println!(
                "Audit log: TAMPER DETECTED ({} of {} lines)",
                verification.tampered.len(),
                verification.total
            );
            for i in &verification.tampered {
                println!("  line {}", i + 1);
            }
            anyhow::bail!("audit log failed verification")
        }
        AuditCommands::Report { json } => {
            let report = core.audit_report()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }
            println!("Audit Report ({})", report.generated_at.to_rfc3339());
            println!("  Total events:    {}", report.total_events);
            println!("  Failed attempts: {}", report.failed_attempts);
            println!("  Tampered lines:  {}", report.tampered.len());
            if let (Some(first), Some(last)) = (report.first_event, report.last_event) {
                println!("  Span:            {} .. {}", first.to_rfc3339(), last.to_rfc3339());
            }
            println!();
            println!("  By action:");
            for (action, n) in &report.events_by_action {
                println!("    {:<20} {}", action, n);
            }
            println!("  By severity:");
            for (severity, n) in &report.events_by_severity {
                println!("    {:<20} {}", severity, n);
            }
            Ok(())
        }
        AuditCommands::Purge => {
            let purged = core.purge_expired_audit()?;
            println!("Purged {} expired audit event(s) from the backing store", purged);
            Ok(())
        }
    }
}

fn show_events(events: &[AuditEvent], json: bool, filter: Option<&str>) -> Result<()> {
    if events.is_empty() {
        if filter.is_some() {
            println!("No audit events matching filter.");
        } else {
            println!("No audit events.");
        }
        return Ok(());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(events)?);
        return Ok(());
    }

    for event in events {
        let outcome = if event.is_failure() { " [FAILED]" } else { "" };
        println!(
            "  {} {:<8} {:<18} {} @ {}{}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.severity,
            event.action,
            event.subject_id,
            event.origin,
            outcome
        );
        if !event.details.is_empty() {
            println!("      {}", event.details);
        }
    }
    Ok(())
}
