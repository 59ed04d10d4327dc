//! CLI subcommands: `phiguard seal` and `phiguard open`

use anyhow::{Context, Result};
use clap::Args;

use super::{caller, input_or_stdin, load_config, open_core};
use crate::crypto::Metadata;

#[derive(Args)]
pub struct SealArgs {
    /// Text to seal (reads stdin if omitted)
    pub text: Option<String>,

    /// Metadata entries carried inside the envelope (key=value)
    #[arg(short, long = "meta", value_name = "KEY=VALUE")]
    pub meta: Vec<String>,
}

#[derive(Args)]
pub struct OpenArgs {
    /// Envelope token (reads stdin if omitted)
    pub token: Option<String>,

    /// Also print envelope version, timestamp and metadata
    #[arg(long)]
    pub show_meta: bool,
}

pub fn seal(args: SealArgs, config_path: Option<&str>, subject: &str) -> Result<()> {
    let metadata = parse_meta(&args.meta)?;
    let text = input_or_stdin(args.text)?;

    let config = load_config(config_path)?;
    let core = open_core(&config)?;
    let token = core.seal(&caller(subject), text.trim_end_matches('\n'), metadata)?;

    println!("{}", token);
    Ok(())
}

pub fn open(args: OpenArgs, config_path: Option<&str>, subject: &str) -> Result<()> {
    let token = input_or_stdin(args.token)?;

    let config = load_config(config_path)?;
    let core = open_core(&config)?;
    let opened = core.open(&caller(subject), token.trim())?;

    if args.show_meta {
        println!("version:    {}", opened.version);
        println!("created_at: {}", opened.created_at.to_rfc3339());
        if !opened.metadata.is_empty() {
            println!(
                "metadata:   {}",
                serde_json::to_string(&opened.metadata).context("Failed to render metadata")?
            );
        }
        println!();
    }
    println!("{}", opened.text()?);
    Ok(())
}

fn parse_meta(entries: &[String]) -> Result<Metadata> {
    let mut metadata = Metadata::new();
    for entry in entries {
        let Some((key, value)) = entry.split_once('=') else {
            anyhow::bail!("Invalid metadata '{}', expected KEY=VALUE", entry);
        };
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("Invalid metadata '{}', key is empty", entry);
        }
        metadata.insert(key.to_string(), value.trim().into());
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_pairs() {
        let meta = parse_meta(&["record=MRN-1".into(), " kind = lab ".into()]).unwrap();
        assert_eq!(meta["record"], "MRN-1");
        assert_eq!(meta["kind"], "lab");
    }

    #[test]
    fn rejects_entries_without_a_key() {
        assert!(parse_meta(&["novalue".into()]).is_err());
        assert!(parse_meta(&["=x".into()]).is_err());
    }
}
