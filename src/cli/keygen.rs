//! CLI subcommand: `phiguard keygen`
//!
//! Prints a fresh secret and salt as shell exports. Nothing is written to
//! disk; where the values live is the operator's decision.

use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use clap::Args;
use rand::RngExt;
use zeroize::Zeroizing;

use crate::config::SALT_LEN;

const SECRET_BYTES: usize = 48;

#[derive(Args)]
pub struct KeygenArgs {
    /// Only print the salt (rotate the secret separately)
    #[arg(long)]
    pub salt_only: bool,
}

pub fn run(args: KeygenArgs) -> Result<()> {
    let mut salt = Zeroizing::new([0u8; SALT_LEN]);
    rand::rng().fill(&mut salt[..]);

    if !args.salt_only {
        let mut secret = Zeroizing::new([0u8; SECRET_BYTES]);
        rand::rng().fill(&mut secret[..]);
        println!("export PHIGUARD_SECRET='{}'", URL_SAFE_NO_PAD.encode(&secret[..]));
    }
    println!("export PHIGUARD_SALT='{}'", hex::encode(&salt[..]));

    eprintln!();
    eprintln!("The salt must stay the same for as long as any sealed data must open.");
    Ok(())
}
