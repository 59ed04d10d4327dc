use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use phiguard::cli::{self, Cli, Commands};
use phiguard::config::LoggingConfig;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    // Logging settings come from the config file when it parses; commands
    // that report config errors still need a subscriber.
    let logging = match cli.command {
        Commands::Keygen(_) => LoggingConfig::default(),
        _ => cli::load_config(config_path)
            .map(|c| c.logging)
            .unwrap_or_default(),
    };
    init_logging(&logging, cli.verbose);

    match cli.command {
        Commands::Keygen(args) => cli::keygen::run(args),
        Commands::Seal(args) => cli::crypt::seal(args, config_path, &cli.subject),
        Commands::Open(args) => cli::crypt::open(args, config_path, &cli.subject),
        Commands::State(args) => cli::state::run(args, config_path, &cli.subject),
        Commands::Audit(args) => cli::audit::run(args, config_path),
        Commands::Health(args) => cli::health::run(args, config_path),
        Commands::Config(args) => cli::config::run(args, config_path),
        Commands::Paths => cli::paths::run(config_path),
    }
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}
