use anyhow::Result;
use clap::Parser;

use indexwatch::Settings;
use indexwatch::cli::commands::{errors, extract, init, watch};
use indexwatch::cli::{Cli, Commands};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // Init does not need existing settings
    if let Commands::Init { force } = cli.command {
        indexwatch::logging::init();
        return init::run_init(force);
    }

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))?;

    indexwatch::logging::init_with_config(&settings.logging);

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Config => init::run_config(&settings),
        Commands::Watch { dirs, duration } => watch::run(&settings, &dirs, duration),
        Commands::Extract { dirs, force } => extract::run(&settings, &dirs, force).map(|_| ()),
        Commands::Errors { path } => errors::run(&settings, path.as_deref()),
    }
}
