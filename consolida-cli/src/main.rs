//! `consolida` binary: imports, classifies, geocodes and reports on a CNPJ registry store.

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Import(args) => commands::import(&cli.db, args).await,
        Commands::Classify(args) => commands::classify(&cli.db, &args),
        Commands::Geocode(args) => commands::geocode(&cli.db, args).await,
        Commands::Report(args) => commands::report(&cli.db, &args),
    }
}
