//! leadenrich CLI: enrich contact records through a phased provider pipeline.
//!
//! Reads a batch of raw leads, runs each through the configured lookup
//! phases, and persists every result for later aggregation.

mod commands;
mod progress;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
