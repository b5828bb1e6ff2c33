//! Raindrop.io auto-tagger CLI.
//!
//! Finds bookmarks without tags, asks Claude to categorize them against the
//! existing tag vocabulary, and writes the suggested tags back.

mod commands;
mod logging;

use std::process::ExitCode;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli)?;
    commands::run(cli).await
}
