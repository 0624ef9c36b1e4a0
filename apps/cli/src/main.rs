//! b-roll harvester CLI.
//!
//! Queues video links as jobs and runs each through download, transcription,
//! concept extraction and image fetching, writing one bundle per job.

mod commands;

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
