//! recapsync CLI: batch ingestion of competition recaps.
//!
//! Lists events from the configured result sources, parses their recap
//! pages on a bounded worker pool, and merges the results into the store.

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
