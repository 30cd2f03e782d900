//! Postforge CLI: daily social-media posts for an agricultural supply store.
//!
//! Resolves the weekday theme, generates a deduplicated topic and renders
//! channel-ready content through an OpenAI-compatible LLM endpoint.

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
