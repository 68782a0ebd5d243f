//! newsdigest CLI: fetch, abstract and report on batches of news articles.
//!
//! Every stage runs through the same rate-limited, retrying batch engine.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    // API keys may live in a .env beside the working directory.
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
