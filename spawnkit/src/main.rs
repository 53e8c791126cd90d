//! Spawnkit - run programs with redirected, concurrently pumped stdio.
//!
//! The process exits with the child's exit code (the last stage's for
//! pipelines), so it can stand in for the program it runs.

mod cli;

use anyhow::Result;
use clap::Parser;

use cli::{execute, init_logging, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;
    let code = execute(cli).await?;
    std::process::exit(code)
}
