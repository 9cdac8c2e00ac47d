//! gantryctl (gantry) - CLI for the gantry master
//!
//! Submits tasks, inspects pools and allocations, and follows task logs
//! over the master's HTTP API.

use anyhow::Result;
use clap::Parser;

mod client;
mod commands;
mod config;
mod error;
mod output;
mod sse;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
