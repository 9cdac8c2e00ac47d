//! Readiness signals for allocations.

use anyhow::Result;
use clap::{Args, Subcommand};

use crate::output::{print_single, print_success, OutputFormat};

use super::allocations::{not_found, AllocationArg, SignalResponse};
use super::CommandContext;

#[derive(Debug, Args)]
pub struct SignalCommand {
    #[command(subcommand)]
    command: SignalSubcommand,
}

#[derive(Debug, Subcommand)]
enum SignalSubcommand {
    /// The task is serving (Running).
    Ready(AllocationArg),

    /// The task is alive but not serving (Waiting).
    Waiting(AllocationArg),
}

impl SignalCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let (signal, args) = match self.command {
            SignalSubcommand::Ready(args) => ("ready", args),
            SignalSubcommand::Waiting(args) => ("waiting", args),
        };

        let client = ctx.client()?;
        let response: SignalResponse = client
            .post(
                &format!("/v1/allocations/{}/{}", args.allocation, signal),
                &serde_json::json!({}),
            )
            .await
            .map_err(|e| not_found(e, &args.allocation))?;

        match ctx.format {
            OutputFormat::Json => print_single(&response, ctx.format),
            OutputFormat::Table if response.accepted => {
                let state = response.state.map(|s| s.to_string()).unwrap_or_default();
                print_success(&format!("{} is {}", response.allocation_id, state));
            }
            OutputFormat::Table => {
                println!("{} is no longer active; signal ignored", response.allocation_id);
            }
        }
        Ok(())
    }
}
