//! CLI commands.

mod agents;
mod allocations;
mod logs;
mod pools;
mod signal;
mod submit;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::client::ApiClient;
use crate::config::Config;
use crate::output::OutputFormat;

/// gantry - submit and inspect tasks on a gantry cluster.
#[derive(Debug, Parser)]
#[command(name = "gantry")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table")]
    format: String,

    /// Master base URL.
    #[arg(long, global = true, env = "GANTRY_MASTER_URL")]
    master: Option<String>,

    /// Requester name used for fair-share accounting.
    #[arg(long, global = true, env = "GANTRY_REQUESTER")]
    requester: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show resource pools and their capacity.
    Pools,

    /// Submit a task request to a pool.
    Submit(submit::SubmitCommand),

    /// Inspect or cancel allocations.
    Allocations(allocations::AllocationsCommand),

    /// Signal readiness of an allocation.
    Signal(signal::SignalCommand),

    /// View or follow an allocation's logs.
    Logs(logs::LogsCommand),

    /// Inspect or drain agents.
    Agents(agents::AgentsCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let format = match self.format.as_str() {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Table,
        };

        let mut config = Config::load()?;
        if let Some(master) = self.master {
            config.master_url = master;
        }
        if self.requester.is_some() {
            config.requester = self.requester;
        }

        let ctx = CommandContext { config, format };

        match self.command {
            Commands::Pools => pools::list_pools(ctx).await,
            Commands::Submit(cmd) => cmd.run(ctx).await,
            Commands::Allocations(cmd) => cmd.run(ctx).await,
            Commands::Signal(cmd) => cmd.run(ctx).await,
            Commands::Logs(cmd) => cmd.run(ctx).await,
            Commands::Agents(cmd) => cmd.run(ctx).await,
            Commands::Version => {
                println!("gantry {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub config: Config,
    pub format: OutputFormat,
}

impl CommandContext {
    pub fn client(&self) -> Result<ApiClient> {
        ApiClient::new(&self.config, self.config.requester.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_nested_commands() {
        let cli = Cli::try_parse_from([
            "gantry",
            "--format",
            "json",
            "logs",
            "alloc_01HZX0000000000000000000AA",
            "--follow",
            "--level",
            "error,warning",
        ])
        .unwrap();
        assert_eq!(cli.format, "json");
        assert!(matches!(cli.command, Commands::Logs(_)));
    }
}
