//! Agent commands.

use std::collections::BTreeMap;

use anyhow::Result;
use clap::{Args, Subcommand};
use colored::Colorize;
use gantry_id::AgentId;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::error::CliError;
use crate::output::{print_output, print_single, print_success, OutputFormat};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct AgentsCommand {
    #[command(subcommand)]
    command: AgentsSubcommand,
}

#[derive(Debug, Subcommand)]
enum AgentsSubcommand {
    /// List registered agents.
    List(ListAgentsArgs),

    /// Stop placing new work on an agent.
    Drain(DrainArgs),
}

#[derive(Debug, Args)]
struct ListAgentsArgs {
    /// Only agents in this pool.
    #[arg(long)]
    pool: Option<String>,
}

#[derive(Debug, Args)]
struct DrainArgs {
    /// Agent ID.
    agent: AgentId,
}

impl AgentsCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            AgentsSubcommand::List(args) => list_agents(ctx, args).await,
            AgentsSubcommand::Drain(args) => drain_agent(ctx, args).await,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Slot {
    id: String,
    device: String,
    #[serde(default)]
    bound_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Agent {
    id: String,
    pool: String,
    health: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    slots: Vec<Slot>,
    registered_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AgentsResponse {
    items: Vec<Agent>,
}

#[derive(Debug, Serialize, Tabled)]
struct AgentRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Pool")]
    pool: String,
    #[tabled(rename = "Health")]
    health: String,
    #[tabled(rename = "Slots (free/total)")]
    slots: String,
    #[tabled(rename = "Labels")]
    labels: String,
}

impl From<&Agent> for AgentRow {
    fn from(agent: &Agent) -> Self {
        let free = agent.slots.iter().filter(|s| s.bound_to.is_none()).count();
        let health = match agent.health.as_str() {
            "connected" => agent.health.green().to_string(),
            "draining" => agent.health.yellow().to_string(),
            _ => agent.health.red().to_string(),
        };
        let labels = if agent.labels.is_empty() {
            "-".to_string()
        } else {
            agent
                .labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",")
        };
        Self {
            id: agent.id.clone(),
            pool: agent.pool.clone(),
            health,
            slots: format!("{}/{}", free, agent.slots.len()),
            labels,
        }
    }
}

async fn list_agents(ctx: CommandContext, args: ListAgentsArgs) -> Result<()> {
    let client = ctx.client()?;
    let mut response: AgentsResponse = client.get("/v1/agents").await?;
    if let Some(pool) = args.pool.as_deref() {
        response.items.retain(|a| a.pool == pool);
    }

    match ctx.format {
        OutputFormat::Table => {
            let rows: Vec<AgentRow> = response.items.iter().map(AgentRow::from).collect();
            print_output(&rows, ctx.format);
        }
        OutputFormat::Json => print_single(&response, ctx.format),
    }
    Ok(())
}

async fn drain_agent(ctx: CommandContext, args: DrainArgs) -> Result<()> {
    let client = ctx.client()?;
    client
        .put_empty(&format!("/v1/agents/{}/drain", args.agent))
        .await
        .map_err(|e| match e {
            CliError::Api { status: 404, .. } => {
                CliError::NotFound(format!("Agent '{}' not found", args.agent))
            }
            other => other,
        })?;

    print_success(&format!("Agent {} is draining", args.agent));
    Ok(())
}
