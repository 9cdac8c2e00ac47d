//! Allocation commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use gantry_id::AllocationId;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::error::CliError;
use crate::output::{colored_state, print_output, print_single, print_success, OutputFormat};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct AllocationsCommand {
    #[command(subcommand)]
    command: AllocationsSubcommand,
}

#[derive(Debug, Subcommand)]
enum AllocationsSubcommand {
    /// List active allocations.
    List(ListArgs),

    /// Show an allocation with its transition history.
    Get(AllocationArg),

    /// Cancel an allocation.
    Cancel(AllocationArg),
}

#[derive(Debug, Args)]
struct ListArgs {
    /// Only allocations in this pool.
    #[arg(long)]
    pool: Option<String>,
}

#[derive(Debug, Args)]
pub(super) struct AllocationArg {
    /// Allocation ID.
    pub allocation: AllocationId,
}

impl AllocationsCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            AllocationsSubcommand::List(args) => list_allocations(ctx, args).await,
            AllocationsSubcommand::Get(args) => get_allocation(ctx, args).await,
            AllocationsSubcommand::Cancel(args) => cancel_allocation(ctx, args).await,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Resources {
    slots: u32,
    device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Request {
    pool: String,
    requester: String,
    #[serde(default)]
    name: Option<String>,
    resources: Resources,
    priority: i32,
}

/// Tagged state, e.g. `{"state": "terminating", "reason": "preempted"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct State {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.reason, &self.outcome) {
            (Some(detail), _) | (None, Some(detail)) => write!(f, "{}({})", self.state, detail),
            (None, None) => f.write_str(&self.state),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Allocation {
    id: String,
    request: Request,
    state: State,
    #[serde(default)]
    slots: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AllocationsResponse {
    items: Vec<Allocation>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryEntry {
    seq: u64,
    cause: String,
    occurred_at: String,
    to: State,
}

#[derive(Debug, Serialize, Deserialize)]
struct AllocationDetail {
    #[serde(flatten)]
    allocation: Allocation,
    #[serde(default)]
    history: Vec<HistoryEntry>,
}

#[derive(Debug, Serialize, Tabled)]
struct AllocationRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Pool")]
    pool: String,
    #[tabled(rename = "Requester")]
    requester: String,
    #[tabled(rename = "Slots")]
    slots: String,
    #[tabled(rename = "Priority")]
    priority: i32,
    #[tabled(rename = "State")]
    state: String,
}

impl From<&Allocation> for AllocationRow {
    fn from(a: &Allocation) -> Self {
        Self {
            id: a.id.clone(),
            pool: a.request.pool.clone(),
            requester: a.request.requester.clone(),
            slots: format!("{}x{}", a.request.resources.slots, a.request.resources.device),
            priority: a.request.priority,
            state: colored_state(&a.state.to_string()),
        }
    }
}

async fn list_allocations(ctx: CommandContext, args: ListArgs) -> Result<()> {
    let client = ctx.client()?;
    let mut response: AllocationsResponse = client.get("/v1/allocations").await?;
    if let Some(pool) = args.pool.as_deref() {
        response.items.retain(|a| a.request.pool == pool);
    }

    match ctx.format {
        OutputFormat::Table => {
            let rows: Vec<AllocationRow> = response.items.iter().map(AllocationRow::from).collect();
            print_output(&rows, ctx.format);
        }
        OutputFormat::Json => print_single(&response, ctx.format),
    }
    Ok(())
}

async fn get_allocation(ctx: CommandContext, args: AllocationArg) -> Result<()> {
    let client = ctx.client()?;
    let detail: AllocationDetail = client
        .get(&format!("/v1/allocations/{}", args.allocation))
        .await
        .map_err(|e| not_found(e, &args.allocation))?;

    if matches!(ctx.format, OutputFormat::Json) {
        print_single(&detail, ctx.format);
        return Ok(());
    }

    let a = &detail.allocation;
    println!("ID:        {}", a.id);
    println!("Pool:      {}", a.request.pool);
    if let Some(name) = &a.request.name {
        println!("Name:      {}", name);
    }
    println!("Requester: {}", a.request.requester);
    println!("Priority:  {}", a.request.priority);
    println!("State:     {}", colored_state(&a.state.to_string()));
    if !a.slots.is_empty() {
        println!("Slots:     {}", a.slots.join(", "));
    }
    println!();
    for entry in &detail.history {
        println!("{:>4}  {}  {:<24} {}", entry.seq, entry.occurred_at, entry.cause, entry.to);
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct SignalResponse {
    pub allocation_id: String,
    pub accepted: bool,
    #[serde(flatten)]
    pub state: Option<State>,
}

async fn cancel_allocation(ctx: CommandContext, args: AllocationArg) -> Result<()> {
    let client = ctx.client()?;
    let response: SignalResponse = client
        .post(
            &format!("/v1/allocations/{}/cancel", args.allocation),
            &serde_json::json!({}),
        )
        .await
        .map_err(|e| not_found(e, &args.allocation))?;

    match ctx.format {
        OutputFormat::Json => print_single(&response, ctx.format),
        OutputFormat::Table => {
            let state = response.state.map(|s| s.to_string()).unwrap_or_default();
            print_success(&format!("Cancelling {} ({})", response.allocation_id, state));
        }
    }
    Ok(())
}

pub(super) fn not_found(e: CliError, allocation: &AllocationId) -> CliError {
    match e {
        CliError::Api { status: 404, .. } => {
            CliError::NotFound(format!("Allocation '{}' not found", allocation))
        }
        other => other,
    }
}
