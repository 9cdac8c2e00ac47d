//! Pool listing.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::output::{print_output, print_single, OutputFormat};

use super::CommandContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PoolSummary {
    name: String,
    policy: String,
    pending: usize,
    max_pending: usize,
    gated: bool,
    agents: usize,
    total_slots: usize,
    #[serde(default)]
    free: BTreeMap<String, usize>,
    #[serde(default)]
    bound: BTreeMap<String, usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PoolsResponse {
    items: Vec<PoolSummary>,
}

#[derive(Debug, Serialize, Tabled)]
struct PoolRow {
    #[tabled(rename = "Pool")]
    name: String,
    #[tabled(rename = "Policy")]
    policy: String,
    #[tabled(rename = "Agents")]
    agents: usize,
    #[tabled(rename = "Slots")]
    total_slots: usize,
    #[tabled(rename = "Free")]
    free: String,
    #[tabled(rename = "Pending")]
    pending: String,
}

/// `gpu=3 cpu=8`
fn counts(by_kind: &BTreeMap<String, usize>) -> String {
    if by_kind.is_empty() {
        return "-".to_string();
    }
    by_kind
        .iter()
        .map(|(kind, n)| format!("{kind}={n}"))
        .collect::<Vec<_>>()
        .join(" ")
}

impl From<&PoolSummary> for PoolRow {
    fn from(pool: &PoolSummary) -> Self {
        let mut pending = format!("{}/{}", pool.pending, pool.max_pending);
        if pool.gated {
            pending.push_str(" (gated)");
        }
        Self {
            name: pool.name.clone(),
            policy: pool.policy.clone(),
            agents: pool.agents,
            total_slots: pool.total_slots,
            free: counts(&pool.free),
            pending,
        }
    }
}

pub async fn list_pools(ctx: CommandContext) -> Result<()> {
    let client = ctx.client()?;
    let response: PoolsResponse = client.get("/v1/pools").await?;

    match ctx.format {
        OutputFormat::Table => {
            let rows: Vec<PoolRow> = response.items.iter().map(PoolRow::from).collect();
            print_output(&rows, ctx.format);
        }
        OutputFormat::Json => print_single(&response, ctx.format),
    }
    Ok(())
}
