//! Task submission.

use anyhow::Result;
use clap::{Args, ValueEnum};
use gantry_events::{Colocation, DeviceKind, TaskType};
use serde::{Deserialize, Serialize};

use crate::output::{print_info, print_single, print_success, OutputFormat};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct SubmitCommand {
    /// Target pool.
    pool: String,

    /// Number of slots.
    #[arg(long, short, default_value = "1")]
    slots: u32,

    /// Device kind: cpu, gpu, or gpu:<class>.
    #[arg(long, short, default_value = "gpu", value_parser = parse_device)]
    device: DeviceKind,

    /// Allow the slots to span agents.
    #[arg(long)]
    spread: bool,

    /// Priority (higher runs first). Defaults to the pool's setting.
    #[arg(long, short, allow_negative_numbers = true)]
    priority: Option<i32>,

    /// Fair-share weight.
    #[arg(long)]
    weight: Option<f64>,

    #[arg(long, value_enum, default_value = "command")]
    task_type: TaskTypeArg,

    /// Display name.
    #[arg(long)]
    name: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TaskTypeArg {
    Trial,
    Notebook,
    Shell,
    Command,
    LogServer,
}

impl From<TaskTypeArg> for TaskType {
    fn from(arg: TaskTypeArg) -> Self {
        match arg {
            TaskTypeArg::Trial => TaskType::Trial,
            TaskTypeArg::Notebook => TaskType::Notebook,
            TaskTypeArg::Shell => TaskType::Shell,
            TaskTypeArg::Command => TaskType::Command,
            TaskTypeArg::LogServer => TaskType::LogServer,
        }
    }
}

fn parse_device(s: &str) -> Result<DeviceKind, String> {
    s.parse().map_err(|e: gantry_events::EventError| e.to_string())
}

#[derive(Debug, Serialize)]
struct SubmitTaskRequest {
    slots: u32,
    device: DeviceKind,
    colocation: Colocation,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    weight: Option<f64>,
    task_type: TaskType,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SubmitTaskResponse {
    allocation_id: String,
    pool: String,
    state: String,
}

impl SubmitCommand {
    fn request(&self) -> SubmitTaskRequest {
        SubmitTaskRequest {
            slots: self.slots,
            device: self.device.clone(),
            colocation: if self.spread {
                Colocation::Spread
            } else {
                Colocation::SingleAgent
            },
            priority: self.priority,
            weight: self.weight,
            task_type: self.task_type.into(),
            name: self.name.clone(),
        }
    }

    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let client = ctx.client()?;
        let response: SubmitTaskResponse = client
            .post(&format!("/v1/pools/{}/tasks", self.pool), &self.request())
            .await?;

        match ctx.format {
            OutputFormat::Json => print_single(&response, ctx.format),
            OutputFormat::Table => {
                print_success(&format!(
                    "Submitted {} to pool {} ({})",
                    response.allocation_id, response.pool, response.state
                ));
                print_info(&format!("Follow logs: gantry logs {} --follow", response.allocation_id));
            }
        }
        Ok(())
    }
}
