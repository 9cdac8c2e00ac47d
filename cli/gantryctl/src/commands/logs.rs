//! Logs command (query or follow an allocation's logs).

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use gantry_events::{LogLevel, LogRecord};
use gantry_id::AllocationId;
use serde::{Deserialize, Serialize};

use crate::output::{print_single, OutputFormat};
use crate::sse::SseParser;

use super::allocations::not_found;
use super::CommandContext;

#[derive(Debug, Args)]
pub struct LogsCommand {
    /// Allocation ID.
    allocation: AllocationId,

    /// Follow new records until the allocation ends.
    #[arg(long, short)]
    follow: bool,

    /// Newest first (ignored with --follow).
    #[arg(long)]
    desc: bool,

    /// Maximum records to return.
    #[arg(long, short = 'n')]
    limit: Option<usize>,

    /// Records to skip.
    #[arg(long)]
    offset: Option<usize>,

    /// RFC 3339 lower bound on timestamps.
    #[arg(long)]
    since: Option<String>,

    /// RFC 3339 upper bound on timestamps.
    #[arg(long)]
    until: Option<String>,

    /// Comma-separated agent IDs.
    #[arg(long)]
    agent: Option<String>,

    /// Comma-separated container IDs.
    #[arg(long)]
    container: Option<String>,

    /// Comma-separated ranks.
    #[arg(long)]
    rank: Option<String>,

    /// Comma-separated sources.
    #[arg(long)]
    source: Option<String>,

    /// stdout, stderr, or both comma-separated.
    #[arg(long)]
    stdtype: Option<String>,

    /// Comma-separated levels.
    #[arg(long)]
    level: Option<String>,

    /// Substring of the message.
    #[arg(long)]
    search: Option<String>,

    /// Show timestamps.
    #[arg(long, short)]
    timestamps: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct LogsResponse {
    allocation_id: String,
    items: Vec<LogRecord>,
}

impl LogsCommand {
    /// Query string shared by queries and follow streams.
    fn query(&self) -> String {
        let mut params: Vec<(&str, String)> = Vec::new();
        let filters = [
            ("since", &self.since),
            ("until", &self.until),
            ("agent_id", &self.agent),
            ("container_id", &self.container),
            ("rank", &self.rank),
            ("source", &self.source),
            ("stdtype", &self.stdtype),
            ("level", &self.level),
            ("search", &self.search),
        ];
        for (key, value) in filters {
            if let Some(value) = value {
                params.push((key, value.clone()));
            }
        }
        if !self.follow {
            if self.desc {
                params.push(("order", "desc".to_string()));
            }
            if let Some(limit) = self.limit {
                params.push(("limit", limit.to_string()));
            }
            if let Some(offset) = self.offset {
                params.push(("offset", offset.to_string()));
            }
        }

        if params.is_empty() {
            return String::new();
        }
        let pairs: Vec<String> = params
            .into_iter()
            .map(|(key, value)| format!("{key}={}", encode(&value)))
            .collect();
        format!("?{}", pairs.join("&"))
    }

    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let client = ctx.client()?;
        let query = self.query();

        if self.follow {
            let path = format!("/v1/allocations/{}/logs/stream{}", self.allocation, query);
            let mut response = client
                .get_event_stream(&path)
                .await
                .map_err(|e| not_found(e, &self.allocation))?;
            let mut parser = SseParser::default();

            while let Some(chunk) = response.chunk().await? {
                for event in parser.push(&String::from_utf8_lossy(&chunk)) {
                    match event.event.as_str() {
                        "log" => match ctx.format {
                            OutputFormat::Json => println!("{}", event.data),
                            OutputFormat::Table => {
                                if let Ok(record) = serde_json::from_str::<LogRecord>(&event.data) {
                                    print_record(&record, self.timestamps);
                                }
                            }
                        },
                        "end" => return Ok(()),
                        _ => {}
                    }
                }
            }
            return Ok(());
        }

        let path = format!("/v1/allocations/{}/logs{}", self.allocation, query);
        let response: LogsResponse = client
            .get(&path)
            .await
            .map_err(|e| not_found(e, &self.allocation))?;

        if matches!(ctx.format, OutputFormat::Json) {
            print_single(&response, ctx.format);
            return Ok(());
        }
        if response.items.is_empty() {
            println!("{}", "No items found.".dimmed());
            return Ok(());
        }
        for record in &response.items {
            print_record(record, self.timestamps);
        }
        Ok(())
    }
}

/// Percent-encode a query value.
fn encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b',' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

fn print_record(record: &LogRecord, timestamps: bool) {
    let mut prefix: Vec<String> = Vec::new();
    if timestamps {
        prefix.push(record.timestamp.to_rfc3339());
    }
    if let Some(rank) = record.rank {
        prefix.push(format!("[rank={rank}]"));
    }

    let message = match record.level {
        LogLevel::Error | LogLevel::Critical => record.message.red().to_string(),
        LogLevel::Warning => record.message.yellow().to_string(),
        LogLevel::Trace | LogLevel::Debug => record.message.dimmed().to_string(),
        LogLevel::Info => record.message.clone(),
    };

    if prefix.is_empty() {
        println!("{}", message);
    } else {
        println!("{} {}", prefix.join(" "), message);
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Debug, Parser)]
    struct Wrapper {
        #[command(flatten)]
        logs: LogsCommand,
    }

    fn parse(args: &[&str]) -> LogsCommand {
        let mut argv = vec!["logs", "alloc_01HZX0000000000000000000AA"];
        argv.extend_from_slice(args);
        Wrapper::try_parse_from(argv).unwrap().logs
    }

    #[test]
    fn test_query_string() {
        assert_eq!(parse(&[]).query(), "");
        assert_eq!(
            parse(&["--level", "error,warning", "--desc", "-n", "50", "--search", "loss=nan"]).query(),
            "?level=error,warning&search=loss%3Dnan&order=desc&limit=50"
        );
    }

    #[test]
    fn test_follow_drops_paging() {
        assert_eq!(
            parse(&["--follow", "--desc", "-n", "5", "--rank", "0"]).query(),
            "?rank=0"
        );
    }

    #[test]
    fn test_encode() {
        assert_eq!(encode("2026-01-01T00:00:00+02:00"), "2026-01-01T00%3A00%3A00%2B02%3A00");
        assert_eq!(encode("a b"), "a%20b");
    }
}
