//! Task log records.

use chrono::{DateTime, Utc};
use gantry_id::{AgentId, AllocationId, Seq};
use serde::{Deserialize, Serialize};

use crate::EventError;

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            _ => Err(EventError::InvalidLogLevel(s.to_string())),
        }
    }
}

/// Output stream a line was captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StdType {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StdType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StdType::Stdout => f.write_str("stdout"),
            StdType::Stderr => f.write_str("stderr"),
        }
    }
}

impl std::str::FromStr for StdType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(StdType::Stdout),
            "stderr" => Ok(StdType::Stderr),
            _ => Err(EventError::InvalidStdType(s.to_string())),
        }
    }
}

/// A log line as shipped by an agent, before it is sequenced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdtype: Option<StdType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl LogEntry {
    pub fn new(timestamp: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            level: LogLevel::Info,
            message: message.into(),
            agent_id: None,
            container_id: None,
            rank: None,
            stdtype: None,
            source: None,
        }
    }
}

/// An appended, immutable log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub allocation_id: AllocationId,
    /// Assigned at append; strictly increasing per allocation.
    pub seq: Seq,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdtype: Option<StdType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// The message was cut at the ingestion size limit.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

impl LogRecord {
    /// Sequences an entry for an allocation.
    pub fn from_entry(allocation_id: AllocationId, seq: Seq, entry: LogEntry) -> Self {
        Self {
            allocation_id,
            seq,
            timestamp: entry.timestamp,
            level: entry.level,
            message: entry.message,
            agent_id: entry.agent_id,
            container_id: entry.container_id,
            rank: entry.rank,
            stdtype: entry.stdtype,
            source: entry.source,
            truncated: false,
        }
    }

    /// Total order used by queries: timestamp, then sequence.
    pub fn sort_key(&self) -> (DateTime<Utc>, Seq) {
        (self.timestamp, self.seq)
    }
}

/// Distinct values seen per filterable dimension of one allocation's logs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFields {
    pub agent_ids: std::collections::BTreeSet<AgentId>,
    pub container_ids: std::collections::BTreeSet<String>,
    pub ranks: std::collections::BTreeSet<u32>,
    pub stdtypes: std::collections::BTreeSet<StdType>,
    pub sources: std::collections::BTreeSet<String>,
}

impl LogFields {
    pub fn observe(&mut self, record: &LogRecord) {
        if let Some(agent) = record.agent_id {
            self.agent_ids.insert(agent);
        }
        if let Some(container) = &record.container_id {
            if !self.container_ids.contains(container) {
                self.container_ids.insert(container.clone());
            }
        }
        if let Some(rank) = record.rank {
            self.ranks.insert(rank);
        }
        if let Some(stdtype) = record.stdtype {
            self.stdtypes.insert(stdtype);
        }
        if let Some(source) = &record.source {
            if !self.sources.contains(source) {
                self.sources.insert(source.clone());
            }
        }
    }
}
