use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use gantry_reconcile::BackoffPolicy;
use serde::Deserialize;
use thiserror::Error;

/// Name of the pool served when no pool file is configured.
pub const DEFAULT_POOL: &str = "default";

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub db_path: PathBuf,
    pub pools_config: Option<PathBuf>,
    pub settings: MasterSettings,
}

/// Runtime knobs of the master, independent of where they came from.
#[derive(Debug, Clone)]
pub struct MasterSettings {
    pub heartbeat_timeout: Duration,
    pub start_timeout: Duration,
    pub stop_grace: Duration,
    pub reattach_grace: Duration,
    pub scheduler_tick: Duration,
    pub rpc_max_attempts: u32,
    pub rpc_backoff: BackoffPolicy,
    /// Largest accepted log batch.
    pub max_log_batch: usize,
    /// Longer messages are truncated and flagged.
    pub max_log_message_bytes: usize,
}

impl Default for MasterSettings {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            start_timeout: Duration::from_secs(120),
            stop_grace: Duration::from_secs(30),
            reattach_grace: Duration::from_secs(60),
            scheduler_tick: Duration::from_millis(1000),
            rpc_max_attempts: 5,
            rpc_backoff: BackoffPolicy::default(),
            max_log_batch: 500,
            max_log_message_bytes: 16 * 1024,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("GANTRY_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()?;

        let log_level = std::env::var("GANTRY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("GANTRY_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let db_path = std::env::var("GANTRY_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("gantry.db"));

        let pools_config = std::env::var("GANTRY_POOLS_CONFIG").ok().map(PathBuf::from);

        let defaults = MasterSettings::default();
        let settings = MasterSettings {
            heartbeat_timeout: env_secs("GANTRY_HEARTBEAT_TIMEOUT_SECS", defaults.heartbeat_timeout)?,
            start_timeout: env_secs("GANTRY_START_TIMEOUT_SECS", defaults.start_timeout)?,
            stop_grace: env_secs("GANTRY_STOP_GRACE_SECS", defaults.stop_grace)?,
            reattach_grace: env_secs("GANTRY_REATTACH_GRACE_SECS", defaults.reattach_grace)?,
            scheduler_tick: match std::env::var("GANTRY_SCHEDULER_TICK_MILLIS") {
                Ok(v) => Duration::from_millis(
                    v.parse()
                        .with_context(|| format!("GANTRY_SCHEDULER_TICK_MILLIS={v}"))?,
                ),
                Err(_) => defaults.scheduler_tick,
            },
            rpc_max_attempts: match std::env::var("GANTRY_RPC_MAX_ATTEMPTS") {
                Ok(v) => v
                    .parse()
                    .with_context(|| format!("GANTRY_RPC_MAX_ATTEMPTS={v}"))?,
                Err(_) => defaults.rpc_max_attempts,
            },
            ..defaults
        };

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            db_path,
            pools_config,
            settings,
        })
    }

    /// Load the pool definitions, falling back to a single default pool.
    pub fn load_pools(&self) -> Result<Vec<PoolConfig>> {
        let Some(path) = &self.pools_config else {
            return Ok(vec![PoolConfig::named(DEFAULT_POOL)]);
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading pool config {}", path.display()))?;
        let pools = parse_pools(&text)
            .with_context(|| format!("parsing pool config {}", path.display()))?;
        Ok(pools)
    }
}

fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(v) => Ok(Duration::from_secs(
            v.parse().with_context(|| format!("{name}={v}"))?,
        )),
        Err(_) => Ok(default),
    }
}

// =============================================================================
// Pool configuration surface
// =============================================================================

/// Errors in the pool configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("no pools defined")]
    NoPools,

    #[error("duplicate pool name: {0}")]
    DuplicatePool(String),

    #[error("pool {pool}: {message}")]
    InvalidPool { pool: String, message: String },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PoolsFile {
    #[serde(default)]
    pools: Vec<PoolConfig>,
}

/// One resource pool.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    pub name: String,

    /// Bound on queued requests.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Static agent eligibility rule.
    #[serde(default)]
    pub agents: AgentSelector,
}

impl PoolConfig {
    /// A priority pool without preemption.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_pending: default_max_pending(),
            scheduler: SchedulerConfig::default(),
            agents: AgentSelector::default(),
        }
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum SchedulerConfig {
    Priority {
        #[serde(default)]
        preemption: bool,
        #[serde(default)]
        default_priority: i32,
    },
    FairShare {
        #[serde(default = "default_aging_per_sec")]
        aging_per_sec: f64,
    },
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig::Priority {
            preemption: false,
            default_priority: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn priority(preemption: bool) -> Self {
        SchedulerConfig::Priority {
            preemption,
            default_priority: 0,
        }
    }

    pub fn fair_share() -> Self {
        SchedulerConfig::FairShare {
            aging_per_sec: default_aging_per_sec(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SchedulerConfig::Priority { .. } => "priority",
            SchedulerConfig::FairShare { .. } => "fair_share",
        }
    }

    pub fn default_priority(&self) -> i32 {
        match self {
            SchedulerConfig::Priority {
                default_priority, ..
            } => *default_priority,
            SchedulerConfig::FairShare { .. } => 0,
        }
    }
}

/// Agents are eligible for a pool when every listed label matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSelector {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl AgentSelector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }
}

fn default_max_pending() -> usize {
    1024
}

fn default_aging_per_sec() -> f64 {
    0.01
}

/// Parse and validate a pool configuration document.
pub fn parse_pools(text: &str) -> Result<Vec<PoolConfig>, ConfigError> {
    let file: PoolsFile = toml::from_str(text)?;
    if file.pools.is_empty() {
        return Err(ConfigError::NoPools);
    }

    let mut seen = BTreeSet::new();
    for pool in &file.pools {
        if pool.name.trim().is_empty() {
            return Err(ConfigError::InvalidPool {
                pool: pool.name.clone(),
                message: "name must not be empty".to_string(),
            });
        }
        if !seen.insert(pool.name.as_str()) {
            return Err(ConfigError::DuplicatePool(pool.name.clone()));
        }
        if pool.max_pending == 0 {
            return Err(ConfigError::InvalidPool {
                pool: pool.name.clone(),
                message: "max_pending must be positive".to_string(),
            });
        }
        if let SchedulerConfig::FairShare { aging_per_sec } = pool.scheduler {
            if !aging_per_sec.is_finite() || aging_per_sec < 0.0 {
                return Err(ConfigError::InvalidPool {
                    pool: pool.name.clone(),
                    message: "aging_per_sec must be a non-negative number".to_string(),
                });
            }
        }
    }

    Ok(file.pools)
}
