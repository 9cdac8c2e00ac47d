//! CLI configuration.
//!
//! Settings come from `config.json` in the user's config directory; the
//! environment and command-line flags override them.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.json";

fn config_dir() -> Result<PathBuf> {
    ProjectDirs::from("dev", "gantry", "gantry")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Master base URL.
    #[serde(default = "default_master_url")]
    pub master_url: String,

    /// Requester name sent with submissions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,
}

fn default_master_url() -> String {
    std::env::var("GANTRY_MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            master_url: default_master_url(),
            requester: None,
        }
    }
}

impl Config {
    /// Load config from disk, or return the default.
    pub fn load() -> Result<Self> {
        let path = config_dir()?.join(CONFIG_FILE);

        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {:?}", path))
    }

    pub fn master_url(&self) -> &str {
        &self.master_url
    }
}
