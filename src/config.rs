//! Configuration structures and defaults for the Lumen server binary.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use lumen_jobs::{MediaConfig, WorkerPoolConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8420,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageSection {
    /// Directory holding one SQLite file per tenant.
    pub db_root: PathBuf,
    /// Root of the per-tenant project folder trees.
    pub projects_root: PathBuf,
    pub tenant: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_root: PathBuf::from("data/db"),
            projects_root: PathBuf::from("data/projects"),
            tenant: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MaintenanceSection {
    pub rotation_check_interval_secs: u64,
}

impl Default for MaintenanceSection {
    fn default() -> Self {
        Self {
            rotation_check_interval_secs:
                lumen_jobs::maintenance::DEFAULT_ROTATION_CHECK_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OrchestratorSection {
    /// Successor fan-out cap per terminal event.
    pub fanout_width: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self { fanout_width: 8 }
    }
}

/// Full server configuration. Unknown fields anywhere are a startup error,
/// not a silent ignore.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LumenConfig {
    pub server: ServerSection,
    pub storage: StorageSection,
    pub workers: WorkerPoolConfig,
    pub media: MediaConfig,
    pub maintenance: MaintenanceSection,
    pub orchestrator: OrchestratorSection,
}

impl LumenConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let config: LumenConfig = toml::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }
}
