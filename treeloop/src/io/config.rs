//! Engine configuration stored as TOML.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Engine configuration (TOML).
///
/// Missing fields fall back to the defaults below, so an empty file is a
/// valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// How long an approval request waits before it is treated as rejected.
    /// Zero means requests time out immediately.
    pub approval_timeout_secs: u64,

    /// Upper bound on nodes processed for a single user message.
    pub max_iterations: u32,

    /// Stubs at this depth are executed directly instead of being expanded.
    pub max_depth: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            approval_timeout_secs: 300,
            max_iterations: 100,
            max_depth: 8,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.max_depth == 0 {
            return Err(anyhow!("max_depth must be > 0"));
        }
        Ok(())
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }
}

/// Read and validate the config at `path`. A missing file yields defaults.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let config = match fs::read_to_string(path) {
        Ok(text) => toml::from_str::<EngineConfig>(&text)
            .with_context(|| format!("parse {}", path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => EngineConfig::default(),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    config
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

/// Write `config` as TOML, replacing the file in one rename.
pub fn write_config(path: &Path, config: &EngineConfig) -> Result<()> {
    config.validate()?;
    let text = toml::to_string_pretty(config).context("serialize engine config")?;
    super::write_atomic(path, &format!("{text}\n"))
}
