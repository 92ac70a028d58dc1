//! Driver settings.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::glfs::GlfsLogLevel;

/// Driver-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Destination of the client library's own log, `-` for stderr.
    pub log_file: String,
    /// Severity threshold of the client library's own log.
    pub log_level: GlfsLogLevel,
    /// Worker threads of the in-process client.
    pub mock_workers: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            log_file: String::from("-"),
            log_level: GlfsLogLevel::Error,
            mock_workers: 2,
        }
    }
}

impl DriverConfig {
    /// Loads settings from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }
}
