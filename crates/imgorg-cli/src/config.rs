use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use imgorg_core::TransferMode;

/// Settings read from a `--config` TOML file. Every key is optional; command
/// line flags win over anything set here.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub source: Option<PathBuf>,
    #[serde(alias = "target")]
    pub dest: Option<PathBuf>,
    pub template: Option<String>,
    pub dry_run: Option<bool>,
    pub workers: Option<usize>,
    pub seed_from_destination: Option<bool>,
    pub mode: Option<TransferMode>,
    pub retry_backoff_ms: Option<u64>,
    pub max_suffix: Option<u32>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }
}
