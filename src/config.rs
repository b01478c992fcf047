use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::errors::BenchError;
use crate::parse::BlockLayout;
use crate::sweep::SweepConfig;
use crate::types::{OutputNaming, SamplerBackend, StderrMode};

/// Everything a sweep needs besides the four positional paths.
///
/// Every field has a default, so an empty file (or no file) is valid.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchConfig {
    pub sweep: SweepConfig,
    pub monitor: MonitorConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub backend: SamplerBackend,
    pub program: String,
    /// `{pid}` and `{interval}` (seconds) are substituted per run.
    pub args: Vec<String>,
    pub interval_ms: u64,
    pub block_timeout_ms: u64,
    pub layout: BlockLayout,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            backend: SamplerBackend::Top,
            program: "top".to_string(),
            args: ["-b", "-p", "{pid}", "-d", "{interval}"]
                .into_iter()
                .map(String::from)
                .collect(),
            interval_ms: 50,
            block_timeout_ms: 2000,
            layout: BlockLayout::default(),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub naming: OutputNaming,
    pub stderr: StderrMode,
    pub fail_fast: bool,
    /// Overrides the detected logical CPU count used to normalise CPU usage.
    pub logical_cpus: Option<usize>,
    pub grace_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            naming: OutputNaming::Identifier,
            stderr: StderrMode::Inherit,
            fail_fast: false,
            logical_cpus: None,
            grace_ms: 200,
        }
    }
}

impl RunConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

pub fn parse_config(text: &str, path: &Path) -> Result<BenchConfig> {
    let config: BenchConfig = toml::from_str(text).map_err(|e| BenchError::ConfigParse {
        path: path.to_path_buf(),
        detail: e.message().to_string(),
    })?;
    validate(&config, path)?;
    Ok(config)
}

/// Read and validate a TOML configuration file.
pub fn load_config(path: &Path) -> Result<BenchConfig> {
    let text = std::fs::read_to_string(path).map_err(|source| BenchError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&text, path)
}

pub fn validate(config: &BenchConfig, path: &Path) -> Result<()> {
    let invalid = |detail: &str| BenchError::ConfigParse {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    };

    if config.monitor.interval_ms == 0 {
        return Err(invalid("monitor.interval_ms must be greater than zero").into());
    }
    if config.monitor.block_timeout_ms < config.monitor.interval_ms {
        return Err(
            invalid("monitor.block_timeout_ms must not be shorter than monitor.interval_ms").into(),
        );
    }
    if config.monitor.program.trim().is_empty() {
        return Err(invalid("monitor.program must not be empty").into());
    }
    if config.run.logical_cpus == Some(0) {
        return Err(invalid("run.logical_cpus must be greater than zero").into());
    }
    Ok(())
}
