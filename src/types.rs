use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// `{variant}_{count}_{shape}` key naming one configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConfigIdentifier(String);

impl ConfigIdentifier {
    pub fn new(variant: &str, count: u32, shape: &str) -> Self {
        Self(format!("{}_{}_{}", variant, count, shape))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One position in the sweep, before the filesystem is consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepEntry {
    pub iteration: u32,
    pub identifier: ConfigIdentifier,
}

/// Raw values extracted from one monitor cycle, not yet normalised.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub memory: String,
    pub cpu_percent: f64,
}

/// One row of a metrics file.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub elapsed_ms: u128,
    pub memory: String,
    pub cpu_fraction: f64,
}

impl Sample {
    /// Renders the `elapsed_ms,memory,cpu_fraction` metrics line, without newline.
    pub fn to_line(&self) -> String {
        format!(
            "{},{},{}",
            self.elapsed_ms,
            self.memory,
            format_cpu_fraction(self.cpu_fraction)
        )
    }
}

/// Shortest decimal form, always with a fractional digit: `0.5`, `1.0`, `0.33`.
pub fn format_cpu_fraction(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

/// Successful end of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub samples: usize,
    pub duration: Duration,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed {
        samples: usize,
        duration_ms: u128,
        exit_code: Option<i32>,
    },
    Failed {
        reason: String,
    },
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub iteration: u32,
    pub identifier: ConfigIdentifier,
    pub target_output: Option<PathBuf>,
    pub metrics_output: Option<PathBuf>,
    #[serde(flatten)]
    pub status: RunStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub runs: Vec<RunReport>,
}

impl SweepReport {
    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, RunStatus::Failed { .. }))
    }

    pub fn completed(&self) -> usize {
        self.count(|s| matches!(s, RunStatus::Completed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, RunStatus::Skipped))
    }

    fn count(&self, pred: impl Fn(&RunStatus) -> bool) -> usize {
        self.runs.iter().filter(|r| pred(&r.status)).count()
    }
}

/// How run artifacts are named inside the output and metrics directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputNaming {
    /// `{identifier}_{iteration}`
    #[default]
    Identifier,
    /// 1-based ordinal among runs that were not skipped
    Sequential,
}

/// Where the target's standard error goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    #[default]
    Inherit,
    Null,
    /// Into the target-output artifact alongside stdout
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerBackend {
    /// External `top`-style monitor parsed block by block
    #[default]
    Top,
    /// In-process sampling through the OS process table
    Sysinfo,
}
