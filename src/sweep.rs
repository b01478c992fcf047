use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Deserialize;
use tracing::{error, info};

use crate::errors::BenchError;
use crate::harness::{HarnessOptions, RunSpec, run_benchmark};
use crate::sampler::ProcessSampler;
use crate::types::{
    ConfigIdentifier, OutputNaming, RunReport, RunStatus, SweepEntry, SweepReport,
};

/// Axis values of a sweep. Supplied by the caller; nothing here is global.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepConfig {
    pub variants: Vec<String>,
    pub counts: Vec<u32>,
    pub shapes: Vec<String>,
    pub iterations: u32,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            variants: ["default", "server_none", "server_1", "server_3"]
                .into_iter()
                .map(String::from)
                .collect(),
            counts: vec![500, 1000, 2000, 4000, 8000],
            shapes: ["ball", "capsule", "cuboid", "complex"]
                .into_iter()
                .map(String::from)
                .collect(),
            iterations: 1,
        }
    }
}

/// Cartesian product of the axes: iteration-major, then variant, count, shape.
pub fn enumerate(config: &SweepConfig) -> Vec<SweepEntry> {
    let mut entries = Vec::with_capacity(
        config.iterations as usize
            * config.variants.len()
            * config.counts.len()
            * config.shapes.len(),
    );

    for iteration in 0..config.iterations {
        for variant in &config.variants {
            for &count in &config.counts {
                for shape in &config.shapes {
                    entries.push(SweepEntry {
                        iteration,
                        identifier: ConfigIdentifier::new(variant, count, shape),
                    });
                }
            }
        }
    }

    entries
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Ready,
    Missing,
}

/// A sweep entry resolved against the configs directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEntry {
    pub entry: SweepEntry,
    pub config_path: PathBuf,
    pub availability: Availability,
}

/// Resolve each entry to `{configs_dir}/{identifier}`. Only regular files count.
pub fn plan_runs(configs_dir: &Path, entries: Vec<SweepEntry>) -> Vec<PlannedEntry> {
    entries
        .into_iter()
        .map(|entry| {
            let config_path = configs_dir.join(entry.identifier.as_str());
            let availability = if config_path.is_file() {
                Availability::Ready
            } else {
                Availability::Missing
            };
            PlannedEntry {
                entry,
                config_path,
                availability,
            }
        })
        .collect()
}

/// Directories and program shared by every run of a sweep.
#[derive(Debug, Clone)]
pub struct RunLayout {
    pub output_dir: PathBuf,
    pub metrics_dir: PathBuf,
    pub program: String,
    pub naming: OutputNaming,
    pub fail_fast: bool,
}

impl RunLayout {
    /// File name shared by both artifacts of a run. `ordinal` is 1-based.
    pub fn artifact_name(&self, entry: &SweepEntry, ordinal: usize) -> String {
        match self.naming {
            OutputNaming::Identifier => format!("{}_{}", entry.identifier, entry.iteration),
            OutputNaming::Sequential => ordinal.to_string(),
        }
    }

    fn ensure_dirs(&self) -> Result<(), BenchError> {
        for dir in [&self.output_dir, &self.metrics_dir] {
            std::fs::create_dir_all(dir).map_err(|source| BenchError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

/// Run every available entry in order, one at a time.
///
/// A run failure is recorded and the sweep moves on unless `fail_fast` is set.
/// Missing configs are recorded as skipped and produce no files.
pub fn run_sweep<F>(
    layout: &RunLayout,
    planned: &[PlannedEntry],
    options: &HarnessOptions,
    mut make_sampler: F,
) -> Result<SweepReport, BenchError>
where
    F: FnMut() -> Box<dyn ProcessSampler>,
{
    layout.ensure_dirs()?;

    let started_at = Utc::now();
    let mut runs = Vec::with_capacity(planned.len());
    let mut ordinal = 0;

    for planned_entry in planned {
        let entry = &planned_entry.entry;

        if planned_entry.availability == Availability::Missing {
            info!(
                config = %planned_entry.config_path.display(),
                "skipping missing config"
            );
            runs.push(RunReport {
                iteration: entry.iteration,
                identifier: entry.identifier.clone(),
                target_output: None,
                metrics_output: None,
                status: RunStatus::Skipped,
            });
            continue;
        }

        ordinal += 1;
        let name = layout.artifact_name(entry, ordinal);
        let spec = RunSpec {
            config_path: planned_entry.config_path.clone(),
            target_output_path: layout.output_dir.join(&name),
            metrics_output_path: layout.metrics_dir.join(&name),
            program: layout.program.clone(),
        };

        info!(
            config = %entry.identifier,
            iteration = entry.iteration,
            "running config"
        );

        let mut sampler = make_sampler();
        let status = match run_benchmark(&spec, sampler.as_mut(), options) {
            Ok(outcome) => RunStatus::Completed {
                samples: outcome.samples,
                duration_ms: outcome.duration.as_millis(),
                exit_code: outcome.exit_code,
            },
            Err(err) => {
                error!(
                    config = %entry.identifier,
                    iteration = entry.iteration,
                    error = %err,
                    "run failed"
                );
                RunStatus::Failed {
                    reason: err.to_string(),
                }
            }
        };
        let failed = matches!(status, RunStatus::Failed { .. });

        runs.push(RunReport {
            iteration: entry.iteration,
            identifier: entry.identifier.clone(),
            target_output: Some(spec.target_output_path),
            metrics_output: Some(spec.metrics_output_path),
            status,
        });

        if failed && layout.fail_fast {
            info!("stopping sweep after failed run");
            break;
        }
    }

    Ok(SweepReport {
        started_at,
        finished_at: Utc::now(),
        runs,
    })
}
