use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sweepbench::config::{self, BenchConfig};
use sweepbench::display;
use sweepbench::harness::HarnessOptions;
use sweepbench::sampler::build_sampler;
use sweepbench::sweep::{self, RunLayout};
use sweepbench::types::{OutputNaming, SamplerBackend, StderrMode, SweepReport};

#[derive(Parser)]
#[command(
    name = "sweepbench",
    version,
    about = "Run a program across a configuration sweep and record CPU/memory time series"
)]
struct Cli {
    /// Directory holding one configuration file per identifier
    configs_dir: PathBuf,

    /// Directory receiving the target's standard output per run
    output_dir: PathBuf,

    /// Directory receiving the metrics time series per run
    metrics_dir: PathBuf,

    /// Program under test; invoked as `<program> <config-file>`
    program: String,

    /// TOML file with [sweep], [monitor] and [run] sections
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long = "variant")]
    variants: Vec<String>,

    #[arg(long = "count")]
    counts: Vec<u32>,

    #[arg(long = "shape")]
    shapes: Vec<String>,

    #[arg(long)]
    iterations: Option<u32>,

    #[arg(long)]
    backend: Option<SamplerBackend>,

    #[arg(long)]
    interval_ms: Option<u64>,

    #[arg(long)]
    block_timeout_ms: Option<u64>,

    #[arg(long)]
    naming: Option<OutputNaming>,

    #[arg(long)]
    stderr: Option<StderrMode>,

    /// Stop the sweep at the first failed run
    #[arg(long)]
    fail_fast: bool,

    #[arg(long)]
    json: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut BenchConfig) {
        if !self.variants.is_empty() {
            config.sweep.variants = self.variants.clone();
        }
        if !self.counts.is_empty() {
            config.sweep.counts = self.counts.clone();
        }
        if !self.shapes.is_empty() {
            config.sweep.shapes = self.shapes.clone();
        }
        if let Some(n) = self.iterations {
            config.sweep.iterations = n;
        }
        if let Some(backend) = self.backend {
            config.monitor.backend = backend;
        }
        if let Some(ms) = self.interval_ms {
            config.monitor.interval_ms = ms;
        }
        if let Some(ms) = self.block_timeout_ms {
            config.monitor.block_timeout_ms = ms;
        }
        if let Some(naming) = self.naming {
            config.run.naming = naming;
        }
        if let Some(stderr) = self.stderr {
            config.run.stderr = stderr;
        }
        if self.fail_fast {
            config.run.fail_fast = true;
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .init();
}

fn run() -> Result<SweepReport> {
    let cli = Cli::parse();
    init_logging();

    let mut bench_config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => BenchConfig::default(),
    };
    cli.apply_overrides(&mut bench_config);
    config::validate(
        &bench_config,
        cli.config.as_deref().unwrap_or(Path::new("<command line>")),
    )?;

    let entries = sweep::enumerate(&bench_config.sweep);
    let planned = sweep::plan_runs(&cli.configs_dir, entries);

    let layout = RunLayout {
        output_dir: cli.output_dir.clone(),
        metrics_dir: cli.metrics_dir.clone(),
        program: cli.program.clone(),
        naming: bench_config.run.naming,
        fail_fast: bench_config.run.fail_fast,
    };
    let options = HarnessOptions::from_config(&bench_config);
    let monitor = bench_config.monitor.clone();
    let grace = bench_config.run.grace_period();

    let report = sweep::run_sweep(&layout, &planned, &options, || {
        build_sampler(&monitor, grace)
    })?;

    let output = if cli.json {
        display::format_json(&report)
    } else {
        display::format_default(&report)
    };
    print!("{}", output);

    Ok(report)
}

fn main() {
    match run() {
        Ok(report) if report.failed() > 0 => process::exit(1),
        Ok(_) => {}
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    }
}
