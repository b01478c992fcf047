use std::fs::File;
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::BenchConfig;
use crate::errors::BenchError;
use crate::sampler::{ProcessSampler, SamplerPoll};
use crate::types::{Reading, RunOutcome, Sample, StderrMode};

/// Inputs of a single run.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub config_path: PathBuf,
    pub target_output_path: PathBuf,
    pub metrics_output_path: PathBuf,
    pub program: String,
}

#[derive(Debug, Clone)]
pub struct HarnessOptions {
    /// Longest single wait on the sampler between liveness checks.
    pub poll_slice: Duration,
    /// Longest time without a complete reading while the target is alive.
    pub block_timeout: Duration,
    pub grace_period: Duration,
    pub stderr: StderrMode,
    pub logical_cpus: usize,
}

impl HarnessOptions {
    pub fn from_config(config: &BenchConfig) -> Self {
        let logical_cpus = config
            .run
            .logical_cpus
            .unwrap_or_else(|| thread::available_parallelism().map(|n| n.get()).unwrap_or(1));
        Self {
            poll_slice: config.monitor.interval().min(Duration::from_millis(50)),
            block_timeout: config.monitor.block_timeout(),
            grace_period: config.run.grace_period(),
            stderr: config.run.stderr,
            logical_cpus,
        }
    }
}

/// Convert a raw percentage (100 per busy core) into a fraction of the whole
/// machine, rounded to two decimals.
pub fn normalize_cpu(cpu_percent: f64, logical_cpus: usize) -> f64 {
    let fraction = cpu_percent / 100.0 / logical_cpus.max(1) as f64;
    (fraction * 100.0).round() / 100.0
}

/// Output files of one run. Both are truncated on open and closed on drop.
pub struct RunArtifacts {
    target_output: File,
    metrics: LineWriter<File>,
    metrics_path: PathBuf,
}

impl RunArtifacts {
    pub fn open(target_output_path: &Path, metrics_path: &Path) -> Result<Self, BenchError> {
        let open = |path: &Path| {
            File::create(path).map_err(|source| BenchError::OpenOutput {
                path: path.to_path_buf(),
                source,
            })
        };
        let target_output = open(target_output_path)?;
        let metrics = LineWriter::new(open(metrics_path)?);

        Ok(Self {
            target_output,
            metrics,
            metrics_path: metrics_path.to_path_buf(),
        })
    }

    fn target_stdio(&self, path: &Path) -> Result<Stdio, BenchError> {
        self.target_output
            .try_clone()
            .map(Stdio::from)
            .map_err(|source| BenchError::OpenOutput {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Writes one complete line; `LineWriter` flushes it before returning.
    pub fn append(&mut self, sample: &Sample) -> Result<(), BenchError> {
        writeln!(self.metrics, "{}", sample.to_line()).map_err(|source| {
            BenchError::WriteMetrics {
                path: self.metrics_path.clone(),
                source,
            }
        })
    }
}

/// Kill a child and give it `grace` to be reaped. Never blocks longer than that.
pub(crate) fn terminate_child(child: &mut Child, grace: Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    if let Err(err) = child.kill() {
        debug!(pid = child.id(), error = %err, "kill failed");
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) | Err(_) => return,
            Ok(None) => thread::sleep(Duration::from_millis(5)),
        }
    }
    warn!(pid = child.id(), "child not reaped within grace period");
}

/// Launch the target on `spec.config_path`, sample it until it exits, and
/// record one metrics line per reading.
///
/// On failure the metrics file holds only the complete lines written before
/// the failure; both children are terminated before returning.
pub fn run_benchmark(
    spec: &RunSpec,
    sampler: &mut dyn ProcessSampler,
    options: &HarnessOptions,
) -> Result<RunOutcome, BenchError> {
    let mut artifacts = RunArtifacts::open(&spec.target_output_path, &spec.metrics_output_path)?;

    let stderr = match options.stderr {
        StderrMode::Inherit => Stdio::inherit(),
        StderrMode::Null => Stdio::null(),
        StderrMode::Merge => artifacts.target_stdio(&spec.target_output_path)?,
    };

    let mut target = Command::new(&spec.program)
        .arg(&spec.config_path)
        .stdin(Stdio::null())
        .stdout(artifacts.target_stdio(&spec.target_output_path)?)
        .stderr(stderr)
        .spawn()
        .map_err(|source| BenchError::LaunchTarget {
            program: spec.program.clone(),
            source,
        })?;
    let pid = target.id();
    debug!(pid, program = %spec.program, "target launched");

    if let Err(err) = sampler.attach(pid) {
        terminate_child(&mut target, options.grace_period);
        return Err(err);
    }

    let started = Instant::now();
    let result = sample_until_exit(&mut target, sampler, &mut artifacts, options, started);
    sampler.detach();

    match result {
        Ok((status, samples)) => {
            let exit_code = status.code();
            if !status.success() {
                warn!(pid, ?exit_code, "target exited unsuccessfully");
            }
            Ok(RunOutcome {
                samples,
                duration: started.elapsed(),
                exit_code,
            })
        }
        Err(err) => {
            terminate_child(&mut target, options.grace_period);
            Err(err)
        }
    }
}

fn sample_until_exit(
    target: &mut Child,
    sampler: &mut dyn ProcessSampler,
    artifacts: &mut RunArtifacts,
    options: &HarnessOptions,
    started: Instant,
) -> Result<(ExitStatus, usize), BenchError> {
    let mut samples = 0;
    let mut last_reading = Instant::now();

    loop {
        if let Some(status) = target.try_wait().map_err(BenchError::TargetWait)? {
            return Ok((status, samples));
        }

        match sampler.poll_reading(options.poll_slice) {
            Ok(SamplerPoll::Ready(reading)) => {
                let sample = to_sample(started.elapsed(), reading, options.logical_cpus);
                artifacts.append(&sample)?;
                samples += 1;
                last_reading = Instant::now();
            }
            Ok(SamplerPoll::Pending) => {
                if last_reading.elapsed() >= options.block_timeout {
                    // The target may have exited while we waited.
                    if let Some(status) = target.try_wait().map_err(BenchError::TargetWait)? {
                        return Ok((status, samples));
                    }
                    return Err(BenchError::MonitorStalled {
                        timeout_ms: options.block_timeout.as_millis(),
                    });
                }
            }
            Err(err) => {
                // Monitors commonly emit a truncated block or close once the
                // target disappears; that is the end of the run, not a failure.
                if let Some(status) = target.try_wait().map_err(BenchError::TargetWait)? {
                    debug!(error = %err, "sampler error after target exit");
                    return Ok((status, samples));
                }
                return Err(err);
            }
        }
    }
}

fn to_sample(elapsed: Duration, reading: Reading, logical_cpus: usize) -> Sample {
    Sample {
        elapsed_ms: elapsed.as_millis(),
        memory: reading.memory,
        cpu_fraction: normalize_cpu(reading.cpu_percent, logical_cpus),
    }
}


#[cfg(all(test, unix))]
mod tests {
    use std::fs;

    use super::testing::{ScriptedSampler, options, process_alive, top_block};
    use super::*;
    use crate::parse::BlockLayout;
    use crate::sampler::BlockSampler;

    struct Fixture {
        tmp: assert_fs::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                tmp: assert_fs::TempDir::new().unwrap(),
            }
        }

        /// The "target" is `sh` running the config file as a script.
        fn spec(&self, name: &str, script: &str) -> RunSpec {
            let config_path = self.tmp.path().join(format!("{}.conf", name));
            fs::write(&config_path, script).unwrap();
            RunSpec {
                config_path,
                target_output_path: self.tmp.path().join(format!("{}.out", name)),
                metrics_output_path: self.tmp.path().join(format!("{}.csv", name)),
                program: "sh".to_string(),
            }
        }
    }

    fn lines(blocks: &[(&str, &str)]) -> Vec<String> {
        blocks.iter().flat_map(|(cpu, mem)| top_block(cpu, mem)).collect()
    }

    fn metrics_rows(spec: &RunSpec) -> Vec<Vec<String>> {
        fs::read_to_string(&spec.metrics_output_path)
            .unwrap()
            .lines()
            .map(|l| l.split(',').map(String::from).collect())
            .collect()
    }

    #[test]
    fn normalizes_by_logical_cpus() {
        assert_eq!(normalize_cpu(200.0, 4), 0.5);
        assert_eq!(normalize_cpu(100.0, 3), 0.33);
        assert_eq!(normalize_cpu(0.0, 8), 0.0);
        assert_eq!(normalize_cpu(50.0, 0), 0.5);
    }

    #[test]
    fn two_busy_cores_of_four_render_as_half() {
        let reading = Reading {
            memory: "2048".to_string(),
            cpu_percent: 200.0,
        };
        let sample = to_sample(Duration::from_millis(12), reading, 4);
        assert_eq!(sample.to_line(), "12,2048,0.5");
    }

    #[test]
    fn one_sample_per_block_in_order() {
        let fx = Fixture::new();
        let spec = fx.spec("ok", "echo started\nsleep 0.3\n");
        let mut sampler = ScriptedSampler::new(lines(&[
            ("200.0", "1000"),
            ("100.0", "2000"),
            ("50.0", "3000"),
        ]));

        let outcome = run_benchmark(&spec, &mut sampler, &options()).unwrap();
        assert_eq!(outcome.samples, 3);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(sampler.attached_pid.is_some());
        assert!(sampler.detached);

        let rows = metrics_rows(&spec);
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.len() == 3));
        assert_eq!(rows[0][1..], ["1000", "0.5"]);
        assert_eq!(rows[1][1..], ["2000", "0.25"]);
        assert_eq!(rows[2][1..], ["3000", "0.13"]);

        let elapsed: Vec<u128> = rows.iter().map(|r| r[0].parse().unwrap()).collect();
        assert!(elapsed.windows(2).all(|w| w[0] <= w[1]));

        assert_eq!(fs::read_to_string(&spec.target_output_path).unwrap(), "started\n");
    }

    #[test]
    fn malformed_block_aborts_and_keeps_prefix() {
        let fx = Fixture::new();
        let spec = fx.spec("bad", "exec sleep 30\n");
        let mut input = lines(&[("100.0", "1000"), ("100.0", "1100")]);
        input.extend((0..7).map(|i| format!("header {}", i)));
        input.push("42 bench 20".to_string());
        input.push(String::new());
        let mut sampler = ScriptedSampler::new(input);

        let started = Instant::now();
        let err = run_benchmark(&spec, &mut sampler, &options()).unwrap_err();
        assert!(matches!(err, BenchError::Parse(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(sampler.detached);
        assert!(!process_alive(sampler.attached_pid.unwrap()));

        let text = fs::read_to_string(&spec.metrics_output_path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn parse_failure_kills_target_and_monitor() {
        let fx = Fixture::new();
        let spec = fx.spec("both", "exec sleep 30\n");
        let script = "echo \"$1\" > \"$2/target.pid\"\n\
                      echo $$ > \"$2/monitor.pid\"\n\
                      printf 'h\\nh\\nh\\nh\\nh\\nh\\nh\\n%s u 20\\n\\n' \"$1\"\n\
                      exec sleep 30\n";
        let mut sampler = BlockSampler::new(
            "sh".to_string(),
            vec![
                "-c".to_string(),
                script.to_string(),
                "monitor".to_string(),
                "{pid}".to_string(),
                fx.tmp.path().display().to_string(),
            ],
            Duration::from_millis(50),
            BlockLayout::default(),
            Duration::from_millis(200),
        );

        let err = run_benchmark(&spec, &mut sampler, &options()).unwrap_err();
        assert!(matches!(err, BenchError::Parse(_)));

        let read_pid = |name: &str| -> u32 {
            fs::read_to_string(fx.tmp.path().join(name)).unwrap().trim().parse().unwrap()
        };
        assert!(!process_alive(read_pid("target.pid")));
        assert!(!process_alive(read_pid("monitor.pid")));
        assert_eq!(fs::read_to_string(&spec.metrics_output_path).unwrap(), "");
    }

    #[test]
    fn stalled_monitor_fails_the_run() {
        let fx = Fixture::new();
        let spec = fx.spec("stall", "exec sleep 30\n");
        let mut sampler = ScriptedSampler::new(Vec::new());
        let opts = HarnessOptions {
            block_timeout: Duration::from_millis(100),
            ..options()
        };

        let err = run_benchmark(&spec, &mut sampler, &opts).unwrap_err();
        assert!(matches!(err, BenchError::MonitorStalled { timeout_ms: 100 }));
        assert_eq!(fs::read_to_string(&spec.metrics_output_path).unwrap(), "");
    }

    #[test]
    fn missing_target_fails_before_sampling() {
        let fx = Fixture::new();
        let mut spec = fx.spec("missing", "");
        spec.program = "/nonexistent/target-binary".to_string();
        let mut sampler = ScriptedSampler::new(lines(&[("1.0", "1")]));

        let err = run_benchmark(&spec, &mut sampler, &options()).unwrap_err();
        assert!(matches!(err, BenchError::LaunchTarget { .. }));
        assert!(sampler.attached_pid.is_none());
        assert_eq!(fs::read_to_string(&spec.metrics_output_path).unwrap(), "");
        assert_eq!(fs::read_to_string(&spec.target_output_path).unwrap(), "");
    }

    #[test]
    fn unwritable_output_fails_before_launch() {
        let fx = Fixture::new();
        let mut spec = fx.spec("nodir", "echo should-not-run > ran\n");
        spec.metrics_output_path = fx.tmp.path().join("no-such-dir").join("metrics");
        let mut sampler = ScriptedSampler::new(Vec::new());

        let err = run_benchmark(&spec, &mut sampler, &options()).unwrap_err();
        assert!(matches!(err, BenchError::OpenOutput { .. }));
        assert!(sampler.attached_pid.is_none());
    }

    #[test]
    fn rerun_truncates_previous_artifacts() {
        let fx = Fixture::new();
        let spec = fx.spec("again", "echo fresh\n");
        fs::write(&spec.metrics_output_path, "stale,stale,stale\n").unwrap();
        fs::write(&spec.target_output_path, "stale output\n").unwrap();

        let mut sampler = ScriptedSampler::new(Vec::new());
        run_benchmark(&spec, &mut sampler, &options()).unwrap();

        assert!(!fs::read_to_string(&spec.metrics_output_path).unwrap().contains("stale"));
        assert_eq!(fs::read_to_string(&spec.target_output_path).unwrap(), "fresh\n");
    }

    #[test]
    fn nonzero_exit_still_completes() {
        let fx = Fixture::new();
        let spec = fx.spec("crash", "exit 3\n");
        let mut sampler = ScriptedSampler::new(Vec::new());

        let outcome = run_benchmark(&spec, &mut sampler, &options()).unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.samples, 0);
    }

    #[test]
    fn merged_stderr_lands_in_target_output() {
        let fx = Fixture::new();
        let spec = fx.spec("merge", "echo out\necho err 1>&2\n");
        let mut sampler = ScriptedSampler::new(Vec::new());
        let opts = HarnessOptions {
            stderr: StderrMode::Merge,
            ..options()
        };

        run_benchmark(&spec, &mut sampler, &opts).unwrap();
        let output = fs::read_to_string(&spec.target_output_path).unwrap();
        assert!(output.contains("out\n"));
        assert!(output.contains("err\n"));
    }

    #[test]
    fn sampler_error_after_target_exit_ends_normally() {
        struct FailingSampler;
        impl ProcessSampler for FailingSampler {
            fn attach(&mut self, _pid: u32) -> Result<(), BenchError> {
                Ok(())
            }
            fn poll_reading(&mut self, _slice: Duration) -> Result<SamplerPoll, BenchError> {
                thread::sleep(Duration::from_millis(100));
                Err(BenchError::MonitorExited)
            }
            fn detach(&mut self) {}
        }

        let fx = Fixture::new();
        let spec = fx.spec("race", "exit 0\n");
        let outcome = run_benchmark(&spec, &mut FailingSampler, &options()).unwrap();
        assert_eq!(outcome.samples, 0);
    }

    #[test]
    fn attach_failure_terminates_target() {
        struct RefusingSampler {
            pid: Option<u32>,
        }
        impl ProcessSampler for RefusingSampler {
            fn attach(&mut self, pid: u32) -> Result<(), BenchError> {
                self.pid = Some(pid);
                Err(BenchError::LaunchMonitor {
                    program: "top".to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                })
            }
            fn poll_reading(&mut self, _slice: Duration) -> Result<SamplerPoll, BenchError> {
                unreachable!()
            }
            fn detach(&mut self) {}
        }

        let fx = Fixture::new();
        let spec = fx.spec("orphan", "exec sleep 30\n");
        let mut sampler = RefusingSampler { pid: None };
        let err = run_benchmark(&spec, &mut sampler, &options()).unwrap_err();
        assert!(matches!(err, BenchError::LaunchMonitor { .. }));
        assert!(!process_alive(sampler.pid.unwrap()));
    }
}
