use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::debug;

use crate::config::MonitorConfig;
use crate::errors::BenchError;
use crate::harness::terminate_child;
use crate::parse::{BlockLayout, BlockParser};
use crate::types::{Reading, SamplerBackend};

/// Result of one bounded wait for the next reading.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplerPoll {
    Ready(Reading),
    /// No complete reading within the slice.
    Pending,
}

/// Source of CPU/memory readings for a single process.
///
/// One sampler serves exactly one run: `attach` once, poll until the target
/// exits, then `detach`.
pub trait ProcessSampler {
    fn attach(&mut self, pid: u32) -> Result<(), BenchError>;

    /// Waits at most roughly `slice` for the next complete reading.
    fn poll_reading(&mut self, slice: Duration) -> Result<SamplerPoll, BenchError>;

    /// Tears down the session. Must not block longer than a short grace period.
    fn detach(&mut self);
}

/// Builds a fresh sampler for one run from the monitor settings.
pub fn build_sampler(config: &MonitorConfig, grace_period: Duration) -> Box<dyn ProcessSampler> {
    match config.backend {
        SamplerBackend::Top => Box::new(BlockSampler::new(
            config.program.clone(),
            config.args.clone(),
            config.interval(),
            config.layout,
            grace_period,
        )),
        SamplerBackend::Sysinfo => Box::new(SysinfoSampler::new(config.interval())),
    }
}

struct MonitorSession {
    child: Child,
    lines: Receiver<std::io::Result<String>>,
}

/// Drives an external monitor tool and parses its fixed-layout text blocks.
pub struct BlockSampler {
    program: String,
    args: Vec<String>,
    interval: Duration,
    grace_period: Duration,
    parser: BlockParser,
    session: Option<MonitorSession>,
}

impl BlockSampler {
    pub fn new(
        program: String,
        args: Vec<String>,
        interval: Duration,
        layout: BlockLayout,
        grace_period: Duration,
    ) -> Self {
        Self {
            program,
            args,
            interval,
            grace_period,
            parser: BlockParser::new(layout),
            session: None,
        }
    }

    fn expand_args(&self, pid: u32) -> Vec<String> {
        let interval = format!("{}", self.interval.as_secs_f64());
        let pid = pid.to_string();
        self.args
            .iter()
            .map(|a| a.replace("{pid}", &pid).replace("{interval}", &interval))
            .collect()
    }
}

impl ProcessSampler for BlockSampler {
    fn attach(&mut self, pid: u32) -> Result<(), BenchError> {
        let args = self.expand_args(pid);
        debug!(program = %self.program, ?args, "launching monitor");

        let mut child = Command::new(&self.program)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| BenchError::LaunchMonitor {
                program: self.program.clone(),
                source,
            })?;

        let Some(stdout) = child.stdout.take() else {
            terminate_child(&mut child, self.grace_period);
            return Err(BenchError::MonitorExited);
        };

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let failed = line.is_err();
                if tx.send(line).is_err() || failed {
                    break;
                }
            }
        });

        self.session = Some(MonitorSession { child, lines: rx });
        Ok(())
    }

    fn poll_reading(&mut self, slice: Duration) -> Result<SamplerPoll, BenchError> {
        let session = self.session.as_ref().ok_or(BenchError::NotAttached)?;
        let deadline = Instant::now() + slice;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match session.lines.recv_timeout(remaining) {
                Ok(Ok(line)) => {
                    if let Some(reading) = self.parser.feed(&line)? {
                        return Ok(SamplerPoll::Ready(reading));
                    }
                }
                Ok(Err(err)) => return Err(BenchError::MonitorRead(err)),
                Err(RecvTimeoutError::Timeout) => return Ok(SamplerPoll::Pending),
                Err(RecvTimeoutError::Disconnected) => return Err(BenchError::MonitorExited),
            }
        }
    }

    fn detach(&mut self) {
        if let Some(mut session) = self.session.take() {
            debug!(
                program = %self.program,
                blocks = self.parser.blocks(),
                "terminating monitor"
            );
            terminate_child(&mut session.child, self.grace_period);
        }
    }
}

impl Drop for BlockSampler {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Samples through the OS process table instead of a helper process.
///
/// Memory is reported in KiB to line up with `top`'s RES column; CPU percent
/// follows the same convention of exceeding 100 across several cores.
pub struct SysinfoSampler {
    interval: Duration,
    system: System,
    pid: Option<Pid>,
    next_due: Instant,
}

impl SysinfoSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            system: System::new(),
            pid: None,
            next_due: Instant::now(),
        }
    }
}

impl ProcessSampler for SysinfoSampler {
    fn attach(&mut self, pid: u32) -> Result<(), BenchError> {
        let pid = Pid::from_u32(pid);
        // CPU usage is a delta between refreshes, so prime the first one.
        self.system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        self.pid = Some(pid);
        self.next_due = Instant::now() + self.interval;
        Ok(())
    }

    fn poll_reading(&mut self, slice: Duration) -> Result<SamplerPoll, BenchError> {
        let pid = self.pid.ok_or(BenchError::NotAttached)?;

        let now = Instant::now();
        if now < self.next_due {
            thread::sleep((self.next_due - now).min(slice));
            if Instant::now() < self.next_due {
                return Ok(SamplerPoll::Pending);
            }
        }

        self.system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        // An exited but unreaped target still has a table entry with no memory.
        let process = self
            .system
            .process(pid)
            .filter(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            .ok_or(BenchError::ProcessGone { pid: pid.as_u32() })?;

        let reading = Reading {
            memory: (process.memory() / 1024).to_string(),
            cpu_percent: f64::from(process.cpu_usage()),
        };
        self.next_due += self.interval;
        Ok(SamplerPoll::Ready(reading))
    }

    fn detach(&mut self) {
        self.pid = None;
    }
}
