use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum BenchError {
    #[error("Failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {detail}")]
    ConfigParse { path: PathBuf, detail: String },

    #[error("Cannot open output file {path}: {source}")]
    OpenOutput {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to launch target '{program}': {source}")]
    LaunchTarget {
        program: String,
        source: std::io::Error,
    },

    #[error("Failed to launch monitor '{program}': {source}")]
    LaunchMonitor {
        program: String,
        source: std::io::Error,
    },

    #[error("Monitor output ended while the target was still running")]
    MonitorExited,

    #[error("Monitor produced no complete block within {timeout_ms}ms")]
    MonitorStalled { timeout_ms: u128 },

    #[error("Failed to read monitor output: {0}")]
    MonitorRead(std::io::Error),

    #[error("Process {pid} is no longer visible to the sampler")]
    ProcessGone { pid: u32 },

    #[error("Sampler used before being attached to a process")]
    NotAttached,

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Failed to poll target process: {0}")]
    TargetWait(std::io::Error),

    #[error("Failed to write metrics file {path}: {source}")]
    WriteMetrics {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A monitor block that does not carry the expected fields.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Monitor block {block}: expected at least {expected} fields, found {found}")]
    MissingField {
        block: u64,
        expected: usize,
        found: usize,
    },

    #[error("Monitor block {block}: invalid CPU value '{token}'")]
    InvalidCpu { block: u64, token: String },
}
