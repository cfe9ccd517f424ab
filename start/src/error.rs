//! Error types for the ukmsdn supervisor.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while launching a managed process.
///
/// None of these are retried by the launcher itself; the supervisor loop
/// decides whether another attempt is made.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// The command path does not resolve to an executable file
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),

    /// The OS refused to spawn the process
    #[error("Failed to spawn {command}: {reason}")]
    SpawnFailed { command: String, reason: String },

    /// A pre-start command exited unsuccessfully
    #[error("Pre-start command failed: {command}: {reason}")]
    PreStartFailed { command: String, reason: String },

    /// Start requested while the supervisor is shutting down
    #[error("Supervisor is shutting down")]
    ShuttingDown,
}

/// Errors raised while stopping a managed process.
#[derive(Error, Debug)]
pub enum StopError {
    /// The process group survived SIGKILL for the whole kill window
    #[error("Process {pid} was not reaped within {waited:?} after SIGKILL")]
    Timeout { pid: u32, waited: Duration },

    /// Delivering a signal failed for a reason other than the process being gone
    #[error("Failed to signal process group {pgid}: {source}")]
    Signal {
        pgid: u32,
        #[source]
        source: nix::Error,
    },
}

/// Errors raised by an individual health probe.
///
/// These never abort supervision: the checker folds them into an
/// unhealthy verdict.
#[derive(Error, Debug)]
pub enum HealthCheckError {
    /// The service has no tracked process
    #[error("no process is running")]
    NotRunning,

    /// The tracked process has exited
    #[error("process {pid} exited ({status})")]
    Exited { pid: u32, status: String },

    /// The PID now belongs to a different program
    #[error("pid {pid} now runs {actual:?}, expected {expected:?}")]
    PidReused {
        pid: u32,
        expected: String,
        actual: String,
    },

    /// Nothing listens on the port
    #[error("tcp port {0} is not listening")]
    PortNotListening(u16),

    /// Socket file missing or not a socket
    #[error("socket {0} is not available")]
    SocketMissing(PathBuf),

    /// Probe command exited non-zero
    #[error("probe `{command}` exited with {code:?}")]
    NonZeroExit { command: String, code: Option<i32> },

    /// Probe command did not finish in time
    #[error("probe `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// The probe itself could not run
    #[error("probe could not run: {0}")]
    Io(#[from] std::io::Error),

    /// The probe could not launch its command
    #[error("probe could not launch: {0}")]
    Launch(#[from] LaunchError),
}

/// Errors raised by the event log.
#[derive(Error, Debug)]
pub enum EventLogError {
    /// Writing or syncing the log failed
    #[error("Failed to write event log {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading the log back failed
    #[error("Failed to read event log {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stored line is not a valid event
    #[error("Corrupt event at {path}:{line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// Encoding an event failed
    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error in {path}: {source}")]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("No services configured")]
    NoServices,

    #[error("Duplicate service name: {0}")]
    DuplicateService(String),
}

/// Errors that can occur in the supervisor.
#[derive(Error, Debug)]
pub enum Error {
    /// Service not found
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// Service already exists
    #[error("Service already exists: {0}")]
    ServiceAlreadyExists(String),

    /// Launch failure
    #[error("Service {name} failed to start: {source}")]
    Launch {
        name: String,
        #[source]
        source: LaunchError,
    },

    /// Stop failure
    #[error("Service {name} failed to stop: {source}")]
    Stop {
        name: String,
        #[source]
        source: StopError,
    },

    /// Restart budget exhausted
    #[error("Service {name} exceeded {max_restarts} restarts within {window:?}")]
    RestartBudgetExceeded {
        name: String,
        max_restarts: u32,
        window: Duration,
    },

    /// Event log failure; fatal to the supervisor
    #[error(transparent)]
    EventLog(#[from] EventLogError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Control channel error
    #[error("Control channel error: {0}")]
    Control(String),

    /// Signal handling error
    #[error("Signal error: {0}")]
    SignalError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Nix error
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),
}

impl Error {
    /// Whether this error must bring the supervisor down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::EventLog(_))
    }
}
