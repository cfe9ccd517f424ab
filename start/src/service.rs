//! Service definition types and states for the supervisor.

use crate::error::ConfigError;
use crate::process::RunningProcess;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Lifecycle state of a managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceState {
    /// No process; waiting to be started
    Stopped,
    /// Process launched, settling before the first health check
    Starting,
    /// Process running and passing its health checks
    Running,
    /// Process running but the last health poll failed
    Unhealthy,
    /// Process being replaced
    Restarting,
    /// Supervisor shutdown in progress for this service
    ShuttingDown,
    /// Restart budget exhausted; only an operator reset recovers it
    Failed,
}

impl Default for ServiceState {
    fn default() -> Self {
        ServiceState::Stopped
    }
}

impl ServiceState {
    /// States in which the supervisor owns exactly one process.
    pub fn has_process(&self) -> bool {
        matches!(
            self,
            ServiceState::Starting
                | ServiceState::Running
                | ServiceState::Unhealthy
                | ServiceState::Restarting
        )
    }

    /// States the supervisor never leaves on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Failed)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Unhealthy => write!(f, "unhealthy"),
            ServiceState::Restarting => write!(f, "restarting"),
            ServiceState::ShuttingDown => write!(f, "shutting-down"),
            ServiceState::Failed => write!(f, "failed"),
        }
    }
}

/// One health check in a service's ordered check list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum HealthCheck {
    /// Tracked PID still exists and runs the expected program
    Liveness,
    /// A TCP port is in the LISTEN state on this host
    Port {
        port: u16,
        #[serde(default = "default_probe_host")]
        host: String,
    },
    /// A unix socket file exists
    Socket { path: PathBuf },
    /// A read-only diagnostic command exits zero
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_probe_timeout", with = "duration_secs")]
        timeout: Duration,
    },
}

fn default_probe_host() -> String {
    "127.0.0.1".to_string()
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(10)
}

impl HealthCheck {
    /// Relative cost used to run cheap checks before expensive ones.
    pub fn cost(&self) -> u8 {
        match self {
            HealthCheck::Liveness => 0,
            HealthCheck::Socket { .. } => 1,
            HealthCheck::Port { .. } => 2,
            HealthCheck::Command { .. } => 3,
        }
    }

    /// Port check against localhost.
    pub fn port(port: u16) -> Self {
        HealthCheck::Port {
            port,
            host: default_probe_host(),
        }
    }

    /// Functional probe with the default timeout.
    pub fn command(command: impl Into<String>, args: &[&str]) -> Self {
        HealthCheck::Command {
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout: default_probe_timeout(),
        }
    }
}

impl std::fmt::Display for HealthCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthCheck::Liveness => write!(f, "liveness"),
            HealthCheck::Port { port, .. } => write!(f, "port:{}", port),
            HealthCheck::Socket { path } => write!(f, "socket:{}", path.display()),
            HealthCheck::Command { command, .. } => write!(f, "command:{}", command),
        }
    }
}

/// Maximum restarts allowed inside a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartBudget {
    pub max_restarts: u32,
    #[serde(with = "duration_secs")]
    pub window: Duration,
}

impl RestartBudget {
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts,
            window,
        }
    }
}

/// Service definition - how to run and probe one daemon.
///
/// Immutable once registered with a supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Unique name of the service
    pub name: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Program to execute (absolute path or looked up on PATH)
    pub command: String,
    /// Program arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory
    pub working_directory: Option<PathBuf>,
    /// Shell commands run to completion before every launch
    #[serde(default)]
    pub exec_start_pre: Vec<String>,
    /// Stale runtime files removed before every launch
    #[serde(default)]
    pub remove_before_start: Vec<PathBuf>,
    /// Grace period override for this service
    #[serde(default, with = "option_duration_secs")]
    pub stop_timeout: Option<Duration>,
    /// Output log override (defaults to `<log_dir>/<name>.log`)
    pub log_file: Option<PathBuf>,
    /// Extra environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Ordered health checks; all must pass
    #[serde(default = "default_health")]
    pub health: Vec<HealthCheck>,
}

fn default_health() -> Vec<HealthCheck> {
    vec![HealthCheck::Liveness]
}

impl ServiceDefinition {
    /// Create a new service definition with minimal configuration.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            command: command.into(),
            args: Vec::new(),
            working_directory: None,
            exec_start_pre: Vec::new(),
            remove_before_start: Vec::new(),
            stop_timeout: None,
            log_file: None,
            env: BTreeMap::new(),
            health: default_health(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Append a health check after the existing ones.
    pub fn with_health_check(mut self, check: HealthCheck) -> Self {
        self.health.push(check);
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }

    pub fn with_pre_start(mut self, command: impl Into<String>) -> Self {
        self.exec_start_pre.push(command.into());
        self
    }

    /// Human readable command line.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Check the definition is usable.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "service.name".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.name.contains('/') {
            return Err(ConfigError::Invalid {
                key: format!("service.{}.name", self.name),
                reason: "must not contain '/'".to_string(),
            });
        }
        if self.command.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: format!("service.{}.command", self.name),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Serialize as a standalone TOML document.
    pub fn to_toml(&self) -> std::result::Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Duration fields stored as (fractional) seconds.
pub(crate) mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<f64>::deserialize(deserializer)?;
        secs.map(|s| Duration::try_from_secs_f64(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Runtime bookkeeping for one managed service.
///
/// The process handle is the only source of the PID, so `pid()` is `None`
/// exactly when no process is owned.
#[derive(Debug)]
pub struct ServiceInstance {
    /// Unique instance ID
    pub id: Uuid,
    /// Service name
    pub name: String,
    /// Current state
    pub state: ServiceState,
    /// Owned process, if any
    pub process: Option<RunningProcess>,
    /// Process whose stop timed out; its group is killed again before reuse
    pub leaked: Option<RunningProcess>,
    /// Time the current process was launched
    pub started_at: Option<DateTime<Utc>>,
    /// Time the service last stopped
    pub stopped_at: Option<DateTime<Utc>>,
    /// Total restarts since startup or the last reset
    pub restart_count: u32,
    /// Time of the last restart
    pub last_restart_at: Option<DateTime<Utc>>,
    /// Restart instants inside the budget window
    restart_window: VecDeque<Instant>,
    /// Consecutive failed health polls
    pub consecutive_failures: u32,
    /// Last failure reason
    pub failure_reason: Option<String>,
}

impl ServiceInstance {
    /// Create a new service instance.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            state: ServiceState::Stopped,
            process: None,
            leaked: None,
            started_at: None,
            stopped_at: None,
            restart_count: 0,
            last_restart_at: None,
            restart_window: VecDeque::new(),
            consecutive_failures: 0,
            failure_reason: None,
        }
    }

    /// PID of the owned process.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid)
    }

    /// Get the uptime of the current process.
    pub fn uptime(&self) -> Option<Duration> {
        if self.process.is_none() {
            return None;
        }
        self.started_at.map(|start| {
            let duration = Utc::now().signed_duration_since(start);
            Duration::from_secs(duration.num_seconds().max(0) as u64)
        })
    }

    /// Count a restart and report whether it fits the budget.
    pub fn record_restart(&mut self, budget: Option<&RestartBudget>) -> bool {
        self.record_restart_at(Instant::now(), budget)
    }

    pub(crate) fn record_restart_at(
        &mut self,
        now: Instant,
        budget: Option<&RestartBudget>,
    ) -> bool {
        self.restart_count = self.restart_count.saturating_add(1);
        self.last_restart_at = Some(Utc::now());

        let Some(budget) = budget else {
            return true;
        };
        self.restart_window.push_back(now);
        while let Some(oldest) = self.restart_window.front() {
            if now.saturating_duration_since(*oldest) > budget.window {
                self.restart_window.pop_front();
            } else {
                break;
            }
        }
        self.restart_window.len() <= budget.max_restarts as usize
    }

    /// Administrative reset of the restart accounting.
    pub fn reset_restarts(&mut self) {
        self.restart_count = 0;
        self.last_restart_at = None;
        self.restart_window.clear();
        self.consecutive_failures = 0;
    }
}

/// Service status snapshot for display and the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub description: String,
    pub state: ServiceState,
    pub pid: Option<u32>,
    /// Launch time of the current process
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: Option<u64>,
    pub restart_count: u32,
    pub last_restart_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub failure_reason: Option<String>,
}

impl ServiceStatus {
    /// Create status from definition and instance.
    pub fn from_service(def: &ServiceDefinition, instance: &ServiceInstance) -> Self {
        Self {
            name: def.name.clone(),
            description: def.description.clone(),
            state: instance.state,
            pid: instance.pid(),
            started_at: instance.process.as_ref().and(instance.started_at),
            uptime_secs: instance.uptime().map(|d| d.as_secs()),
            restart_count: instance.restart_count,
            last_restart_at: instance.last_restart_at,
            consecutive_failures: instance.consecutive_failures,
            failure_reason: instance.failure_reason.clone(),
        }
    }

    /// Recompute `uptime_secs` for a snapshot taken earlier.
    pub fn refresh_uptime(&mut self) {
        self.uptime_secs = self
            .started_at
            .map(|start| Utc::now().signed_duration_since(start).num_seconds().max(0) as u64);
    }
}
