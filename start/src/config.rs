//! Supervisor configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `UKM_*` environment variables.

use crate::error::ConfigError;
use crate::loaders::LoaderRegistry;
use crate::service::{
    option_duration_secs, HealthCheck, RestartBudget, ServiceDefinition,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default health poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Default delay between launch and the first health check.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(5);
/// Default number of consecutive failed polls before a restart.
pub const DEFAULT_FAILURE_STRIKES: u32 = 2;
/// Default SIGTERM grace period.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// Default wait for the reap after SIGKILL.
pub const DEFAULT_KILL_WAIT: Duration = Duration::from_secs(5);
/// Default restart budget window when only a maximum is given.
pub const DEFAULT_RESTART_WINDOW: Duration = Duration::from_secs(300);

/// Runtime configuration of one supervisor instance.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Interval between health polls
    pub poll_interval: Duration,
    /// Delay between launch and the first health check
    pub settle_delay: Duration,
    /// Consecutive failed polls that trigger a restart
    pub failure_strikes: u32,
    /// Restart budget; `None` restarts forever
    pub restart_budget: Option<RestartBudget>,
    /// Default grace period for services without their own
    pub stop_timeout: Duration,
    /// Wait for the reap after SIGKILL
    pub kill_wait: Duration,
    /// Supervision log and per-service output logs
    pub log_dir: PathBuf,
    /// Event log and control socket
    pub state_dir: PathBuf,
    /// Extra directory of service definition files
    pub services_dir: Option<PathBuf>,
    /// Reap every exited child, not only managed ones
    pub reap_orphans: bool,
    /// Services to supervise
    pub services: Vec<ServiceDefinition>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            settle_delay: DEFAULT_SETTLE_DELAY,
            failure_strikes: DEFAULT_FAILURE_STRIKES,
            restart_budget: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            kill_wait: DEFAULT_KILL_WAIT,
            log_dir: PathBuf::from("/var/log/ukmsdn"),
            state_dir: PathBuf::from("/run/ukmsdn"),
            services_dir: None,
            reap_orphans: std::process::id() == 1,
            services: Vec::new(),
        }
    }
}

/// `[supervisor]` table of the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorSettings {
    #[serde(default, with = "option_duration_secs", skip_serializing_if = "Option::is_none")]
    pub health_interval: Option<Duration>,
    #[serde(default, with = "option_duration_secs", skip_serializing_if = "Option::is_none")]
    pub settle_delay: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_strikes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<u32>,
    #[serde(default, with = "option_duration_secs", skip_serializing_if = "Option::is_none")]
    pub restart_window: Option<Duration>,
    #[serde(default, with = "option_duration_secs", skip_serializing_if = "Option::is_none")]
    pub stop_timeout: Option<Duration>,
    #[serde(default, with = "option_duration_secs", skip_serializing_if = "Option::is_none")]
    pub kill_wait: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reap_orphans: Option<bool>,
}

/// On-disk configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceDefinition>,
}

impl ConfigFile {
    /// Parse a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::TomlParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl SupervisorConfig {
    /// Defaults overlaid with a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_file(ConfigFile::from_file(path)?);
        Ok(config)
    }

    /// Overlay the values present in a parsed configuration file.
    pub fn apply_file(&mut self, file: ConfigFile) {
        let s = file.supervisor;
        if let Some(v) = s.health_interval {
            self.poll_interval = v;
        }
        if let Some(v) = s.settle_delay {
            self.settle_delay = v;
        }
        if let Some(v) = s.failure_strikes {
            self.failure_strikes = v;
        }
        self.set_budget(s.max_restarts, s.restart_window);
        if let Some(v) = s.stop_timeout {
            self.stop_timeout = v;
        }
        if let Some(v) = s.kill_wait {
            self.kill_wait = v;
        }
        if let Some(v) = s.log_dir {
            self.log_dir = v;
        }
        if let Some(v) = s.state_dir {
            self.state_dir = v;
        }
        if let Some(v) = s.services_dir {
            self.services_dir = Some(v);
        }
        if let Some(v) = s.reap_orphans {
            self.reap_orphans = v;
        }
        self.services.extend(file.services);
    }

    fn set_budget(&mut self, max_restarts: Option<u32>, window: Option<Duration>) {
        match (max_restarts, window, self.restart_budget.as_mut()) {
            (Some(max), window, Some(budget)) => {
                budget.max_restarts = max;
                if let Some(w) = window {
                    budget.window = w;
                }
            }
            (Some(max), window, None) => {
                self.restart_budget = Some(RestartBudget::new(
                    max,
                    window.unwrap_or(DEFAULT_RESTART_WINDOW),
                ));
            }
            (None, Some(w), Some(budget)) => budget.window = w,
            (None, _, _) => {}
        }
    }

    /// Overlay `UKM_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay `UKM_*` variables from an arbitrary lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("UKM_HEALTH_INTERVAL") {
            self.poll_interval = parse_secs("UKM_HEALTH_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("UKM_SETTLE_DELAY") {
            self.settle_delay = parse_secs("UKM_SETTLE_DELAY", &v)?;
        }
        if let Some(v) = lookup("UKM_FAILURE_STRIKES") {
            self.failure_strikes = parse_num("UKM_FAILURE_STRIKES", &v)?;
        }

        let max = lookup("UKM_MAX_RESTARTS")
            .map(|v| parse_num("UKM_MAX_RESTARTS", &v))
            .transpose()?;
        let window = lookup("UKM_RESTART_WINDOW")
            .map(|v| parse_secs("UKM_RESTART_WINDOW", &v))
            .transpose()?;
        self.set_budget(max, window);

        if let Some(v) = lookup("UKM_STOP_TIMEOUT") {
            self.stop_timeout = parse_secs("UKM_STOP_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("UKM_LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("UKM_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("UKM_SERVICES_DIR") {
            self.services_dir = Some(PathBuf::from(v));
        }

        if let Some(command) = lookup("UKM_SERVICE_COMMAND") {
            let name = lookup("UKM_SERVICE_NAME").unwrap_or_else(|| {
                command
                    .rsplit('/')
                    .next()
                    .unwrap_or(command.as_str())
                    .to_string()
            });
            let mut def = ServiceDefinition::new(name, command);
            if let Some(args) = lookup("UKM_SERVICE_ARGS") {
                def = def.with_args(args.split_whitespace());
            }
            if let Some(port) = lookup("UKM_CHECK_PORT") {
                def = def.with_health_check(HealthCheck::port(parse_num("UKM_CHECK_PORT", &port)?));
            }
            self.services.push(def);
        }

        Ok(())
    }

    /// Add definitions found in `services_dir`, if one is configured.
    pub fn load_services_dir(&mut self) -> Result<(), ConfigError> {
        if let Some(ref dir) = self.services_dir {
            let loaded = LoaderRegistry::new().load_dir(dir)?;
            self.services.extend(loaded);
        }
        Ok(())
    }

    /// Reject configurations the supervisor cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "health_interval".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.failure_strikes == 0 {
            return Err(ConfigError::Invalid {
                key: "failure_strikes".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.services.is_empty() {
            return Err(ConfigError::NoServices);
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            service.validate()?;
            if !seen.insert(service.name.as_str()) {
                return Err(ConfigError::DuplicateService(service.name.clone()));
            }
        }
        Ok(())
    }

    /// Grace period for one service.
    pub fn stop_timeout_for(&self, service: &ServiceDefinition) -> Duration {
        service.stop_timeout.unwrap_or(self.stop_timeout)
    }

    /// Path of the control socket.
    pub fn control_socket(&self) -> PathBuf {
        self.state_dir.join("control.sock")
    }

    /// Path of the event log.
    pub fn event_log_path(&self) -> PathBuf {
        self.state_dir.join(crate::events::EVENT_LOG_FILE)
    }
}

fn parse_secs(key: &str, value: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = value.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        reason: format!("{:?} is not a number of seconds", value),
    })?;
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::Invalid {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        reason: format!("{:?} is not a valid number", value),
    })
}
