//! ukmsdn supervisor - container entry point for the lab daemons.
//!
//! This crate supervises a small, static set of long-running external
//! daemons (the switch database and forwarding daemons, the SDN
//! controller). It is designed to run as a container's PID 1 and handles:
//!
//! - Launching each daemon in its own process group with captured output
//! - Periodic health checks (liveness, listening port, socket, command)
//! - Debounced automatic restarts with an optional restart budget
//! - Graceful, escalating shutdown on SIGTERM/SIGINT
//! - A durable event log of every state transition
//! - Orphan reaping
//!
//! # Architecture
//!
//! - **EntryPoint**: startup, signal loop and exit code
//! - **Supervisor**: owns the services and runs one poll loop per service
//! - **ShutdownCoordinator**: stops everything exactly once
//! - **ProcessLauncher**: spawns, stops and reaps processes
//! - **HealthChecker**: ordered, short-circuiting health probes
//! - **EventLog**: append-only record of transitions
//!
//! # Example
//!
//! ```no_run
//! use ukmsdn_start::{presets, EntryPoint, SupervisorConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = SupervisorConfig::default();
//!     config.services = presets::switch_services();
//!     config.apply_env()?;
//!     let code = EntryPoint::new(config).await?.run().await?;
//!     std::process::exit(code);
//! }
//! ```

pub mod config;
pub mod control;
pub mod entrypoint;
pub mod error;
pub mod events;
pub mod health;
pub mod journal;
pub mod loaders;
pub mod presets;
pub mod process;
pub mod service;
pub mod shutdown;
pub mod supervisor;

// Re-export main types
pub use config::{ConfigFile, SupervisorConfig};
pub use control::{ControlClient, ControlCommand, ControlResponse, ControlServer};
pub use entrypoint::{exit_code, EntryPoint};
pub use error::{ConfigError, Error, HealthCheckError, LaunchError, Result, StopError};
pub use events::{EventLog, LifecycleEvent};
pub use health::{HealthChecker, HealthProbe, HealthVerdict};
pub use journal::{Journal, JournalEntry};
pub use process::{ExitStatus, ProcessLauncher, RunningProcess};
pub use service::{
    HealthCheck, RestartBudget, ServiceDefinition, ServiceInstance, ServiceState, ServiceStatus,
};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
pub use supervisor::{ManagedService, Supervisor};
