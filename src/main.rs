//! ukmsdn supervisor binary.
//!
//! Runs as the entry point of the lab containers (`supervise`) and doubles
//! as the operator tool that talks to a running supervisor over its
//! control socket.

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};
use ukmsdn_start::{
    presets, ConfigFile, ControlClient, ControlResponse, EntryPoint, EventLog, HealthCheck,
    ServiceDefinition, ServiceStatus, SupervisorConfig,
};

/// Name of the supervision log inside the log directory.
const SUPERVISOR_LOG: &str = "supervisor.log";

#[derive(Parser)]
#[command(
    name = "ukmsdn",
    about = "ukmsdn lab supervisor - container entry point and service control",
    version,
    author
)]
struct Cli {
    /// Supervisor configuration file
    #[arg(short, long, env = "UKM_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Directory for the event log and control socket
    #[arg(long, env = "UKM_STATE_DIR", global = true)]
    state_dir: Option<PathBuf>,

    /// Directory for the supervision and service logs
    #[arg(long, env = "UKM_LOG_DIR", global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as the container entry point
    Supervise {
        /// Add a built-in service set: switch, controller or lab
        #[arg(short, long)]
        preset: Option<String>,

        /// Reap orphaned children even when not running as PID 1
        #[arg(long)]
        reap_orphans: bool,
    },

    /// Show service status
    Status {
        /// Service name (optional, shows all if not specified)
        name: Option<String>,

        /// Output lines to show for a single service
        #[arg(short = 'n', long, default_value_t = 10)]
        lines: usize,
    },

    /// Clear the restart accounting of a service and revive it if failed
    Reset {
        /// Service name
        name: String,
    },

    /// Stop every service and the supervisor
    Shutdown,

    /// Print recorded state transitions
    Events {
        /// Only show events of this service
        #[arg(short, long)]
        service: Option<String>,

        /// Show at most this many of the latest events
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Create a new service definition
    New {
        /// Service name
        #[arg(required_unless_present = "preset")]
        name: Option<String>,

        /// Command to execute
        #[arg(required_unless_present = "preset")]
        exec: Option<String>,

        /// TCP port the service must listen on
        #[arg(long)]
        port: Option<u16>,

        /// Write a built-in service set instead: switch, controller or lab
        #[arg(long, conflicts_with_all = ["name", "exec", "port"])]
        preset: Option<String>,

        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Supervise {
            ref preset,
            reap_orphans,
        }) => {
            let mut config = load_config(&cli)?;
            if let Some(name) = preset {
                let services =
                    presets::by_name(name).ok_or_else(|| anyhow!("Unknown preset: {}", name))?;
                config.services.extend(services);
            }
            config
                .load_services_dir()
                .context("Failed to load service definitions")?;
            if reap_orphans {
                config.reap_orphans = true;
            }

            init_logging(Some(&config.log_dir))?;

            let entry = EntryPoint::new(config)
                .await
                .context("Invalid supervisor configuration")?;
            let code = entry.run().await?;
            std::process::exit(code);
        }

        None => {
            init_logging(None)?;
            bail!("No command given, try `ukmsdn supervise` or `ukmsdn --help`");
        }

        Some(ref command) => {
            init_logging(None)?;
            let config = load_config(&cli)?;
            run_command(command, &config).await?;
        }
    }

    Ok(())
}

/// Defaults, then the configuration file, then `UKM_*` variables and flags.
fn load_config(cli: &Cli) -> anyhow::Result<SupervisorConfig> {
    let mut config = match cli.config {
        Some(ref path) => SupervisorConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => SupervisorConfig::default(),
    };

    config
        .apply_env()
        .context("Invalid UKM_* environment variable")?;

    if let Some(ref dir) = cli.state_dir {
        config.state_dir = dir.clone();
    }
    if let Some(ref dir) = cli.log_dir {
        config.log_dir = dir.clone();
    }

    Ok(config)
}

/// Stderr logging, plus the append-only supervision log when `log_dir` is set.
fn init_logging(log_dir: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            let path = dir.join(SUPERVISOR_LOG);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(())
}

/// Commands other than `supervise`.
async fn run_command(command: &Commands, config: &SupervisorConfig) -> anyhow::Result<()> {
    let client = ControlClient::new(config.control_socket());

    match command {
        Commands::Supervise { .. } => bail!("supervise does not talk to a running supervisor"),

        Commands::Status { name, lines } => match name {
            Some(name) => {
                for status in expect_statuses(client.get_service_status(name).await?)? {
                    print_status(&status);
                }
                if let ControlResponse::Logs { lines, .. } = client.get_logs(name, *lines).await? {
                    if !lines.is_empty() {
                        println!();
                        for line in lines {
                            println!("{}", line);
                        }
                    }
                }
            }
            None => {
                let statuses = expect_statuses(client.get_all_status().await?)?;
                if statuses.is_empty() {
                    println!("No services found");
                }
                for status in statuses {
                    print_status(&status);
                    println!();
                }
            }
        },

        Commands::Reset { name } => {
            println!("{}", expect_success(client.reset_service(name).await?)?);
        }

        Commands::Shutdown => {
            println!("{}", expect_success(client.shutdown().await?)?);
        }

        Commands::Events { service, limit } => {
            let path = config.event_log_path();
            let events = match service {
                Some(service) => EventLog::read_service(&path, service)?,
                None => EventLog::read_all(&path)?,
            };
            let skip = match limit {
                Some(limit) => events.len().saturating_sub(*limit),
                None => 0,
            };
            if events.is_empty() {
                println!("No events recorded in {}", path.display());
            }
            for event in &events[skip..] {
                println!("{}", event.format());
            }
        }

        Commands::New {
            name,
            exec,
            port,
            preset,
            output,
        } => {
            let (toml, default_name) = match (preset, name, exec) {
                (Some(preset), _, _) => {
                    let file = ConfigFile {
                        services: presets::by_name(preset)
                            .ok_or_else(|| anyhow!("Unknown preset: {}", preset))?,
                        ..ConfigFile::default()
                    };
                    (file.to_toml()?, format!("{}.toml", preset))
                }
                (None, Some(name), Some(exec)) => {
                    let mut def = ServiceDefinition::new(name.as_str(), exec.as_str());
                    if let Some(port) = port {
                        def = def.with_health_check(HealthCheck::port(*port));
                    }
                    def.validate()?;
                    (def.to_toml()?, format!("{}.toml", name))
                }
                _ => bail!("Either --preset or a name and command are required"),
            };

            let path = match (output, &config.services_dir) {
                (Some(path), _) => path.clone(),
                (None, Some(dir)) => dir.join(default_name),
                (None, None) => {
                    print!("{}", toml);
                    return Ok(());
                }
            };

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, toml)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), "Service definition written");
            println!("Created service definition: {}", path.display());
        }
    }

    Ok(())
}

fn expect_statuses(response: ControlResponse) -> anyhow::Result<Vec<ServiceStatus>> {
    match response {
        ControlResponse::Status { services } => Ok(services),
        ControlResponse::Error { message } => bail!(message),
        other => bail!("Unexpected response: {:?}", other),
    }
}

fn expect_success(response: ControlResponse) -> anyhow::Result<String> {
    match response {
        ControlResponse::Success { message } => Ok(message),
        ControlResponse::Error { message } => bail!(message),
        other => bail!("Unexpected response: {:?}", other),
    }
}

/// Print service status.
fn print_status(status: &ServiceStatus) {
    if status.description.is_empty() {
        println!("● {}", status.name);
    } else {
        println!("● {} - {}", status.name, status.description);
    }
    println!("   State: {}", status.state);

    if let Some(pid) = status.pid {
        println!("   PID: {}", pid);
    }

    if let Some(uptime) = status.uptime_secs {
        let hours = uptime / 3600;
        let minutes = (uptime % 3600) / 60;
        let seconds = uptime % 60;
        println!("   Uptime: {}h {}m {}s", hours, minutes, seconds);
    }

    if status.restart_count > 0 {
        println!("   Restarts: {}", status.restart_count);
        if let Some(at) = status.last_restart_at {
            println!("   Last restart: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
    }

    if status.consecutive_failures > 0 {
        println!("   Failed checks: {}", status.consecutive_failures);
    }

    if let Some(ref reason) = status.failure_reason {
        println!("   Reason: {}", reason);
    }
}
