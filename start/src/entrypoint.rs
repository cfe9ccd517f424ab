//! Container entry point - PID 1 duties and signal handling.

use crate::config::SupervisorConfig;
use crate::control::ControlServer;
use crate::error::Result;
use crate::shutdown::ShutdownCoordinator;
use crate::supervisor::Supervisor;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Process exit codes of the entry point.
pub mod exit_code {
    /// Every service stopped cleanly
    pub const CLEAN: i32 = 0;
    /// Unrecoverable internal fault (event log, configuration)
    pub const INTERNAL_FAULT: i32 = 1;
    /// A service failed to start during startup
    pub const START_FAILED: i32 = 3;
    /// At least one service did not stop within its bounds
    pub const SHUTDOWN_TIMEOUT: i32 = 4;
}

/// The container entry point.
pub struct EntryPoint {
    supervisor: Arc<Supervisor>,
    coordinator: ShutdownCoordinator,
    /// Control socket shutdown requests
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl EntryPoint {
    /// Validate the configuration and open the supervisor's storage.
    pub async fn new(config: SupervisorConfig) -> Result<Self> {
        config.validate()?;
        let supervisor = Arc::new(Supervisor::new(config).await?);
        let coordinator = ShutdownCoordinator::new(Arc::clone(&supervisor));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        Ok(Self {
            supervisor,
            coordinator,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Get a reference to the supervisor.
    pub fn supervisor(&self) -> Arc<Supervisor> {
        Arc::clone(&self.supervisor)
    }

    /// Handle for requesting shutdown from inside the process.
    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run until shutdown; returns the process exit code.
    pub async fn run(mut self) -> Result<i32> {
        let config = self.supervisor.config().clone();
        info!(
            pid = std::process::id(),
            services = self.supervisor.services().len(),
            reap_orphans = config.reap_orphans,
            "ukmsdn supervisor starting"
        );

        // Installed before any child exists so no signal is missed
        let mut sigchld = signal(SignalKind::child())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        if let Err(e) = self.supervisor.start_all().await {
            let fatal = e.is_fatal();
            error!(error = %e, "Initial start failed, stopping services already started");
            let report = self.coordinator.shutdown("initial start failed").await?;
            self.final_reap(&config).await;
            if fatal {
                return Ok(exit_code::INTERNAL_FAULT);
            }
            if let Some(report) = report {
                if !report.is_clean() {
                    warn!(timed_out = ?report.timed_out, "Services left running after failed start");
                }
            }
            return Ok(exit_code::START_FAILED);
        }

        let mut loops = self.supervisor.spawn_loops();

        let mut control = ControlServer::new(config.control_socket());
        let started = control.start().await;
        let control_task = match started {
            Ok(()) => Some(tokio::spawn(
                control.serve(Arc::clone(&self.supervisor), self.shutdown_tx.clone()),
            )),
            Err(e) => {
                warn!(error = %e, "Control socket unavailable, continuing without it");
                None
            }
        };

        info!("Supervisor ready, entering event loop");

        let mut fault = false;
        let reason = loop {
            tokio::select! {
                _ = sigchld.recv() => {
                    if config.reap_orphans {
                        self.supervisor.reap_orphans().await;
                    }
                }

                _ = sigterm.recv() => break "received SIGTERM".to_string(),

                _ = sigint.recv() => break "received SIGINT".to_string(),

                Some(()) = self.shutdown_rx.recv() => {
                    break "shutdown requested over control socket".to_string();
                }

                Some(joined) = loops.join_next() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) if e.is_fatal() => {
                        error!(error = %e, "Internal fault, shutting down");
                        fault = true;
                        break format!("internal fault: {}", e);
                    }
                    Ok(Err(e)) => error!(error = %e, "Service loop ended with an error"),
                    Err(e) => error!(error = %e, "Service loop panicked"),
                },
            }
        };

        let shutdown = self.coordinator.shutdown(&reason);
        tokio::pin!(shutdown);

        let report = loop {
            tokio::select! {
                result = &mut shutdown => break result,

                _ = sigterm.recv() => {
                    warn!("Received SIGTERM during shutdown");
                    self.coordinator.escalate();
                }

                _ = sigint.recv() => {
                    warn!("Received SIGINT during shutdown");
                    self.coordinator.escalate();
                }

                _ = sigchld.recv() => {
                    if config.reap_orphans {
                        self.supervisor.reap_orphans().await;
                    }
                }
            }
        };

        loops.shutdown().await;
        if let Some(task) = control_task {
            task.abort();
            let _ = task.await;
        }
        self.final_reap(&config).await;

        let report = match report {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Shutdown hit an internal fault");
                return Ok(exit_code::INTERNAL_FAULT);
            }
        };

        let code = match report {
            _ if fault => exit_code::INTERNAL_FAULT,
            Some(report) => report.exit_code(),
            None => exit_code::CLEAN,
        };
        info!(exit_code = code, "Supervisor exiting");
        Ok(code)
    }

    /// Collect any remaining zombies before exit.
    async fn final_reap(&self, config: &SupervisorConfig) {
        if config.reap_orphans {
            self.supervisor.reap_orphans().await;
        }
    }
}
