//! Shutdown coordination.
//!
//! On the first termination request every service is marked
//! `ShuttingDown` and stopped in parallel, each with its own grace period.
//! Later requests do not start a second round; they escalate the running
//! one to an immediate SIGKILL.

use crate::error::Result;
use crate::service::ServiceState;
use crate::supervisor::{ManagedService, Supervisor};
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Outcome of a shutdown round.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Services confirmed stopped
    pub stopped: Vec<String>,
    /// Services whose process could not be confirmed gone
    pub timed_out: Vec<String>,
}

impl ShutdownReport {
    /// Whether every service stopped within its bounds.
    pub fn is_clean(&self) -> bool {
        self.timed_out.is_empty()
    }

    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        if self.is_clean() {
            crate::entrypoint::exit_code::CLEAN
        } else {
            crate::entrypoint::exit_code::SHUTDOWN_TIMEOUT
        }
    }
}

/// Drives every managed service to a stopped state exactly once.
pub struct ShutdownCoordinator {
    supervisor: Arc<Supervisor>,
}

impl ShutdownCoordinator {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }

    /// Whether a shutdown round has started.
    pub fn is_started(&self) -> bool {
        self.supervisor.is_shutting_down()
    }

    /// Stop every service.
    ///
    /// Returns `None` if a shutdown round is already in progress.
    pub async fn shutdown(&self, reason: &str) -> Result<Option<ShutdownReport>> {
        if !self.supervisor.begin_shutdown() {
            info!("Shutdown already in progress");
            return Ok(None);
        }
        info!(reason = %reason, "Shutting down services");

        let mut stopping = JoinSet::new();
        for service in self.supervisor.services() {
            let supervisor = Arc::clone(&self.supervisor);
            let service = Arc::clone(service);
            let reason = reason.to_string();
            stopping.spawn(async move {
                let clean = stop_service(&supervisor, &service, &reason).await;
                (service.name().to_string(), clean)
            });
        }

        let mut report = ShutdownReport::default();
        let mut fatal = None;
        while let Some(joined) = stopping.join_next().await {
            match joined {
                Ok((name, Ok(true))) => report.stopped.push(name),
                Ok((name, Ok(false))) => report.timed_out.push(name),
                Ok((name, Err(e))) => {
                    error!(service = %name, error = %e, "Shutdown of service failed");
                    report.timed_out.push(name);
                    if e.is_fatal() && fatal.is_none() {
                        fatal = Some(e);
                    }
                }
                Err(e) => error!(error = %e, "Shutdown task panicked"),
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        report.stopped.sort();
        report.timed_out.sort();
        if report.is_clean() {
            info!(stopped = report.stopped.len(), "All services stopped");
        } else {
            warn!(timed_out = ?report.timed_out, "Some services did not stop cleanly");
        }
        Ok(Some(report))
    }

    /// Skip the rest of every grace period and kill now.
    pub fn escalate(&self) {
        warn!("Escalating shutdown, sending SIGKILL to remaining services");
        self.supervisor.escalate();
    }
}

/// Stop one service; `Ok(false)` if any of its processes could not be
/// confirmed gone.
///
/// A group leaked by an earlier failed stop is killed again first, even for
/// a `Failed` service.
async fn stop_service(
    supervisor: &Supervisor,
    service: &ManagedService,
    reason: &str,
) -> Result<bool> {
    let mut instance = service.instance.lock().await;
    let reclaimed = supervisor.reclaim_leaked(service, &mut instance).await.is_ok();

    if instance.state.is_terminal() {
        return Ok(reclaimed);
    }
    supervisor.transition(service, &mut instance, ServiceState::ShuttingDown, reason)?;

    let Some(process) = instance.process.clone() else {
        supervisor.transition(service, &mut instance, ServiceState::Stopped, "no process to stop")?;
        return Ok(reclaimed);
    };

    let grace = supervisor.config().stop_timeout_for(&service.definition);
    let mut force = supervisor.force_receiver();
    let stopped = supervisor.launcher().stop(&process, grace, &mut force).await;
    instance.process = None;
    instance.stopped_at = Some(Utc::now());

    match stopped {
        Ok(status) => {
            supervisor.transition(
                service,
                &mut instance,
                ServiceState::Stopped,
                &format!("stopped for shutdown: {}", status),
            )?;
            Ok(reclaimed)
        }
        Err(e) => {
            let message = format!(
                "stop failed, process group {} may be leaked: {}",
                process.pgid, e
            );
            error!(service = %service.name(), pid = process.pid, error = %e, "Failed to stop service");
            instance.leaked = Some(process);
            instance.failure_reason = Some(message.clone());
            supervisor.transition(service, &mut instance, ServiceState::Failed, &message)?;
            Ok(false)
        }
    }
}
