//! Supervisor loop: per-service health polling and restart accounting.
//!
//! Each managed service gets one task that polls its health on a fixed
//! interval. All mutation of a service's runtime state happens under that
//! service's instance lock, which the shutdown coordinator takes as well.
//! Status queries never take the lock; they read the snapshot published
//! with every transition.

use crate::config::SupervisorConfig;
use crate::error::{Error, LaunchError, Result, StopError};
use crate::events::EventLog;
use crate::health::{HealthChecker, HealthVerdict, ProbeContext};
use crate::journal::Journal;
use crate::process::{wait_until_set, ProcessLauncher};
use crate::service::{ServiceDefinition, ServiceInstance, ServiceState, ServiceStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// One daemon under supervision.
pub struct ManagedService {
    /// Immutable definition
    pub definition: ServiceDefinition,
    checker: HealthChecker,
    /// Runtime state; the lock serializes every transition of this service
    pub(crate) instance: Mutex<ServiceInstance>,
    /// Last published status
    snapshot: watch::Sender<ServiceStatus>,
}

impl ManagedService {
    fn new(definition: ServiceDefinition) -> Self {
        let instance = ServiceInstance::new(&definition.name);
        let (snapshot, _) = watch::channel(ServiceStatus::from_service(&definition, &instance));
        Self {
            checker: HealthChecker::from_checks(&definition.health),
            instance: Mutex::new(instance),
            snapshot,
            definition,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Current status, without waiting for an in-flight poll.
    pub fn status(&self) -> ServiceStatus {
        let mut status = self.snapshot.borrow().clone();
        status.refresh_uptime();
        status
    }

    fn publish(&self, instance: &ServiceInstance) {
        self.snapshot
            .send_replace(ServiceStatus::from_service(&self.definition, instance));
    }
}

/// Owns every managed service and drives their state machines.
pub struct Supervisor {
    config: SupervisorConfig,
    /// Services in configuration order
    services: Vec<Arc<ManagedService>>,
    index: HashMap<String, usize>,
    launcher: Arc<ProcessLauncher>,
    events: Arc<EventLog>,
    /// Set once shutdown begins; no start may begin afterwards
    shutdown_tx: watch::Sender<bool>,
    /// Set when a second signal asks to stop waiting
    force_tx: watch::Sender<bool>,
}

impl Supervisor {
    /// Build a supervisor for the configured services.
    ///
    /// Opens the event log; failing to do so is fatal.
    pub async fn new(config: SupervisorConfig) -> Result<Self> {
        let journal = Arc::new(Journal::new(config.log_dir.clone()));
        journal.ensure_dir()?;
        let launcher = Arc::new(ProcessLauncher::new(Arc::clone(&journal), config.kill_wait));
        let events = Arc::new(EventLog::open(&config.state_dir)?);

        let mut services = Vec::with_capacity(config.services.len());
        let mut index = HashMap::new();
        for def in &config.services {
            if index.contains_key(&def.name) {
                return Err(Error::ServiceAlreadyExists(def.name.clone()));
            }
            if let Some(ref path) = def.log_file {
                journal.set_log_file(&def.name, path.clone()).await;
            }
            index.insert(def.name.clone(), services.len());
            services.push(Arc::new(ManagedService::new(def.clone())));
        }

        let (shutdown_tx, _) = watch::channel(false);
        let (force_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            services,
            index,
            launcher,
            events,
            shutdown_tx,
            force_tx,
        })
    }

    /// Supervisor configuration.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// The process launcher.
    pub fn launcher(&self) -> Arc<ProcessLauncher> {
        Arc::clone(&self.launcher)
    }

    /// The event log.
    pub fn events(&self) -> Arc<EventLog> {
        Arc::clone(&self.events)
    }

    /// Managed services in configuration order.
    pub fn services(&self) -> &[Arc<ManagedService>] {
        &self.services
    }

    fn get(&self, name: &str) -> Result<&Arc<ManagedService>> {
        self.index
            .get(name)
            .map(|&i| &self.services[i])
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Flag shutdown; returns false if it was already flagged.
    pub(crate) fn begin_shutdown(&self) -> bool {
        !self.shutdown_tx.send_replace(true)
    }

    /// Cut every in-progress grace period short.
    pub(crate) fn escalate(&self) {
        self.force_tx.send_replace(true);
    }

    pub(crate) fn force_receiver(&self) -> watch::Receiver<bool> {
        self.force_tx.subscribe()
    }

    /// Record a transition, apply it and publish the new status.
    ///
    /// `from == to` records nothing but still publishes.
    pub(crate) fn transition(
        &self,
        service: &ManagedService,
        instance: &mut ServiceInstance,
        to: ServiceState,
        reason: &str,
    ) -> Result<()> {
        let from = instance.state;
        if from != to {
            self.events.record(service.name(), from, to, reason)?;
            instance.state = to;
        }
        service.publish(instance);
        Ok(())
    }

    /// Kill and reap the group left behind by a failed stop.
    ///
    /// Succeeds once nothing is left over.
    pub(crate) async fn reclaim_leaked(
        &self,
        service: &ManagedService,
        instance: &mut ServiceInstance,
    ) -> std::result::Result<(), StopError> {
        let Some(leaked) = instance.leaked.clone() else {
            return Ok(());
        };

        let mut force = self.force_receiver();
        match self.launcher.stop(&leaked, Duration::ZERO, &mut force).await {
            Ok(status) => {
                info!(service = %service.name(), pid = leaked.pid, status = %status, "Reclaimed leaked process");
                instance.leaked = None;
                Ok(())
            }
            Err(e) => {
                error!(service = %service.name(), pgid = leaked.pgid, error = %e, "Leaked process group is still alive");
                Err(e)
            }
        }
    }

    /// Start a service unless it already owns a process.
    ///
    /// A no-op for services that are running (no spawn, no event) and for
    /// services in `Failed`, which need an operator reset first.
    pub async fn start_service(self: &Arc<Self>, name: &str) -> Result<()> {
        let service = Arc::clone(self.get(name)?);
        let pid = {
            let mut instance = service.instance.lock().await;
            if instance.process.is_some() {
                debug!(service = %name, "Service already has a process");
                return Ok(());
            }
            if instance.state == ServiceState::Failed {
                warn!(service = %name, "Service is failed; reset it before starting");
                return Ok(());
            }
            self.launch(&service, &mut instance, "start requested").await?
        };
        self.settle_and_check(&service, pid).await
    }

    /// Launch every service, then run their first health checks.
    ///
    /// Stops at the first launch failure and returns it.
    pub async fn start_all(self: &Arc<Self>) -> Result<()> {
        let mut settling = JoinSet::new();

        for service in &self.services {
            let pid = {
                let mut instance = service.instance.lock().await;
                if instance.process.is_some() {
                    continue;
                }
                self.launch(service, &mut instance, "initial start").await?
            };

            let supervisor = Arc::clone(self);
            let service = Arc::clone(service);
            settling.spawn(async move { supervisor.settle_and_check(&service, pid).await });
        }

        while let Some(joined) = settling.join_next().await {
            match joined {
                Ok(result) => result?,
                Err(e) => error!(error = %e, "Settle task panicked"),
            }
        }
        Ok(())
    }

    /// Spawn the process and move to `Starting`; returns the new PID.
    ///
    /// On failure the service ends in `Stopped` with the reason recorded.
    async fn launch(
        &self,
        service: &ManagedService,
        instance: &mut ServiceInstance,
        reason: &str,
    ) -> Result<u32> {
        if self.is_shutting_down() {
            return Err(Error::Launch {
                name: service.name().to_string(),
                source: LaunchError::ShuttingDown,
            });
        }

        match self.launcher.start(&service.definition).await {
            Ok(process) => {
                let pid = process.pid;
                instance.started_at = Some(process.started_at);
                instance.process = Some(process);
                instance.consecutive_failures = 0;
                instance.failure_reason = None;
                self.transition(service, instance, ServiceState::Starting, reason)?;
                info!(service = %service.name(), pid = pid, "Service started");
                Ok(pid)
            }
            Err(source) => {
                let message = format!("launch failed: {}", source);
                error!(service = %service.name(), error = %source, "Failed to start service");
                instance.failure_reason = Some(message.clone());
                self.transition(service, instance, ServiceState::Stopped, &message)?;
                Err(Error::Launch {
                    name: service.name().to_string(),
                    source,
                })
            }
        }
    }

    /// Wait out the settle delay, then resolve `Starting`.
    ///
    /// The lock is not held while waiting; if the process changed in the
    /// meantime the check is skipped.
    async fn settle_and_check(&self, service: &ManagedService, pid: u32) -> Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(self.config.settle_delay) => {}
            _ = wait_until_set(&mut shutdown) => return Ok(()),
        }

        let mut instance = service.instance.lock().await;
        if instance.state != ServiceState::Starting || instance.pid() != Some(pid) {
            return Ok(());
        }

        match self.evaluate(service, &instance).await {
            HealthVerdict::Healthy => {
                self.transition(service, &mut instance, ServiceState::Running, "health check passed")
            }
            HealthVerdict::Unhealthy(reason) => {
                instance.consecutive_failures = 1;
                instance.failure_reason = Some(reason.clone());
                self.transition(service, &mut instance, ServiceState::Unhealthy, &reason)
            }
        }
    }

    async fn evaluate(&self, service: &ManagedService, instance: &ServiceInstance) -> HealthVerdict {
        let ctx = ProbeContext {
            service: &service.definition,
            process: instance.process.as_ref(),
            launcher: &self.launcher,
        };
        service.checker.check(&ctx).await
    }

    /// One poll of one service.
    ///
    /// Returns the PID of a freshly launched process that still needs its
    /// settle check.
    pub(crate) async fn poll_once(&self, service: &ManagedService) -> Result<Option<u32>> {
        let mut instance = service.instance.lock().await;
        if self.is_shutting_down() {
            return Ok(None);
        }

        match instance.state {
            ServiceState::Running | ServiceState::Unhealthy => {
                match self.evaluate(service, &instance).await {
                    HealthVerdict::Healthy => {
                        instance.consecutive_failures = 0;
                        self.transition(service, &mut instance, ServiceState::Running, "health check passed")?;
                        Ok(None)
                    }
                    HealthVerdict::Unhealthy(reason) => {
                        instance.consecutive_failures = instance.consecutive_failures.saturating_add(1);
                        instance.failure_reason = Some(reason.clone());
                        self.transition(service, &mut instance, ServiceState::Unhealthy, &reason)?;

                        if instance.consecutive_failures >= self.config.failure_strikes {
                            let why = format!(
                                "{} consecutive failed health checks: {}",
                                instance.consecutive_failures, reason
                            );
                            self.restart(service, &mut instance, &why).await
                        } else {
                            debug!(
                                service = %service.name(),
                                strikes = instance.consecutive_failures,
                                "Health check failed, waiting for next poll"
                            );
                            Ok(None)
                        }
                    }
                }
            }
            ServiceState::Stopped => {
                let why = instance
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "service is not running".to_string());
                self.restart(service, &mut instance, &format!("retrying after {}", why))
                    .await
            }
            ServiceState::Starting
            | ServiceState::Restarting
            | ServiceState::ShuttingDown
            | ServiceState::Failed => Ok(None),
        }
    }

    /// Replace the process of a service, honoring the restart budget.
    async fn restart(
        &self,
        service: &ManagedService,
        instance: &mut ServiceInstance,
        reason: &str,
    ) -> Result<Option<u32>> {
        let within_budget = instance.record_restart(self.config.restart_budget.as_ref());
        self.transition(service, instance, ServiceState::Restarting, reason)?;
        info!(service = %service.name(), restart_count = instance.restart_count, "Restarting service");

        if let Some(process) = instance.process.clone() {
            let grace = self.config.stop_timeout_for(&service.definition);
            let mut force = self.force_receiver();
            let stopped = self.launcher.stop(&process, grace, &mut force).await;
            instance.process = None;
            instance.stopped_at = Some(Utc::now());

            if let Err(e) = stopped {
                let message = format!("stop failed, process group {} may be leaked: {}", process.pgid, e);
                error!(service = %service.name(), pid = process.pid, error = %e, "Failed to stop service");
                instance.leaked = Some(process);
                instance.failure_reason = Some(message.clone());
                self.transition(service, instance, ServiceState::Failed, &message)?;
                return Ok(None);
            }
        }

        if let (false, Some(budget)) = (within_budget, self.config.restart_budget) {
            let message = Error::RestartBudgetExceeded {
                name: service.name().to_string(),
                max_restarts: budget.max_restarts,
                window: budget.window,
            }
            .to_string();
            warn!(service = %service.name(), "{}", message);
            instance.failure_reason = Some(message.clone());
            self.transition(service, instance, ServiceState::Failed, &message)?;
            return Ok(None);
        }

        if self.is_shutting_down() {
            self.transition(service, instance, ServiceState::Stopped, "shutdown in progress")?;
            return Ok(None);
        }

        match self.launch(service, instance, "restarted").await {
            Ok(pid) => Ok(Some(pid)),
            Err(e) if e.is_fatal() => Err(e),
            Err(_) => Ok(None),
        }
    }

    /// Poll one service until shutdown begins.
    pub async fn run_service_loop(self: Arc<Self>, service: Arc<ManagedService>) -> Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wait_until_set(&mut shutdown) => break,
            }

            if let Some(pid) = self.poll_once(&service).await? {
                self.settle_and_check(&service, pid).await?;
            }
        }

        debug!(service = %service.name(), "Poll loop stopped");
        Ok(())
    }

    /// Spawn one poll task per service.
    pub fn spawn_loops(self: &Arc<Self>) -> JoinSet<Result<()>> {
        let mut loops = JoinSet::new();
        for service in &self.services {
            loops.spawn(Arc::clone(self).run_service_loop(Arc::clone(service)));
        }
        loops
    }

    /// Administrative reset: zero the restart accounting and revive a
    /// `Failed` service.
    pub async fn reset(self: &Arc<Self>, name: &str) -> Result<ServiceStatus> {
        let service = Arc::clone(self.get(name)?);
        let relaunched = {
            let mut instance = service.instance.lock().await;
            instance.reset_restarts();
            service.publish(&instance);

            if instance.state == ServiceState::Failed {
                self.reclaim_leaked(&service, &mut instance)
                    .await
                    .map_err(|source| Error::Stop {
                        name: name.to_string(),
                        source,
                    })?;
                instance.failure_reason = None;
                self.transition(&service, &mut instance, ServiceState::Stopped, "reset by operator")?;
                if self.is_shutting_down() {
                    None
                } else {
                    match self.launch(&service, &mut instance, "start after reset").await {
                        Ok(pid) => Some(pid),
                        Err(e) if e.is_fatal() => return Err(e),
                        // Left in Stopped; the poll loop retries
                        Err(_) => None,
                    }
                }
            } else {
                None
            }
        };

        if let Some(pid) = relaunched {
            let supervisor = Arc::clone(self);
            let settling = Arc::clone(&service);
            tokio::spawn(async move {
                if let Err(e) = supervisor.settle_and_check(&settling, pid).await {
                    error!(service = %settling.name(), error = %e, "Settle check after reset failed");
                }
            });
        }

        info!(service = %name, "Service reset");
        self.status(name).await
    }

    /// Status of one service.
    pub async fn status(&self, name: &str) -> Result<ServiceStatus> {
        Ok(self.get(name)?.status())
    }

    /// Status of every service, in configuration order.
    pub async fn statuses(&self) -> Vec<ServiceStatus> {
        self.services.iter().map(|service| service.status()).collect()
    }

    /// Reap exited children that are not managed services.
    pub async fn reap_orphans(&self) {
        let reaped = self.launcher.reap_orphans().await;
        if !reaped.is_empty() {
            debug!(count = reaped.len(), "Reaped child processes");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::HealthCheck;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir, services: Vec<ServiceDefinition>) -> SupervisorConfig {
        SupervisorConfig {
            poll_interval: Duration::from_millis(200),
            settle_delay: Duration::from_millis(50),
            stop_timeout: Duration::from_secs(2),
            kill_wait: Duration::from_secs(2),
            log_dir: dir.path().join("log"),
            state_dir: dir.path().join("state"),
            reap_orphans: false,
            services,
            ..SupervisorConfig::default()
        }
    }

    async fn stop_everything(supervisor: &Supervisor) {
        for service in supervisor.services() {
            let mut instance = service.instance.lock().await;
            if let Some(process) = instance.process.take() {
                let _ = supervisor
                    .launcher
                    .stop_now(&process, Duration::from_secs(1))
                    .await;
            }
        }
    }

    #[tokio::test]
    async fn test_rejects_duplicate_services() {
        let dir = TempDir::new().unwrap();
        let cfg = config(
            &dir,
            vec![
                ServiceDefinition::new("a", "sleep"),
                ServiceDefinition::new("a", "sleep"),
            ],
        );
        assert!(matches!(
            Supervisor::new(cfg).await,
            Err(Error::ServiceAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_start_all_reaches_running() {
        let dir = TempDir::new().unwrap();
        let cfg = config(
            &dir,
            vec![ServiceDefinition::new("sleeper", "sleep").with_args(["30"])],
        );
        let supervisor = Arc::new(Supervisor::new(cfg).await.unwrap());

        supervisor.start_all().await.unwrap();
        let status = supervisor.status("sleeper").await.unwrap();
        assert_eq!(status.state, ServiceState::Running);
        assert!(status.pid.is_some());

        let events = supervisor.events().events().unwrap();
        let path: Vec<_> = events.iter().map(|e| (e.from, e.to)).collect();
        assert_eq!(
            path,
            vec![
                (ServiceState::Stopped, ServiceState::Starting),
                (ServiceState::Starting, ServiceState::Running),
            ]
        );

        stop_everything(&supervisor).await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let cfg = config(
            &dir,
            vec![ServiceDefinition::new("sleeper", "sleep").with_args(["30"])],
        );
        let supervisor = Arc::new(Supervisor::new(cfg).await.unwrap());
        supervisor.start_all().await.unwrap();

        let before = supervisor.status("sleeper").await.unwrap();
        let events_before = supervisor.events().events().unwrap().len();

        supervisor.start_service("sleeper").await.unwrap();

        let after = supervisor.status("sleeper").await.unwrap();
        assert_eq!(before.pid, after.pid);
        assert_eq!(supervisor.events().events().unwrap().len(), events_before);

        stop_everything(&supervisor).await;
    }

    #[tokio::test]
    async fn test_initial_launch_failure() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, vec![ServiceDefinition::new("ghost", "/nonexistent/daemon")]);
        let supervisor = Arc::new(Supervisor::new(cfg).await.unwrap());

        let err = supervisor.start_all().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Launch {
                source: LaunchError::ExecutableNotFound(_),
                ..
            }
        ));

        // Stopped -> Stopped is not a transition; nothing was recorded
        let status = supervisor.status("ghost").await.unwrap();
        assert_eq!(status.state, ServiceState::Stopped);
        assert!(status.failure_reason.unwrap().contains("launch failed"));
        assert!(supervisor.events().events().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_strikes_then_restart() {
        let dir = TempDir::new().unwrap();
        let flag = dir.path().join("healthy");
        std::fs::write(&flag, "").unwrap();

        let def = ServiceDefinition::new("sleeper", "sleep")
            .with_args(["30"])
            .with_health_check(HealthCheck::command("test", &["-f", flag.to_str().unwrap()]));
        let cfg = config(&dir, vec![def]);
        let supervisor = Arc::new(Supervisor::new(cfg).await.unwrap());
        supervisor.start_all().await.unwrap();
        let service = Arc::clone(&supervisor.services()[0]);
        let first_pid = supervisor.status("sleeper").await.unwrap().pid;

        std::fs::remove_file(&flag).unwrap();
        assert_eq!(supervisor.poll_once(&service).await.unwrap(), None);
        assert_eq!(
            supervisor.status("sleeper").await.unwrap().state,
            ServiceState::Unhealthy
        );

        let new_pid = supervisor.poll_once(&service).await.unwrap();
        assert!(new_pid.is_some());
        assert_ne!(new_pid, first_pid);

        let status = supervisor.status("sleeper").await.unwrap();
        assert_eq!(status.state, ServiceState::Starting);
        assert_eq!(status.restart_count, 1);

        stop_everything(&supervisor).await;
    }

    #[tokio::test]
    async fn test_reset_revives_failed_service() {
        let dir = TempDir::new().unwrap();
        let cfg = config(
            &dir,
            vec![ServiceDefinition::new("sleeper", "sleep").with_args(["30"])],
        );
        let supervisor = Arc::new(Supervisor::new(cfg).await.unwrap());
        let service = Arc::clone(&supervisor.services()[0]);

        {
            let mut instance = service.instance.lock().await;
            instance.restart_count = 5;
            supervisor
                .transition(&service, &mut instance, ServiceState::Failed, "test")
                .unwrap();
        }

        let status = supervisor.reset("sleeper").await.unwrap();
        assert_eq!(status.restart_count, 0);
        assert!(matches!(
            status.state,
            ServiceState::Starting | ServiceState::Running
        ));
        assert!(status.pid.is_some());

        stop_everything(&supervisor).await;
    }

    #[tokio::test]
    async fn test_restart_during_shutdown_ends_stopped() {
        let dir = TempDir::new().unwrap();
        let cfg = config(
            &dir,
            vec![ServiceDefinition::new("sleeper", "sleep").with_args(["30"])],
        );
        let supervisor = Arc::new(Supervisor::new(cfg).await.unwrap());
        supervisor.start_all().await.unwrap();
        let service = Arc::clone(&supervisor.services()[0]);

        assert!(supervisor.begin_shutdown());
        {
            let mut instance = service.instance.lock().await;
            let relaunched = supervisor
                .restart(&service, &mut instance, "health check failed")
                .await
                .unwrap();
            assert_eq!(relaunched, None);
            assert_eq!(instance.state, ServiceState::Stopped);
            assert!(instance.pid().is_none());
        }

        let status = supervisor.status("sleeper").await.unwrap();
        assert_eq!(status.state, ServiceState::Stopped);
        assert!(status.pid.is_none());

        let events = supervisor.events().events().unwrap();
        let last = events.last().unwrap();
        assert_eq!(
            (last.from, last.to),
            (ServiceState::Restarting, ServiceState::Stopped)
        );
        assert_eq!(last.reason, "shutdown in progress");
    }

    #[tokio::test]
    async fn test_reset_reclaims_leaked_group() {
        let dir = TempDir::new().unwrap();
        let cfg = config(
            &dir,
            vec![ServiceDefinition::new("sleeper", "sleep").with_args(["30"])],
        );
        let supervisor = Arc::new(Supervisor::new(cfg).await.unwrap());
        supervisor.start_all().await.unwrap();
        let service = Arc::clone(&supervisor.services()[0]);

        let leaked_pid = {
            let mut instance = service.instance.lock().await;
            let process = instance.process.take().unwrap();
            let pid = process.pid;
            instance.leaked = Some(process);
            supervisor
                .transition(&service, &mut instance, ServiceState::Failed, "stop failed")
                .unwrap();
            pid
        };
        assert!(supervisor.launcher().is_running(leaked_pid).await);

        let status = supervisor.reset("sleeper").await.unwrap();
        assert!(status.pid.is_some());
        assert_ne!(status.pid, Some(leaked_pid));
        assert!(service.instance.lock().await.leaked.is_none());
        assert_eq!(
            nix::sys::signal::kill(nix::unistd::Pid::from_raw(leaked_pid as i32), None),
            Err(nix::errno::Errno::ESRCH)
        );

        stop_everything(&supervisor).await;
    }

    #[tokio::test]
    async fn test_status_reads_snapshot_while_locked() {
        let dir = TempDir::new().unwrap();
        let cfg = config(
            &dir,
            vec![ServiceDefinition::new("sleeper", "sleep").with_args(["30"])],
        );
        let supervisor = Arc::new(Supervisor::new(cfg).await.unwrap());
        supervisor.start_all().await.unwrap();
        let service = Arc::clone(&supervisor.services()[0]);

        let held = service.instance.lock().await;
        let status = tokio::time::timeout(Duration::from_millis(200), supervisor.status("sleeper"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.state, ServiceState::Running);
        assert_eq!(status.pid, held.pid());
        assert!(status.uptime_secs.is_some());
        drop(held);

        stop_everything(&supervisor).await;
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, vec![ServiceDefinition::new("a", "sleep")]);
        let supervisor = Arc::new(Supervisor::new(cfg).await.unwrap());
        assert!(matches!(
            supervisor.status("b").await,
            Err(Error::ServiceNotFound(_))
        ));
    }
}
