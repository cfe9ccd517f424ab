//! Process management for the supervisor.
//!
//! This module handles spawning, stopping, and reaping processes. Every
//! managed process is started in its own session so that stopping it can
//! signal the whole process group, including workers the daemon forked.

use crate::error::{LaunchError, Result, StopError};
use crate::journal::{Journal, JournalEntry, Stream};
use crate::service::ServiceDefinition;
use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// Interval between reap attempts while waiting for a process to exit.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Time allowed for each pre-start command.
const PRE_START_TIMEOUT: Duration = Duration::from_secs(60);

/// A process launched by the supervisor.
#[derive(Debug, Clone)]
pub struct RunningProcess {
    /// Process ID
    pub pid: u32,
    /// Process group ID (equal to the PID; the child leads its own session)
    pub pgid: u32,
    /// Service name this process belongs to
    pub service: String,
    /// Program that was executed
    pub command: String,
    /// Wall-clock launch time
    pub started_at: DateTime<Utc>,
    /// Monotonic launch time
    pub launched: Instant,
}

/// Exit status of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    /// Process ID
    pub pid: u32,
    /// Exit code (if exited normally)
    pub code: Option<i32>,
    /// Signal (if killed by signal)
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Check if the process exited successfully.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(sig)) => match Signal::try_from(sig) {
                Ok(sig) => write!(f, "killed by {}", sig),
                Err(_) => write!(f, "killed by signal {}", sig),
            },
            (None, None) => write!(f, "reaped elsewhere"),
        }
    }
}

/// Bookkeeping for a PID the launcher spawned.
#[derive(Debug)]
struct Tracked {
    service: String,
    /// Status collected by the orphan reaper before the owner asked
    exit: Option<ExitStatus>,
}

/// Starts and stops external processes on behalf of managed services.
pub struct ProcessLauncher {
    /// Map of PID to tracking info
    processes: Arc<RwLock<HashMap<u32, Tracked>>>,
    /// Sink for captured stdout/stderr
    journal: Arc<Journal>,
    /// How long to wait for the reap after SIGKILL
    kill_wait: Duration,
}

impl ProcessLauncher {
    /// Create a new launcher writing output to `journal`.
    pub fn new(journal: Arc<Journal>, kill_wait: Duration) -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
            journal,
            kill_wait,
        }
    }

    /// Get a reference to the output journal.
    pub fn journal(&self) -> Arc<Journal> {
        Arc::clone(&self.journal)
    }

    /// Launch the process for a service.
    pub async fn start(
        &self,
        service: &ServiceDefinition,
    ) -> std::result::Result<RunningProcess, LaunchError> {
        let program = resolve_executable(&service.command, service.env.get("PATH"))
            .ok_or_else(|| LaunchError::ExecutableNotFound(service.command.clone()))?;

        for path in &service.remove_before_start {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(service = %service.name, path = %path.display(), "Removed stale runtime file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(service = %service.name, path = %path.display(), error = %e, "Failed to remove stale runtime file"),
            }
        }

        for pre in &service.exec_start_pre {
            let args = vec!["-c".to_string(), pre.clone()];
            match self
                .run_to_completion(&service.name, "/bin/sh", &args, PRE_START_TIMEOUT)
                .await?
            {
                Some(status) if status.success() => {
                    debug!(service = %service.name, command = %pre, "Pre-start command finished");
                }
                Some(status) => {
                    return Err(LaunchError::PreStartFailed {
                        command: pre.clone(),
                        reason: status.to_string(),
                    });
                }
                None => {
                    return Err(LaunchError::PreStartFailed {
                        command: pre.clone(),
                        reason: format!("timed out after {:?}", PRE_START_TIMEOUT),
                    });
                }
            }
        }

        let mut cmd = Command::new(&program);
        cmd.args(&service.args);
        cmd.envs(&service.env);

        if let Some(ref dir) = service.working_directory {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        // New session: the child leads its own process group
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LaunchError::ExecutableNotFound(service.command.clone()),
            _ => LaunchError::SpawnFailed {
                command: service.command_line(),
                reason: e.to_string(),
            },
        })?;

        let pid = child.id();
        self.processes.write().await.insert(
            pid,
            Tracked {
                service: service.name.clone(),
                exit: None,
            },
        );

        if let Some(stdout) = child.stdout.take() {
            let file = std::fs::File::from(std::os::fd::OwnedFd::from(stdout));
            self.forward_output(&service.name, pid, Stream::Stdout, tokio::fs::File::from_std(file));
        }
        if let Some(stderr) = child.stderr.take() {
            let file = std::fs::File::from(std::os::fd::OwnedFd::from(stderr));
            self.forward_output(&service.name, pid, Stream::Stderr, tokio::fs::File::from_std(file));
        }

        self.journal
            .log(JournalEntry::new(
                &service.name,
                &format!("started {} (pid {})", service.command_line(), pid),
                Stream::Supervisor,
            ))
            .await;

        info!(service = %service.name, pid = pid, command = %program.display(), "Spawned process");

        Ok(RunningProcess {
            pid,
            pgid: pid,
            service: service.name.clone(),
            command: service.command.clone(),
            started_at: Utc::now(),
            launched: Instant::now(),
        })
    }

    /// Copy lines from a child pipe into the journal until EOF.
    fn forward_output<R>(&self, service: &str, pid: u32, stream: Stream, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let journal = Arc::clone(&self.journal);
        let service = service.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let entry = JournalEntry::new(&service, &line, stream).with_pid(pid);
                        journal.log(entry).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(service = %service, pid = pid, error = %e, "Output pipe closed");
                        break;
                    }
                }
            }
        });
    }

    /// Stop a process: SIGTERM to its group, then SIGKILL after `grace`.
    ///
    /// Setting `force` to true skips whatever remains of the grace period.
    pub async fn stop(
        &self,
        process: &RunningProcess,
        grace: Duration,
        force: &mut watch::Receiver<bool>,
    ) -> std::result::Result<ExitStatus, StopError> {
        let pid = process.pid;

        if let Some(status) = self.reap(pid).await {
            self.finish(process, &status).await;
            return Ok(status);
        }

        self.signal_group(process.pgid, Signal::SIGTERM)?;
        debug!(service = %process.service, pid = pid, "Sent SIGTERM to process group");

        let deadline = Instant::now() + grace;
        loop {
            if let Some(status) = self.reap(pid).await {
                self.finish(process, &status).await;
                return Ok(status);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(service = %process.service, pid = pid, "Process didn't exit in time, sending SIGKILL");
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(WAIT_POLL.min(deadline - now)) => {}
                _ = wait_until_set(force) => {
                    warn!(service = %process.service, pid = pid, "Stop escalated, sending SIGKILL");
                    break;
                }
            }
        }

        self.signal_group(process.pgid, Signal::SIGKILL)?;

        let kill_deadline = Instant::now() + self.kill_wait;
        loop {
            if let Some(status) = self.reap(pid).await {
                self.finish(process, &status).await;
                return Ok(status);
            }
            if Instant::now() >= kill_deadline {
                error!(service = %process.service, pid = pid, "Process didn't respond to SIGKILL");
                return Err(StopError::Timeout {
                    pid,
                    waited: self.kill_wait,
                });
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    /// Stop without an external escalation source.
    pub async fn stop_now(
        &self,
        process: &RunningProcess,
        grace: Duration,
    ) -> std::result::Result<ExitStatus, StopError> {
        let (_tx, mut rx) = watch::channel(false);
        self.stop(process, grace, &mut rx).await
    }

    /// Kill leftovers in the group and forget the PID.
    async fn finish(&self, process: &RunningProcess, status: &ExitStatus) {
        // Workers forked by the daemon may outlive the group leader.
        if let Err(e) = signal::killpg(Pid::from_raw(process.pgid as i32), Signal::SIGKILL) {
            if e != nix::Error::ESRCH {
                warn!(service = %process.service, pgid = process.pgid, error = %e, "Failed to sweep process group");
            }
        }
        self.processes.write().await.remove(&process.pid);

        self.journal
            .log(JournalEntry::new(
                &process.service,
                &format!("pid {} stopped: {}", process.pid, status),
                Stream::Supervisor,
            ))
            .await;
        info!(service = %process.service, pid = process.pid, status = %status, "Process stopped");
    }

    /// Signal a process group; `Ok(false)` when the group is already gone.
    fn signal_group(&self, pgid: u32, sig: Signal) -> std::result::Result<bool, StopError> {
        match signal::killpg(Pid::from_raw(pgid as i32), sig) {
            Ok(()) => Ok(true),
            Err(nix::Error::ESRCH) => Ok(false),
            Err(source) => Err(StopError::Signal { pgid, source }),
        }
    }

    /// Reap a specific process without blocking.
    ///
    /// Returns `None` while the process is still running.
    pub async fn try_wait(&self, pid: u32) -> Result<Option<ExitStatus>> {
        if let Some(tracked) = self.processes.read().await.get(&pid) {
            if let Some(ref status) = tracked.exit {
                return Ok(Some(status.clone()));
            }
        }

        let status = match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => ExitStatus {
                pid,
                code: Some(code),
                signal: None,
            },
            Ok(WaitStatus::Signaled(_, sig, _)) => ExitStatus {
                pid,
                code: None,
                signal: Some(sig as i32),
            },
            Ok(_) => return Ok(None),
            // Not our child (any more): someone else reaped it
            Err(nix::Error::ECHILD) => ExitStatus {
                pid,
                code: None,
                signal: None,
            },
            Err(e) => return Err(e.into()),
        };

        if let Some(tracked) = self.processes.write().await.get_mut(&pid) {
            tracked.exit = Some(status.clone());
        }
        Ok(Some(status))
    }

    /// `try_wait` that treats reap errors as "still running".
    async fn reap(&self, pid: u32) -> Option<ExitStatus> {
        match self.try_wait(pid).await {
            Ok(status) => status,
            Err(e) => {
                warn!(pid = pid, error = %e, "Failed to reap process");
                None
            }
        }
    }

    /// Check if a tracked process is still running.
    pub async fn is_running(&self, pid: u32) -> bool {
        matches!(self.try_wait(pid).await, Ok(None))
    }

    /// Reap every exited child (PID 1 duty).
    ///
    /// Statuses of processes the launcher spawned are kept for their owners;
    /// anything else is an orphan re-parented to us and is simply collected.
    pub async fn reap_orphans(&self) -> Vec<ExitStatus> {
        let mut statuses = Vec::new();

        loop {
            let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => ExitStatus {
                    pid: pid.as_raw() as u32,
                    code: Some(code),
                    signal: None,
                },
                Ok(WaitStatus::Signaled(pid, sig, _)) => ExitStatus {
                    pid: pid.as_raw() as u32,
                    code: None,
                    signal: Some(sig as i32),
                },
                Ok(WaitStatus::StillAlive) | Err(nix::Error::ECHILD) => break,
                Ok(_) => continue,
                Err(e) => {
                    error!(error = %e, "Error reaping zombies");
                    break;
                }
            };

            match self.processes.write().await.get_mut(&status.pid) {
                Some(tracked) => {
                    debug!(service = %tracked.service, pid = status.pid, "Reaped managed process");
                    tracked.exit = Some(status.clone());
                }
                None => debug!(pid = status.pid, status = %status, "Reaped orphan process"),
            }
            statuses.push(status);
        }

        statuses
    }

    /// Run a short-lived command to completion in its own process group.
    ///
    /// Returns `None` if it had to be killed after `timeout`.
    pub async fn run_to_completion(
        &self,
        owner: &str,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> std::result::Result<Option<ExitStatus>, LaunchError> {
        let resolved = resolve_executable(program, None)
            .ok_or_else(|| LaunchError::ExecutableNotFound(program.to_string()))?;

        let mut cmd = Command::new(&resolved);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|e| LaunchError::SpawnFailed {
            command: program.to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id();
        self.processes.write().await.insert(
            pid,
            Tracked {
                service: owner.to_string(),
                exit: None,
            },
        );

        let deadline = Instant::now() + timeout;
        let outcome = loop {
            if let Some(status) = self.reap(pid).await {
                break Some(status);
            }
            if Instant::now() >= deadline {
                let _ = signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                let kill_deadline = Instant::now() + self.kill_wait;
                while self.reap(pid).await.is_none() && Instant::now() < kill_deadline {
                    tokio::time::sleep(WAIT_POLL).await;
                }
                break None;
            }
            tokio::time::sleep(WAIT_POLL).await;
        };

        self.processes.write().await.remove(&pid);
        Ok(outcome)
    }

    /// Get the service name for a PID.
    pub async fn get_service_name(&self, pid: u32) -> Option<String> {
        self.processes.read().await.get(&pid).map(|p| p.service.clone())
    }

    /// Get all tracked PIDs.
    pub async fn get_pids(&self) -> Vec<u32> {
        self.processes.read().await.keys().copied().collect()
    }
}

/// Resolve when the flag becomes true; never if the sender goes away.
pub(crate) async fn wait_until_set(flag: &mut watch::Receiver<bool>) {
    loop {
        if *flag.borrow_and_update() {
            return;
        }
        if flag.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Resolve a command to an executable path.
///
/// Commands containing a `/` are used as given; bare names are searched on
/// `path_override` or the supervisor's own `PATH`.
pub fn resolve_executable(command: &str, path_override: Option<&String>) -> Option<PathBuf> {
    if command.contains('/') {
        let path = PathBuf::from(command);
        return is_executable(&path).then_some(path);
    }

    let search = match path_override {
        Some(p) => p.clone(),
        None => std::env::var("PATH").unwrap_or_else(|_| {
            "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string()
        }),
    };

    std::env::split_paths(&search)
        .map(|dir| dir.join(command))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn launcher(dir: &TempDir) -> ProcessLauncher {
        let journal = Arc::new(Journal::new(dir.path().to_path_buf()));
        ProcessLauncher::new(journal, Duration::from_secs(2))
    }

    #[test]
    fn test_resolve_bare_name_on_path() {
        let resolved = resolve_executable("sh", None).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolve_executable("definitely-not-a-real-binary-xyz", None).is_none());
    }

    #[test]
    fn test_resolve_explicit_path() {
        assert!(resolve_executable("/bin/sh", None).is_some());
        assert!(resolve_executable("/nonexistent/daemon", None).is_none());
    }

    #[test]
    fn test_exit_status_display() {
        let exited = ExitStatus {
            pid: 10,
            code: Some(3),
            signal: None,
        };
        assert_eq!(exited.to_string(), "exit code 3");
        assert!(!exited.success());

        let killed = ExitStatus {
            pid: 10,
            code: None,
            signal: Some(9),
        };
        assert_eq!(killed.to_string(), "killed by SIGKILL");
    }

    #[tokio::test]
    async fn test_start_missing_executable() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir);
        let def = ServiceDefinition::new("ghost", "/nonexistent/ovsdb-server");

        let err = launcher.start(&def).await.unwrap_err();
        assert!(matches!(err, LaunchError::ExecutableNotFound(_)));
    }

    #[tokio::test]
    async fn test_start_and_stop_process() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir);
        let def = ServiceDefinition::new("sleeper", "sleep").with_args(["30"]);

        let process = launcher.start(&def).await.unwrap();
        assert_eq!(process.pid, process.pgid);
        assert!(launcher.is_running(process.pid).await);

        let status = launcher
            .stop_now(&process, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(status.signal, Some(Signal::SIGTERM as i32));
        assert!(launcher.get_pids().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_already_exited_process() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir);
        let def = ServiceDefinition::new("oneshot", "true");

        let process = launcher.start(&def).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = launcher
            .stop_now(&process, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_pre_start_failure_aborts_launch() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir);
        let def = ServiceDefinition::new("sleeper", "sleep")
            .with_args(["30"])
            .with_pre_start("exit 7");

        let err = launcher.start(&def).await.unwrap_err();
        assert!(matches!(err, LaunchError::PreStartFailed { .. }));
        assert!(launcher.get_pids().await.is_empty());
    }

    #[tokio::test]
    async fn test_pre_start_and_stale_file_cleanup() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir);
        let stale = dir.path().join("ovsdb-server.pid");
        let marker = dir.path().join("conf.db");
        std::fs::write(&stale, "12345").unwrap();

        let mut def = ServiceDefinition::new("sleeper", "sleep")
            .with_args(["30"])
            .with_pre_start(format!("[ -f {0} ] || touch {0}", marker.display()));
        def.remove_before_start.push(stale.clone());

        let process = launcher.start(&def).await.unwrap();
        assert!(!stale.exists());
        assert!(marker.exists());

        launcher
            .stop_now(&process, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_output_reaches_journal() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir);
        let def = ServiceDefinition::new("chatty", "sh")
            .with_args(["-c", "echo hello-out; echo hello-err >&2; sleep 30"]);

        let process = launcher.start(&def).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let lines: Vec<String> = launcher
            .journal()
            .get_logs("chatty", None)
            .await
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert!(lines.iter().any(|l| l == "hello-out"));
        assert!(lines.iter().any(|l| l == "hello-err"));

        launcher
            .stop_now(&process, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_to_completion_timeout() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir);

        let ok = launcher
            .run_to_completion("probe", "true", &[], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(ok.unwrap().success());

        let timed_out = launcher
            .run_to_completion(
                "probe",
                "sleep",
                &["30".to_string()],
                Duration::from_millis(200),
            )
            .await
            .unwrap();
        assert!(timed_out.is_none());
    }
}
