//! Health checking for managed services.
//!
//! A [`HealthChecker`] runs an ordered list of [`HealthProbe`]s, cheapest
//! first, and stops at the first failure. Probe errors are folded into an
//! [`HealthVerdict::Unhealthy`]; evaluation always produces a verdict.

use crate::error::HealthCheckError;
use crate::process::{ProcessLauncher, RunningProcess};
use crate::service::{HealthCheck, ServiceDefinition};
use async_trait::async_trait;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Timeout for the TCP connect fallback of the port probe.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of a full health evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    Unhealthy(String),
}

impl HealthVerdict {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthVerdict::Healthy)
    }
}

impl std::fmt::Display for HealthVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthVerdict::Healthy => write!(f, "healthy"),
            HealthVerdict::Unhealthy(reason) => write!(f, "unhealthy: {}", reason),
        }
    }
}

/// Everything a probe may look at.
pub struct ProbeContext<'a> {
    pub service: &'a ServiceDefinition,
    pub process: Option<&'a RunningProcess>,
    pub launcher: &'a ProcessLauncher,
}

/// A single health predicate over a running service.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Short name used in verdict reasons.
    fn name(&self) -> String;

    /// Relative cost; lower runs first.
    fn cost(&self) -> u8;

    /// Run the probe.
    async fn probe(&self, ctx: &ProbeContext<'_>) -> Result<(), HealthCheckError>;
}

/// Tracked PID exists and still runs the program that was launched.
pub struct LivenessProbe;

#[async_trait]
impl HealthProbe for LivenessProbe {
    fn name(&self) -> String {
        "liveness".to_string()
    }

    fn cost(&self) -> u8 {
        0
    }

    async fn probe(&self, ctx: &ProbeContext<'_>) -> Result<(), HealthCheckError> {
        let process = ctx.process.ok_or(HealthCheckError::NotRunning)?;

        match ctx.launcher.try_wait(process.pid).await {
            Ok(Some(status)) => {
                return Err(HealthCheckError::Exited {
                    pid: process.pid,
                    status: status.to_string(),
                })
            }
            Ok(None) => {}
            Err(e) => {
                return Err(HealthCheckError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e.to_string(),
                )))
            }
        }

        verify_identity(Path::new("/proc"), process.pid, &process.command)
    }
}

/// Check `/proc/<pid>/cmdline` against the launched command.
///
/// Both argv[0] and argv[1] are accepted so interpreter scripts
/// (`python3 /usr/bin/ryu-manager`) still match.
fn verify_identity(proc_root: &Path, pid: u32, command: &str) -> Result<(), HealthCheckError> {
    if !proc_root.join("self").exists() {
        return match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None) {
            Ok(()) => Ok(()),
            Err(_) => Err(HealthCheckError::Exited {
                pid,
                status: "no longer in the process table".to_string(),
            }),
        };
    }

    let cmdline = match std::fs::read(proc_root.join(pid.to_string()).join("cmdline")) {
        Ok(bytes) => bytes,
        Err(_) => {
            return Err(HealthCheckError::Exited {
                pid,
                status: "no longer in the process table".to_string(),
            })
        }
    };

    let argv: Vec<String> = cmdline
        .split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .take(2)
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect();

    if argv.is_empty() {
        return Err(HealthCheckError::Exited {
            pid,
            status: "zombie".to_string(),
        });
    }

    let expected = basename(command);
    if argv.iter().any(|arg| basename(arg) == expected) {
        Ok(())
    } else {
        Err(HealthCheckError::PidReused {
            pid,
            expected: command.to_string(),
            actual: argv[0].clone(),
        })
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// A TCP port is in the LISTEN state.
pub struct PortProbe {
    pub port: u16,
    pub host: String,
}

#[async_trait]
impl HealthProbe for PortProbe {
    fn name(&self) -> String {
        format!("port:{}", self.port)
    }

    fn cost(&self) -> u8 {
        2
    }

    async fn probe(&self, _ctx: &ProbeContext<'_>) -> Result<(), HealthCheckError> {
        let tables = [
            PathBuf::from("/proc/net/tcp"),
            PathBuf::from("/proc/net/tcp6"),
        ];
        let mut readable = false;
        for table in &tables {
            if let Ok(contents) = std::fs::read_to_string(table) {
                readable = true;
                if listening_in_table(&contents, self.port) {
                    return Ok(());
                }
            }
        }
        if readable {
            return Err(HealthCheckError::PortNotListening(self.port));
        }

        debug!(port = self.port, "No /proc/net tables, falling back to connect");
        let addr = format!("{}:{}", self.host, self.port);
        match tokio::time::timeout(CONNECT_TIMEOUT, tokio::net::TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) | Err(_) => Err(HealthCheckError::PortNotListening(self.port)),
        }
    }
}

/// Whether a `/proc/net/tcp`-format table has a LISTEN socket on `port`.
fn listening_in_table(contents: &str, port: u16) -> bool {
    contents.lines().skip(1).any(|line| {
        let mut fields = line.split_whitespace();
        let local = fields.nth(1);
        let state = fields.nth(1);
        match (local, state) {
            (Some(local), Some("0A")) => local
                .rsplit(':')
                .next()
                .and_then(|hex| u16::from_str_radix(hex, 16).ok())
                == Some(port),
            _ => false,
        }
    })
}

/// A unix socket file exists.
pub struct SocketProbe {
    pub path: PathBuf,
}

#[async_trait]
impl HealthProbe for SocketProbe {
    fn name(&self) -> String {
        format!("socket:{}", self.path.display())
    }

    fn cost(&self) -> u8 {
        1
    }

    async fn probe(&self, _ctx: &ProbeContext<'_>) -> Result<(), HealthCheckError> {
        match std::fs::metadata(&self.path) {
            Ok(meta) if meta.file_type().is_socket() => Ok(()),
            _ => Err(HealthCheckError::SocketMissing(self.path.clone())),
        }
    }
}

/// A read-only diagnostic command exits zero within its timeout.
pub struct CommandProbe {
    pub command: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

#[async_trait]
impl HealthProbe for CommandProbe {
    fn name(&self) -> String {
        format!("command:{}", self.command)
    }

    fn cost(&self) -> u8 {
        3
    }

    async fn probe(&self, ctx: &ProbeContext<'_>) -> Result<(), HealthCheckError> {
        let outcome = ctx
            .launcher
            .run_to_completion(&ctx.service.name, &self.command, &self.args, self.timeout)
            .await?;

        match outcome {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(HealthCheckError::NonZeroExit {
                command: self.command.clone(),
                code: status.code,
            }),
            None => Err(HealthCheckError::Timeout {
                command: self.command.clone(),
                timeout: self.timeout,
            }),
        }
    }
}

/// Build the probe for a configured check.
pub fn probe_for(check: &HealthCheck) -> Box<dyn HealthProbe> {
    match check {
        HealthCheck::Liveness => Box::new(LivenessProbe),
        HealthCheck::Port { port, host } => Box::new(PortProbe {
            port: *port,
            host: host.clone(),
        }),
        HealthCheck::Socket { path } => Box::new(SocketProbe { path: path.clone() }),
        HealthCheck::Command {
            command,
            args,
            timeout,
        } => Box::new(CommandProbe {
            command: command.clone(),
            args: args.clone(),
            timeout: *timeout,
        }),
    }
}

/// Ordered, short-circuiting composition of probes.
pub struct HealthChecker {
    probes: Vec<Box<dyn HealthProbe>>,
}

impl HealthChecker {
    /// Build a checker from probes, ordering them by cost.
    pub fn new(mut probes: Vec<Box<dyn HealthProbe>>) -> Self {
        probes.sort_by_key(|p| p.cost());
        Self { probes }
    }

    /// Build a checker from a service's configured checks.
    pub fn from_checks(checks: &[HealthCheck]) -> Self {
        Self::new(checks.iter().map(probe_for).collect())
    }

    /// Names of the probes in evaluation order.
    pub fn probe_names(&self) -> Vec<String> {
        self.probes.iter().map(|p| p.name()).collect()
    }

    /// Evaluate every probe until one fails.
    pub async fn check(&self, ctx: &ProbeContext<'_>) -> HealthVerdict {
        for probe in &self.probes {
            if let Err(e) = probe.probe(ctx).await {
                debug!(service = %ctx.service.name, probe = %probe.name(), error = %e, "Health probe failed");
                return HealthVerdict::Unhealthy(format!("{}: {}", probe.name(), e));
            }
        }
        HealthVerdict::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    const PROC_NET_TCP: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:19E9 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12345 1 0000000000000000 100 0 0 10 0
   1: 0100007F:1F90 0100007F:A2C4 01 00000000:00000000 00:00000000 00000000     0        0 12346 1 0000000000000000 20 4 30 10 -1
";

    struct CountingProbe {
        cost: u8,
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl HealthProbe for CountingProbe {
        fn name(&self) -> String {
            format!("counting-{}", self.cost)
        }

        fn cost(&self) -> u8 {
            self.cost
        }

        async fn probe(&self, _ctx: &ProbeContext<'_>) -> Result<(), HealthCheckError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(HealthCheckError::NotRunning)
            } else {
                Ok(())
            }
        }
    }

    fn launcher(dir: &TempDir) -> ProcessLauncher {
        ProcessLauncher::new(
            Arc::new(Journal::new(dir.path().to_path_buf())),
            Duration::from_secs(2),
        )
    }

    #[test]
    fn test_listening_in_table() {
        assert!(listening_in_table(PROC_NET_TCP, 6633));
        // Established, not listening
        assert!(!listening_in_table(PROC_NET_TCP, 8080));
        assert!(!listening_in_table(PROC_NET_TCP, 6653));
    }

    #[test]
    fn test_checker_orders_by_cost() {
        let checker = HealthChecker::from_checks(&[
            HealthCheck::command("ovs-vsctl", &["show"]),
            HealthCheck::port(6633),
            HealthCheck::Liveness,
        ]);
        assert_eq!(
            checker.probe_names(),
            vec!["liveness", "port:6633", "command:ovs-vsctl"]
        );
    }

    #[tokio::test]
    async fn test_short_circuits_on_first_failure() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir);
        let def = ServiceDefinition::new("svc", "sleep");
        let cheap = Arc::new(AtomicUsize::new(0));
        let expensive = Arc::new(AtomicUsize::new(0));

        let checker = HealthChecker::new(vec![
            Box::new(CountingProbe {
                cost: 3,
                fail: false,
                calls: Arc::clone(&expensive),
            }),
            Box::new(CountingProbe {
                cost: 0,
                fail: true,
                calls: Arc::clone(&cheap),
            }),
        ]);

        let ctx = ProbeContext {
            service: &def,
            process: None,
            launcher: &launcher,
        };
        let verdict = checker.check(&ctx).await;

        assert!(!verdict.is_healthy());
        assert_eq!(cheap.load(Ordering::SeqCst), 1);
        assert_eq!(expensive.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_liveness_without_process() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir);
        let def = ServiceDefinition::new("svc", "sleep");
        let ctx = ProbeContext {
            service: &def,
            process: None,
            launcher: &launcher,
        };

        let verdict = HealthChecker::from_checks(&[HealthCheck::Liveness])
            .check(&ctx)
            .await;
        assert_eq!(
            verdict,
            HealthVerdict::Unhealthy("liveness: no process is running".to_string())
        );
    }

    #[tokio::test]
    async fn test_liveness_running_and_exited() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir);
        let def = ServiceDefinition::new("svc", "sleep").with_args(["30"]);
        let process = launcher.start(&def).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let checker = HealthChecker::from_checks(&[HealthCheck::Liveness]);
        let ctx = ProbeContext {
            service: &def,
            process: Some(&process),
            launcher: &launcher,
        };
        assert!(checker.check(&ctx).await.is_healthy());

        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(process.pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!checker.check(&ctx).await.is_healthy());
    }

    #[test]
    fn test_identity_detects_pid_reuse() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("self")).unwrap();
        std::fs::create_dir_all(dir.path().join("77")).unwrap();
        std::fs::write(dir.path().join("77/cmdline"), b"/usr/sbin/sshd\0-D\0").unwrap();

        let err = verify_identity(dir.path(), 77, "/usr/sbin/ovsdb-server").unwrap_err();
        assert!(matches!(err, HealthCheckError::PidReused { pid: 77, .. }));

        std::fs::write(
            dir.path().join("77/cmdline"),
            b"/usr/bin/python3\0/usr/local/bin/ryu-manager\0--verbose\0",
        )
        .unwrap();
        assert!(verify_identity(dir.path(), 77, "ryu-manager").is_ok());

        std::fs::write(dir.path().join("77/cmdline"), b"").unwrap();
        assert!(matches!(
            verify_identity(dir.path(), 77, "ryu-manager"),
            Err(HealthCheckError::Exited { .. })
        ));
    }

    #[tokio::test]
    async fn test_socket_probe() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir);
        let def = ServiceDefinition::new("svc", "sleep");
        let ctx = ProbeContext {
            service: &def,
            process: None,
            launcher: &launcher,
        };

        let path = dir.path().join("db.sock");
        let probe = SocketProbe { path: path.clone() };
        assert!(probe.probe(&ctx).await.is_err());

        // A regular file is not a socket
        std::fs::write(&path, "").unwrap();
        assert!(probe.probe(&ctx).await.is_err());
        std::fs::remove_file(&path).unwrap();

        let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        assert!(probe.probe(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_command_probe_outcomes() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir);
        let def = ServiceDefinition::new("svc", "sleep");
        let ctx = ProbeContext {
            service: &def,
            process: None,
            launcher: &launcher,
        };

        let ok = CommandProbe {
            command: "true".to_string(),
            args: vec![],
            timeout: Duration::from_secs(5),
        };
        assert!(ok.probe(&ctx).await.is_ok());

        let failing = CommandProbe {
            command: "false".to_string(),
            args: vec![],
            timeout: Duration::from_secs(5),
        };
        assert!(matches!(
            failing.probe(&ctx).await,
            Err(HealthCheckError::NonZeroExit { code: Some(1), .. })
        ));

        let slow = CommandProbe {
            command: "sleep".to_string(),
            args: vec!["30".to_string()],
            timeout: Duration::from_millis(200),
        };
        assert!(matches!(
            slow.probe(&ctx).await,
            Err(HealthCheckError::Timeout { .. })
        ));

        let missing = CommandProbe {
            command: "no-such-probe-binary".to_string(),
            args: vec![],
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            missing.probe(&ctx).await,
            Err(HealthCheckError::Launch(_))
        ));
    }
}
