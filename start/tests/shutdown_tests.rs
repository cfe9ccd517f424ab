//! Tests for shutdown and the container entry point

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::assert_ok;
use ukmsdn_start::{
    exit_code, ControlClient, EntryPoint, ServiceDefinition, ServiceState, ShutdownCoordinator,
    Supervisor, SupervisorConfig,
};

/// Create a configuration with short timings inside a temporary directory
fn create_test_config(dir: &TempDir, services: Vec<ServiceDefinition>) -> SupervisorConfig {
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

fn sleeper(name: &str) -> ServiceDefinition {
    ServiceDefinition::new(name, "sleep").with_args(["30"])
}

fn is_gone(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None) == Err(Errno::ESRCH)
}

/// Dead, or a zombie waiting on a parent that is not us
fn is_dead(pid: u32) -> bool {
    if is_gone(pid) {
        return true;
    }
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            let (_, rest) = stat.rsplit_once(')')?;
            rest.split_whitespace().next().map(|state| state == "Z" || state == "X")
        })
        .unwrap_or(true)
}

mod coordinator {
    use super::*;

    #[tokio::test]
    async fn test_graceful_shutdown_of_two_services() {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(&dir, vec![sleeper("ovsdb-server"), sleeper("ovs-vswitchd")]);
        let supervisor = Arc::new(Supervisor::new(config).await.unwrap());
        supervisor.start_all().await.unwrap();
        let mut loops = supervisor.spawn_loops();

        let pids: Vec<u32> = supervisor
            .statuses()
            .await
            .iter()
            .map(|s| s.pid.unwrap())
            .collect();
        assert_eq!(pids.len(), 2);

        let report = ShutdownCoordinator::new(Arc::clone(&supervisor))
            .shutdown("received SIGTERM")
            .await
            .unwrap()
            .unwrap();
        loops.shutdown().await;

        assert!(report.is_clean());
        assert_eq!(report.exit_code(), exit_code::CLEAN);
        assert_eq!(report.stopped, vec!["ovs-vswitchd", "ovsdb-server"]);

        for status in supervisor.statuses().await {
            assert_eq!(status.state, ServiceState::Stopped);
            assert!(status.pid.is_none());
        }
        for pid in pids {
            assert!(is_gone(pid), "process {} survived shutdown", pid);
        }
    }

    #[tokio::test]
    async fn test_term_ignoring_process_is_killed() {
        let dir = TempDir::new().unwrap();
        let stubborn = ServiceDefinition::new("stubborn", "sh")
            .with_args(["-c", "trap '' TERM; while true; do sleep 1; done"])
            .with_stop_timeout(Duration::from_millis(500));
        let config = create_test_config(&dir, vec![stubborn]);
        let supervisor = Arc::new(Supervisor::new(config).await.unwrap());
        supervisor.start_all().await.unwrap();
        let pid = supervisor.status("stubborn").await.unwrap().pid.unwrap();

        let report = ShutdownCoordinator::new(Arc::clone(&supervisor))
            .shutdown("received SIGTERM")
            .await
            .unwrap()
            .unwrap();

        assert!(report.is_clean());
        assert_eq!(report.stopped, vec!["stubborn"]);
        assert!(is_gone(pid));

        let events = supervisor.events().events().unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.to, ServiceState::Stopped);
        assert!(last.reason.contains("SIGKILL"));
    }

    #[tokio::test]
    async fn test_forked_workers_die_with_service() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("worker.pid");
        let forking = ServiceDefinition::new("ovs-vswitchd", "sh").with_args([
            "-c".to_string(),
            format!("sleep 300 & echo $! > {}; wait", pid_file.display()),
        ]);
        let config = create_test_config(&dir, vec![forking]);
        let supervisor = Arc::new(Supervisor::new(config).await.unwrap());
        supervisor.start_all().await.unwrap();
        let pid = supervisor.status("ovs-vswitchd").await.unwrap().pid.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let worker = loop {
            if let Some(worker) = std::fs::read_to_string(&pid_file)
                .ok()
                .and_then(|text| text.trim().parse::<u32>().ok())
            {
                break worker;
            }
            assert!(tokio::time::Instant::now() < deadline, "worker pid never written");
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert_ne!(worker, pid);
        assert!(!is_dead(worker));

        let report = ShutdownCoordinator::new(Arc::clone(&supervisor))
            .shutdown("received SIGTERM")
            .await
            .unwrap()
            .unwrap();
        assert!(report.is_clean());
        assert!(is_gone(pid));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !is_dead(worker) {
            assert!(tokio::time::Instant::now() < deadline, "worker {} outlived its service", worker);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_service_without_process_stops() {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(&dir, vec![ServiceDefinition::new("ghost", "/nonexistent/daemon")]);
        let supervisor = Arc::new(Supervisor::new(config).await.unwrap());
        assert!(supervisor.start_all().await.is_err());

        let report = ShutdownCoordinator::new(Arc::clone(&supervisor))
            .shutdown("initial start failed")
            .await
            .unwrap()
            .unwrap();
        assert!(report.is_clean());
        assert_eq!(
            supervisor.status("ghost").await.unwrap().state,
            ServiceState::Stopped
        );
    }
}

mod entry_point {
    use super::*;

    #[tokio::test]
    async fn test_control_shutdown_exits_clean() {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(&dir, vec![sleeper("ryu-manager")]);
        let client = ControlClient::new(config.control_socket());

        let entry = EntryPoint::new(config).await.unwrap();
        let supervisor = entry.supervisor();
        let running = tokio::spawn(entry.run());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !client.ping().await.unwrap() {
            assert!(tokio::time::Instant::now() < deadline, "control socket never came up");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let pid = supervisor.status("ryu-manager").await.unwrap().pid.unwrap();

        client.shutdown().await.unwrap();
        let code = tokio::time::timeout(Duration::from_secs(10), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(code, exit_code::CLEAN);
        assert!(is_gone(pid));
        assert!(!client.is_available());
    }

    #[tokio::test]
    async fn test_initial_start_failure_exit_code() {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(
            &dir,
            vec![sleeper("ovsdb-server"), ServiceDefinition::new("ghost", "/nonexistent/daemon")],
        );

        let entry = assert_ok!(EntryPoint::new(config).await);
        let supervisor = entry.supervisor();
        let code = assert_ok!(entry.run().await);

        assert_eq!(code, exit_code::START_FAILED);
        assert_eq!(
            supervisor.status("ovsdb-server").await.unwrap().state,
            ServiceState::Stopped
        );
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(&dir, vec![]);
        assert!(EntryPoint::new(config).await.is_err());
    }
}
