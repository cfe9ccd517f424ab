//! Built-in definitions for the lab daemons.
//!
//! The switch container runs the Open vSwitch database server and the
//! forwarding daemon; the controller container runs ryu-manager. All of
//! them run in the foreground so the supervisor owns their PIDs.

use crate::service::{HealthCheck, ServiceDefinition};
use std::path::PathBuf;
use std::time::Duration;

/// Open vSwitch runtime directory.
pub const OVS_RUN_DIR: &str = "/var/run/openvswitch";
/// Open vSwitch database file.
pub const OVS_DB: &str = "/etc/openvswitch/conf.db";
/// Schema used to create the database.
pub const OVS_SCHEMA: &str = "/usr/share/openvswitch/vswitch.ovsschema";
/// Default OpenFlow listen port of the controller.
pub const DEFAULT_OPENFLOW_PORT: u16 = 6633;
/// Directory holding the ryu checkout.
pub const RYU_DIR: &str = "/opt/ukmsdn/ryu";

fn run_file(name: &str) -> PathBuf {
    PathBuf::from(OVS_RUN_DIR).join(name)
}

/// The switch database server.
pub fn ovsdb_server() -> ServiceDefinition {
    let socket = run_file("db.sock");
    let mut def = ServiceDefinition::new("ovsdb-server", "ovsdb-server")
        .with_description("Open vSwitch database server")
        .with_args([
            OVS_DB.to_string(),
            format!("--remote=punix:{}", socket.display()),
            "--remote=db:Open_vSwitch,Open_vSwitch,manager_options".to_string(),
            format!("--pidfile={}", run_file("ovsdb-server.pid").display()),
            format!("--unixctl={}", run_file("ovsdb-server.ctl").display()),
        ])
        .with_pre_start(format!("mkdir -p {} /etc/openvswitch", OVS_RUN_DIR))
        .with_pre_start(format!(
            "[ -f {db} ] || ovsdb-tool create {db} {schema}",
            db = OVS_DB,
            schema = OVS_SCHEMA
        ))
        .with_health_check(HealthCheck::Socket {
            path: socket.clone(),
        });
    def.remove_before_start = vec![socket, run_file("ovsdb-server.pid")];
    def
}

/// The switch forwarding daemon.
///
/// Waits up to 30 seconds for the database socket, then initializes the
/// database before launching.
pub fn ovs_vswitchd() -> ServiceDefinition {
    let socket = run_file("db.sock");
    let mut def = ServiceDefinition::new("ovs-vswitchd", "ovs-vswitchd")
        .with_description("Open vSwitch forwarding daemon")
        .with_args([
            format!("--pidfile={}", run_file("ovs-vswitchd.pid").display()),
            format!("--unixctl={}", run_file("ovs-vswitchd.ctl").display()),
        ])
        .with_pre_start(format!(
            "i=0; while [ ! -S {sock} ] && [ $i -lt 30 ]; do sleep 1; i=$((i+1)); done; [ -S {sock} ]",
            sock = socket.display()
        ))
        .with_pre_start("ovs-vsctl --no-wait init")
        .with_health_check(HealthCheck::command("ovs-vsctl", &["show"]))
        .with_stop_timeout(Duration::from_secs(10));
    def.remove_before_start = vec![run_file("ovs-vswitchd.pid")];
    def
}

/// Services of the switch container, database first.
pub fn switch_services() -> Vec<ServiceDefinition> {
    vec![ovsdb_server(), ovs_vswitchd()]
}

/// The SDN controller listening for OpenFlow on `port`.
pub fn controller_service(port: u16) -> ServiceDefinition {
    let mut def = ServiceDefinition::new("ryu-manager", "ryu-manager")
        .with_description("Ryu OpenFlow controller")
        .with_args([
            "--ofp-tcp-listen-port".to_string(),
            port.to_string(),
            "ryu/app/simple_switch_13.py".to_string(),
            "--verbose".to_string(),
        ])
        .with_health_check(HealthCheck::port(port));
    def.working_directory = Some(PathBuf::from(RYU_DIR));
    def
}

/// Look up a preset by name: `switch`, `controller` or `lab` (both).
pub fn by_name(name: &str) -> Option<Vec<ServiceDefinition>> {
    match name {
        "switch" => Some(switch_services()),
        "controller" => Some(vec![controller_service(DEFAULT_OPENFLOW_PORT)]),
        "lab" => {
            let mut all = switch_services();
            all.push(controller_service(DEFAULT_OPENFLOW_PORT));
            Some(all)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigFile, SupervisorConfig};

    #[test]
    fn test_switch_services_order_and_checks() {
        let services = switch_services();
        assert_eq!(services[0].name, "ovsdb-server");
        assert_eq!(services[1].name, "ovs-vswitchd");

        assert!(services[0]
            .health
            .iter()
            .any(|c| matches!(c, HealthCheck::Socket { .. })));
        assert_eq!(
            services[1].health.last(),
            Some(&HealthCheck::command("ovs-vsctl", &["show"]))
        );
        assert!(services[0]
            .remove_before_start
            .contains(&PathBuf::from("/var/run/openvswitch/db.sock")));
    }

    #[test]
    fn test_controller_port() {
        let def = controller_service(6653);
        assert!(def.args.contains(&"6653".to_string()));
        assert_eq!(def.health, vec![HealthCheck::Liveness, HealthCheck::port(6653)]);
    }

    #[test]
    fn test_presets_survive_toml() {
        let file = ConfigFile {
            services: by_name("lab").unwrap(),
            ..ConfigFile::default()
        };
        let text = file.to_toml().unwrap();
        let parsed: ConfigFile = toml::from_str(&text).unwrap();
        assert_eq!(parsed.services, file.services);

        let mut config = SupervisorConfig::default();
        config.apply_file(parsed);
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_preset() {
        assert!(by_name("mininet").is_none());
    }
}
