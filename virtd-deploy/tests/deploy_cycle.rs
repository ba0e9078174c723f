//! Integration tests for the deployment driver.
//!
//! These tests run complete deploy/destroy cycles against the mock
//! hypervisor and a JSON state file.

use std::sync::Arc;
use std::time::Duration;
use virtd_deploy::dev::DevEnvironment;
use virtd_deploy::{DeployOptions, Deployment, Driver, JsonFileStore};
use virtd_hypervisor::{
    AutoConfirm, DeploymentInfo, IpDiscovery, MachineState, MockBackend, MockConnector,
    NetworkRecord, NetworkState, StateStore,
};

const LAB: &str = r#"
name: lab
uuid: 6f1c0de2-7f43-4c3a-9d0e-3a5b2f1e9c44
networks:
  lab-net:
    type: nat
    cidrBlock: 10.10.0.0/24
    staticIPs:
      - { machine: web, address: 10.10.0.10 }
machines:
  web:
    memorySize: 1024
    networks:
      - { type: nat, name: lab-net }
  db:
    headless: true
    networks:
      - { type: nat, name: lab-net }
"#;

struct Harness {
    driver: Driver,
    backend: Arc<MockBackend>,
    store: Arc<JsonFileStore>,
    identity: DeploymentInfo,
    _env: DevEnvironment,
    _dir: tempfile::TempDir,
}

fn harness(yaml: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let deployment = Deployment::from_yaml(yaml).unwrap();
    let identity = DeploymentInfo::new(deployment.uuid.clone().unwrap(), deployment.name.clone());

    let env = DevEnvironment::new(&deployment, &identity).unwrap();
    let backend = env.backend.clone();
    let store = Arc::new(JsonFileStore::open(dir.path().join("state.json")).unwrap());

    let driver = Driver::new(
        deployment,
        identity.clone(),
        store.clone() as Arc<dyn StateStore>,
        Arc::new(MockConnector::new(backend.clone())),
        env.toolbox.clone(),
    )
    .with_discovery(IpDiscovery::new(Duration::from_millis(1)));

    Harness {
        driver,
        backend,
        store,
        identity,
        _env: env,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_deploy_brings_up_network_then_machines() {
    let h = harness(LAB);
    h.driver.deploy(DeployOptions::default()).await.unwrap();

    let net = h.backend.network("lab-net").expect("network defined");
    assert!(net.active);
    assert!(net.autostart);
    assert!(net.forward_nat);
    assert_eq!(net.dhcp_hosts, vec![("web".to_string(), "10.10.0.10".to_string())]);

    for machine in ["web", "db"] {
        let id = h.identity.machine_id(machine);
        assert!(h.backend.domain_is_running(&id), "{} should run", machine);
        let xml = h.backend.domain_xml(&id).unwrap();
        assert!(xml.contains(r#"<source network="lab-net"/>"#));
    }

    let calls = h.backend.calls();
    let first_net = calls.iter().position(|c| c == "define_network").unwrap();
    let first_dom = calls.iter().position(|c| c == "define_domain").unwrap();
    assert!(first_net < first_dom);

    let info = h.driver.info().unwrap();
    let names: Vec<&str> = info.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["lab-net", "db", "web"]);
    assert_eq!(info[0].state, "up");
    assert_eq!(info[0].address.as_deref(), Some("10.10.0.0/24"));
    assert_eq!(info[2].state, "running");
    assert_eq!(info[2].address.as_deref(), Some("10.10.0.10"));
    assert_eq!(info[1].address.as_deref(), Some("192.168.122.10"));
}

#[tokio::test]
async fn test_state_file_reflects_deployment() {
    let h = harness(LAB);
    h.driver.deploy(DeployOptions::default()).await.unwrap();

    let reopened = JsonFileStore::open(h.store.path()).unwrap();
    assert_eq!(reopened.resources().unwrap(), vec!["db", "lab-net", "web"]);

    let net = NetworkRecord::from_attributes(&reopened.load("lab-net").unwrap()).unwrap();
    assert_eq!(net.state, NetworkState::Up);
    assert_eq!(net.network_cidr.as_deref(), Some("10.10.0.0/24"));
    assert_eq!(net.static_ips.get("web").map(String::as_str), Some("10.10.0.10"));

    let web = reopened.load("web").unwrap();
    assert_eq!(web["state"], "running");
    assert_eq!(web["libvirtd.primaryNet"], "lab-net");
}

#[tokio::test]
async fn test_redeploy_is_quiet() {
    let h = harness(LAB);
    h.driver.deploy(DeployOptions::default()).await.unwrap();
    let defines = h.backend.calls_named("define_domain");
    let uploads = h.backend.calls_named("upload_volume");

    h.driver.deploy(DeployOptions::default()).await.unwrap();
    assert_eq!(h.backend.calls_named("define_domain"), defines);
    assert_eq!(h.backend.calls_named("upload_volume"), uploads);
    assert_eq!(h.backend.calls_named("define_network"), 1);
}

#[tokio::test]
async fn test_check_notices_missing_domain() {
    let h = harness(LAB);
    h.driver.deploy(DeployOptions::default()).await.unwrap();

    h.backend.remove_domain(&h.identity.machine_id("db"));
    let report = h.driver.check().await.unwrap();
    let db = report.iter().find(|s| s.name == "db").unwrap();
    assert_eq!(db.state, MachineState::Absent.to_string());
    let web = report.iter().find(|s| s.name == "web").unwrap();
    assert_eq!(web.state, "running");
}

#[tokio::test]
async fn test_destroy_declined_keeps_network() {
    let h = harness(LAB);
    h.driver.deploy(DeployOptions::default()).await.unwrap();

    let complete = h.driver.destroy(&AutoConfirm(false), false).await.unwrap();
    assert!(!complete);

    assert!(!h.backend.domain_exists(&h.identity.machine_id("web")));
    assert!(h.backend.network("lab-net").is_some());

    let web = h.store.load("web").unwrap();
    assert_eq!(web["state"], "destroyed");
    // Keys survive a destroy without wipe.
    assert!(web.contains_key("libvirtd.clientPrivateKey"));
}

#[tokio::test]
async fn test_destroy_with_wipe_clears_everything() {
    let h = harness(LAB);
    h.driver.deploy(DeployOptions::default()).await.unwrap();

    let complete = h.driver.destroy(&AutoConfirm(true), true).await.unwrap();
    assert!(complete);

    assert!(h.backend.network("lab-net").is_none());
    assert!(!h.backend.domain_exists(&h.identity.machine_id("db")));
    assert!(h.backend.volume("default", &format!("{}.qcow2", h.identity.machine_id("db"))).is_none());
    assert!(h.store.resources().unwrap().is_empty());
}

#[tokio::test]
async fn test_ssh_target_writes_key() {
    let h = harness(LAB);
    h.driver.deploy(DeployOptions::default()).await.unwrap();

    let keys = tempfile::tempdir().unwrap();
    let target = h.driver.ssh_target("web", keys.path()).await.unwrap();
    assert_eq!(target.address, "10.10.0.10");
    assert!(target.key_file.exists());
    assert_eq!(target.flags[0], "-o");
    assert_eq!(target.flags[3], target.key_file.display().to_string());

    assert!(h.driver.ssh_target("nope", keys.path()).await.is_err());
}

#[tokio::test]
async fn test_console_command_names_domain() {
    let h = harness(LAB);
    h.driver.deploy(DeployOptions::default()).await.unwrap();

    let command = h.driver.console_command("db").unwrap();
    assert_eq!(command[0], "virsh");
    assert_eq!(command.last().unwrap(), &h.identity.machine_id("db"));
}
