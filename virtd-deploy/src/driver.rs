//! Runs reconciliations over a whole deployment.
//!
//! Networks come up before the machines attached to them and go down after
//! them. Every reconciler persists its own record after each step, so an
//! interrupted run can be resumed.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use virtd_hypervisor::{
    ssh_flags, Confirm, DeploymentInfo, HypervisorConnector, IpDiscovery, MachineReconciler,
    NetworkReconciler, NetworkState, StateStore, Toolbox,
};

use crate::deployment::Deployment;

/// Permissions and checks for one `deploy` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeployOptions {
    pub allow_reboot: bool,
    pub allow_recreate: bool,
    pub check: bool,
}

/// One line of `info` / `check` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub state: String,
    pub address: Option<String>,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<16} {:<36} {:<10} {}",
            self.name,
            self.kind,
            self.state,
            self.address.as_deref().unwrap_or("-")
        )
    }
}

/// How to reach a machine over SSH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub address: String,
    pub key_file: PathBuf,
    pub flags: Vec<String>,
}

/// Drives the reconcilers of every resource in a deployment.
pub struct Driver {
    deployment: Deployment,
    identity: DeploymentInfo,
    store: Arc<dyn StateStore>,
    connector: Arc<dyn HypervisorConnector>,
    toolbox: Toolbox,
    discovery: IpDiscovery,
}

impl Driver {
    pub fn new(
        deployment: Deployment,
        identity: DeploymentInfo,
        store: Arc<dyn StateStore>,
        connector: Arc<dyn HypervisorConnector>,
        toolbox: Toolbox,
    ) -> Self {
        Self {
            deployment,
            identity,
            store,
            connector,
            toolbox,
            discovery: IpDiscovery::default(),
        }
    }

    pub fn with_discovery(mut self, discovery: IpDiscovery) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }

    pub fn identity(&self) -> &DeploymentInfo {
        &self.identity
    }

    fn machine(&self, name: &str) -> Result<MachineReconciler> {
        let machine = MachineReconciler::load(
            name,
            self.identity.clone(),
            self.store.clone(),
            self.connector.clone(),
            self.toolbox.clone(),
        )
        .with_context(|| format!("Failed to load state of machine '{}'", name))?;
        Ok(machine.with_discovery(self.discovery.clone()))
    }

    fn network(&self, name: &str) -> Result<NetworkReconciler> {
        NetworkReconciler::load(name, self.store.clone(), self.connector.clone())
            .with_context(|| format!("Failed to load state of network '{}'", name))
    }

    fn require_machine(&self, name: &str) -> Result<MachineReconciler> {
        if !self.deployment.machines.contains_key(name) {
            return Err(anyhow!("No machine named '{}' in deployment", name));
        }
        self.machine(name)
    }

    /// Bring every network, then every machine, to its definition.
    pub async fn deploy(&self, options: DeployOptions) -> Result<()> {
        info!(
            deployment = %self.identity.name,
            uuid = %self.identity.id,
            networks = self.deployment.networks.len(),
            machines = self.deployment.machines.len(),
            "Deploying"
        );

        let catalog = self.deployment.catalog();
        for (name, defn) in &self.deployment.networks {
            let mut network = self.network(name)?;
            network
                .create(defn, options.check, options.allow_reboot, &catalog)
                .await
                .with_context(|| format!("Failed to deploy network '{}'", name))?;
        }

        for (name, defn) in &self.deployment.machines {
            let mut machine = self.machine(name)?;
            machine
                .create(defn, options.check, options.allow_reboot, options.allow_recreate)
                .await
                .with_context(|| format!("Failed to deploy machine '{}'", name))?;
        }

        info!(deployment = %self.identity.name, "Deployment finished");
        Ok(())
    }

    /// Destroy every machine, then every network.
    ///
    /// Returns `false` if any resource was left in place, either because
    /// the operator declined or because the hypervisor refused.
    pub async fn destroy(&self, confirm: &dyn Confirm, wipe: bool) -> Result<bool> {
        let mut complete = true;

        for name in self.deployment.machines.keys() {
            let mut machine = self.machine(name)?;
            let done = machine
                .destroy(wipe)
                .await
                .with_context(|| format!("Failed to destroy machine '{}'", name))?;
            if !done {
                warn!(machine = %name, "Machine was not destroyed");
                complete = false;
            } else if wipe {
                self.store.remove(name)?;
            }
        }

        for name in self.deployment.networks.keys() {
            let mut network = self.network(name)?;
            let done = network
                .destroy(confirm)
                .await
                .with_context(|| format!("Failed to destroy network '{}'", name))?;
            if !done {
                warn!(network = %name, "Network was kept");
                complete = false;
            } else if wipe {
                self.store.remove(name)?;
            }
        }

        Ok(complete)
    }

    /// Compare every record with the hypervisor and report the result.
    pub async fn check(&self) -> Result<Vec<ResourceStatus>> {
        let mut report = Vec::new();

        for name in self.deployment.networks.keys() {
            let mut network = self.network(name)?;
            if network.record().state == NetworkState::Up {
                network
                    .check()
                    .await
                    .with_context(|| format!("Failed to check network '{}'", name))?;
            }
            report.push(network_status(&network));
        }

        for name in self.deployment.machines.keys() {
            let mut machine = self.machine(name)?;
            machine
                .check()
                .await
                .with_context(|| format!("Failed to check machine '{}'", name))?;
            report.push(machine_status(&machine));
        }

        Ok(report)
    }

    /// Describe every resource from its record alone.
    pub fn info(&self) -> Result<Vec<ResourceStatus>> {
        let mut report = Vec::new();
        for name in self.deployment.networks.keys() {
            report.push(network_status(&self.network(name)?));
        }
        for name in self.deployment.machines.keys() {
            report.push(machine_status(&self.machine(name)?));
        }
        Ok(report)
    }

    /// Command attaching to a machine's serial console.
    pub fn console_command(&self, machine: &str) -> Result<Vec<String>> {
        Ok(self.require_machine(machine)?.console_command())
    }

    /// Address, key file and options for reaching `machine`.
    ///
    /// The private key is written into `key_dir`.
    pub async fn ssh_target(&self, machine: &str, key_dir: &Path) -> Result<SshTarget> {
        let mut reconciler = self.require_machine(machine)?;
        let address = reconciler
            .ssh_name()
            .await?
            .ok_or_else(|| anyhow!("Machine '{}' has no known address", machine))?;
        let key_file = reconciler.write_ssh_private_key(key_dir)?;
        Ok(SshTarget {
            address,
            flags: ssh_flags(&key_file),
            key_file,
        })
    }
}

fn network_status(network: &NetworkReconciler) -> ResourceStatus {
    ResourceStatus {
        name: network.name().to_string(),
        kind: network.show_type(),
        state: network.record().state.to_string(),
        address: network.public_ipv4().map(str::to_string),
    }
}

fn machine_status(machine: &MachineReconciler) -> ResourceStatus {
    let record = machine.record();
    ResourceStatus {
        name: machine.name().to_string(),
        kind: "libvirtd".to_string(),
        state: record.state.to_string(),
        address: record.private_ipv4.clone(),
    }
}
