//! Network reconciliation.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use super::subnet::{addressing, contains, parse_cidr};
use crate::connection::ConnectionManager;
use crate::error::{best_effort, Result, VirtdError};
use crate::external::Confirm;
use crate::state::{NetworkRecord, NetworkState, StateStore};
use crate::traits::{HypervisorConnector, NetworkSection, NetworkUpdateCommand};
use crate::types::{MachineSpec, NetworkKind, NetworkSpec, StaticIps};
use crate::xml::{dhcp_host_element, forward_nat_element, NetworkXmlBuilder};

/// Machine definitions of the deployment, by name.
pub type MachineCatalog = BTreeMap<String, MachineSpec>;

/// Reconciles one managed virtual network.
pub struct NetworkReconciler {
    name: String,
    record: NetworkRecord,
    conn: ConnectionManager,
    store: Arc<dyn StateStore>,
}

impl NetworkReconciler {
    /// Load the persisted record of `name` and prepare a reconciler.
    pub fn load(
        name: impl Into<String>,
        store: Arc<dyn StateStore>,
        connector: Arc<dyn HypervisorConnector>,
    ) -> Result<Self> {
        let name = name.into();
        let record = NetworkRecord::from_attributes(&store.load(&name)?)?;
        let conn = ConnectionManager::new(record.uri.clone(), connector);
        Ok(Self {
            name,
            record,
            conn,
            store,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record(&self) -> &NetworkRecord {
        &self.record
    }

    pub fn full_name(&self) -> String {
        format!("Libvirtd network '{}'", self.name)
    }

    /// `libvirtd-network`, with the kind appended while up.
    pub fn show_type(&self) -> String {
        match (self.record.state, self.record.network_type) {
            (NetworkState::Up, Some(kind)) => format!("libvirtd-network [{}]", kind),
            _ => "libvirtd-network".to_string(),
        }
    }

    /// The bridge device the network runs on.
    pub fn resource_id(&self) -> Option<&str> {
        self.record.network_name.as_deref()
    }

    /// The network's CIDR block while it is up.
    pub fn public_ipv4(&self) -> Option<&str> {
        match self.record.state {
            NetworkState::Up => self.record.network_cidr.as_deref(),
            NetworkState::Missing => None,
        }
    }

    fn persist(&self) -> Result<()> {
        self.store.store(&self.name, &self.record.to_attributes()?)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Define and start the network, or apply live changes to it.
    #[instrument(skip(self, defn, machines), fields(network = %self.name))]
    pub async fn create(
        &mut self,
        defn: &NetworkSpec,
        check: bool,
        allow_reboot: bool,
        machines: &MachineCatalog,
    ) -> Result<()> {
        if check {
            self.check().await?;
        }

        let subnet = parse_cidr(&defn.cidr_block)?;

        if self.record.state != NetworkState::Up {
            return self.define(defn, machines, &subnet).await;
        }

        if self.need_update(defn, allow_reboot) {
            info!(network = %self.name, "Updating {}", self.full_name());
            self.update(defn, allow_reboot, machines, &subnet).await?;
        }
        Ok(())
    }

    async fn define(
        &mut self,
        defn: &NetworkSpec,
        machines: &MachineCatalog,
        subnet: &ipnet::Ipv4Net,
    ) -> Result<()> {
        info!(network = %self.name, "Creating {}", self.full_name());
        warn_duplicate_addresses(&self.name, &defn.static_ips);

        let mut accepted = StaticIps::new();
        for (machine, address) in &defn.static_ips {
            match self.validate_binding(defn, machines, subnet, machine, address) {
                Ok(()) => {
                    accepted.insert(machine.clone(), address.clone());
                }
                Err(e) => warn!(network = %self.name, "{}", e),
            }
        }

        self.conn.set_uri(&defn.uri);
        self.record.network_type = Some(defn.kind);
        self.record.network_cidr = Some(defn.cidr_block.clone());
        self.record.static_ips = accepted;
        self.record.uri = defn.uri.clone();

        let xml = NetworkXmlBuilder::new(
            &self.name,
            defn.kind,
            addressing(subnet)?,
            &self.record.static_ips,
        )
        .build()?;

        let conn = self.conn.ensure_connected().await?;
        let net = conn.define_network(&xml).await.map_err(|e| {
            error!(network = %self.name, error = %e, "Failed to define network");
            VirtdError::DefineFailed(e.to_string())
        })?;
        conn.start_network(&net).await?;
        conn.set_network_autostart(&net, true).await?;
        let bridge = conn.network_bridge_name(&net).await?;
        info!(network = %self.name, bridge = %bridge, "Network is up");

        self.conn.set_network(net);
        self.record.network_name = Some(bridge);
        self.record.state = NetworkState::Up;
        self.persist()
    }

    /// Whether `defn` differs from the running network in a way that may
    /// be applied now.
    pub fn need_update(&self, defn: &NetworkSpec, allow_reboot: bool) -> bool {
        if self.record.uri != defn.uri {
            warn!(
                network = %self.name,
                "Change of the connection URI from {} to {} is not supported; skipping",
                self.record.uri, defn.uri
            );
            return false;
        }

        let cidr = self.record.network_cidr.as_deref().unwrap_or_default();
        if cidr != defn.cidr_block {
            warn!(
                network = %self.name,
                "Change of the network CIDR from {} to {} is not supported; skipping",
                cidr, defn.cidr_block
            );
            return false;
        }

        let kind_changed = self.record.network_type != Some(defn.kind);
        if !kind_changed && self.record.static_ips == defn.static_ips {
            return false;
        }

        if kind_changed && !allow_reboot {
            warn!(network = %self.name, "Change of the network type requires reboot; skipping");
            return false;
        }

        true
    }

    async fn update(
        &mut self,
        defn: &NetworkSpec,
        allow_reboot: bool,
        machines: &MachineCatalog,
        subnet: &ipnet::Ipv4Net,
    ) -> Result<()> {
        let net = self.conn.ensure_network(&self.name).await?.ok_or_else(|| {
            VirtdError::NotFound(format!("network '{}'", self.name))
        })?;
        let conn = self.conn.ensure_connected().await?;

        if self.record.network_type != Some(defn.kind) {
            let command = match defn.kind {
                NetworkKind::Nat => NetworkUpdateCommand::AddLast,
                NetworkKind::Isolated => NetworkUpdateCommand::Delete,
            };
            conn.update_network(
                &net,
                command,
                NetworkSection::Forward,
                -1,
                &forward_nat_element().render()?,
            )
            .await?;
            self.record.network_type = Some(defn.kind);
            self.persist()?;
        }

        if self.record.static_ips == defn.static_ips {
            return Ok(());
        }
        warn_duplicate_addresses(&self.name, &defn.static_ips);

        let previous = self.record.static_ips.clone();
        let mut applied = previous.clone();

        for (machine, address) in &previous {
            if defn.static_ips.contains_key(machine) {
                continue;
            }
            let host = dhcp_host_element(machine, address).render()?;
            best_effort(
                conn.update_network(&net, NetworkUpdateCommand::Delete, NetworkSection::IpDhcpHost, -1, &host)
                    .await,
            )
            .log_ignored("removing static IP binding");
            applied.remove(machine);
        }

        for (machine, address) in &defn.static_ips {
            let old = previous.get(machine);
            if old == Some(address) {
                continue;
            }

            if let Err(e) = self.validate_binding(defn, machines, subnet, machine, address) {
                warn!(network = %self.name, "{}", e);
                continue;
            }

            if old.is_some() && !allow_reboot {
                warn!(
                    network = %self.name,
                    machine = %machine,
                    "Change of the existing static IP binding requires reboot; skipping"
                );
                continue;
            }

            let command = if old.is_some() {
                NetworkUpdateCommand::Modify
            } else {
                NetworkUpdateCommand::AddLast
            };
            let host = dhcp_host_element(machine, address).render()?;
            match conn
                .update_network(&net, command, NetworkSection::IpDhcpHost, -1, &host)
                .await
            {
                Ok(()) => {
                    info!(network = %self.name, machine = %machine, ip = %address, "Static IP assigned");
                    applied.insert(machine.clone(), address.clone());
                }
                Err(e) => warn!(
                    network = %self.name,
                    error = %e,
                    "Cannot assign static IP '{}' to machine '{}' in subnet '{}'",
                    address, machine, defn.cidr_block
                ),
            }
        }

        self.record.static_ips = applied;
        self.persist()
    }

    fn validate_binding(
        &self,
        defn: &NetworkSpec,
        machines: &MachineCatalog,
        subnet: &ipnet::Ipv4Net,
        machine: &str,
        address: &str,
    ) -> Result<()> {
        let Some(spec) = machines.get(machine) else {
            return Err(VirtdError::Validation(format!(
                "Cannot assign static IP '{}' to non-existent machine '{}'",
                address, machine
            )));
        };

        if !spec.networks.iter().any(|n| n.attaches_to(&self.name, defn.kind)) {
            return Err(VirtdError::Validation(format!(
                "Cannot assign static IP '{}' to non-attached machine '{}'",
                address, machine
            )));
        }

        if !contains(subnet, address) {
            return Err(VirtdError::Validation(format!(
                "Cannot assign static IP '{}' to machine '{}' in subnet '{}': \
                 address is outside the network CIDR",
                address, machine, defn.cidr_block
            )));
        }
        Ok(())
    }

    /// Tear the network down after the operator confirms.
    ///
    /// Returns `false` if the operator declined.
    #[instrument(skip(self, confirm), fields(network = %self.name))]
    pub async fn destroy(&mut self, confirm: &dyn Confirm) -> Result<bool> {
        if self.record.state != NetworkState::Up {
            return Ok(true);
        }
        let Some(net) = self.conn.ensure_network(&self.name).await? else {
            return Ok(true);
        };

        let question = format!("are you sure you want to destroy {}?", self.full_name());
        if !confirm.confirm(&question) {
            return Ok(false);
        }

        info!(network = %self.name, "Destroying {}", self.full_name());
        let conn = self.conn.ensure_connected().await?;
        conn.destroy_network(&net).await?;
        conn.undefine_network(&net).await?;

        self.conn.forget_network();
        self.record.network_name = None;
        self.record.state = NetworkState::Missing;
        self.persist()?;
        Ok(true)
    }

    /// Compare the record with the live network.
    #[instrument(skip(self), fields(network = %self.name))]
    pub async fn check(&mut self) -> Result<NetworkState> {
        self.conn.forget_network();

        match self.conn.ensure_network(&self.name).await? {
            Some(net) => {
                let conn = self.conn.ensure_connected().await?;
                let bridge = conn.network_bridge_name(&net).await?;
                if self.record.network_name.as_deref() != Some(bridge.as_str()) {
                    info!(network = %self.name, bridge = %bridge, "Bridge name changed");
                    self.record.network_name = Some(bridge);
                    self.persist()?;
                }
            }
            None => {
                warn!(network = %self.name, "{} is missing", self.full_name());
                self.record.network_name = None;
                self.record.state = NetworkState::Missing;
                self.persist()?;
            }
        }
        Ok(self.record.state)
    }
}

/// Warn when two machines are bound to the same address.
fn warn_duplicate_addresses(network: &str, static_ips: &StaticIps) {
    let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
    for (machine, address) in static_ips {
        if let Some(other) = seen.insert(address.as_str(), machine.as_str()) {
            warn!(
                network = %network,
                "Static IP '{}' is assigned to both '{}' and '{}'",
                address, other, machine
            );
        }
    }
}
