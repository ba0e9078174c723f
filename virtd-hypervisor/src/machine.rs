//! Machine reconciliation.
//!
//! `MachineReconciler` drives one machine from its persisted record toward
//! a desired [`MachineSpec`]. Every completed step is written back to the
//! state store before the next one starts, so an interrupted run resumes
//! where it stopped.

use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::connection::ConnectionManager;
use crate::discovery::IpDiscovery;
use crate::error::{best_effort, Result, VirtdError};
use crate::external::{BuildRequest, Toolbox};
use crate::state::{MachineRecord, MachineState, StateStore};
use crate::storage::StorageProvisioner;
use crate::traits::{DomainHandle, HypervisorConnector};
use crate::types::{DeploymentInfo, MachineSpec, NetworkRef};
use crate::xml::{emulator_from_capabilities, interface_element, DomainXmlBuilder};

/// Oldest library with domain capability introspection (1.2.7).
pub const MIN_LIB_VERSION: u64 = 1_002_007;

/// Generate a MAC address in the QEMU range.
///
/// The fourth octet stays below 0x80.
pub fn generate_primary_mac() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        rng.gen_range(0x00..=0x7fu8),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}

fn format_version(v: u64) -> String {
    format!("{}.{}.{}", v / 1_000_000, (v / 1000) % 1000, v % 1000)
}

/// Reconciles one libvirt machine.
pub struct MachineReconciler {
    name: String,
    deployment: DeploymentInfo,
    record: MachineRecord,
    conn: ConnectionManager,
    store: Arc<dyn StateStore>,
    toolbox: Toolbox,
    discovery: IpDiscovery,
}

impl MachineReconciler {
    /// Load the persisted record of `name` and prepare a reconciler.
    pub fn load(
        name: impl Into<String>,
        deployment: DeploymentInfo,
        store: Arc<dyn StateStore>,
        connector: Arc<dyn HypervisorConnector>,
        toolbox: Toolbox,
    ) -> Result<Self> {
        let name = name.into();
        let record = MachineRecord::from_attributes(&store.load(&name)?)?;
        let conn = ConnectionManager::new(record.uri.clone(), connector);
        Ok(Self {
            name,
            deployment,
            record,
            conn,
            store,
            toolbox,
            discovery: IpDiscovery::default(),
        })
    }

    pub fn with_discovery(mut self, discovery: IpDiscovery) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record(&self) -> &MachineRecord {
        &self.record
    }

    /// Identifier of the backing domain.
    pub fn machine_id(&self) -> String {
        self.deployment.machine_id(&self.name)
    }

    fn persist(&self) -> Result<()> {
        self.store.store(&self.name, &self.record.to_attributes()?)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Bring the machine to `defn` and make sure it runs.
    #[instrument(skip(self, defn), fields(machine = %self.name))]
    pub async fn create(
        &mut self,
        defn: &MachineSpec,
        check: bool,
        allow_reboot: bool,
        allow_recreate: bool,
    ) -> Result<()> {
        defn.validate()?;

        self.record.storage_pool = Some(defn.storage_pool.clone());
        self.record.uri = defn.uri.clone();
        self.conn.set_uri(&defn.uri);
        self.persist()?;

        if check {
            self.recheck_domain(allow_recreate).await?;
        }

        let conn = self.conn.ensure_connected().await?;
        let version = conn.lib_version().await?;
        if version < MIN_LIB_VERSION {
            let e = VirtdError::UnsupportedVersion {
                found: format_version(version),
                required: format_version(MIN_LIB_VERSION),
            };
            error!(error = %e, "Hypervisor too old");
            return Err(e);
        }

        if self.record.primary_mac.is_none() {
            self.record.primary_mac = Some(generate_primary_mac());
            self.persist()?;
        }

        if self.record.client_public_key.is_none() {
            let pair = self.toolbox.keys.generate().await?;
            self.record.client_private_key = Some(pair.private_key);
            self.record.client_public_key = Some(pair.public_key);
            self.persist()?;
        }

        if self.record.storage_volume.is_none() {
            self.provision_volume(defn).await?;
        }

        if self.record.primary_ip != defn.private_ipv4 {
            self.record.primary_ip = defn.private_ipv4.clone();
            self.persist()?;
        }

        if self.record.vm_id.is_none() {
            self.define(defn).await?;
        }

        if self.record.networks != defn.networks {
            if allow_reboot {
                self.update_networks(defn).await?;
            } else {
                let e = VirtdError::Policy("change of the networks requires reboot".to_string());
                warn!(machine = %self.name, "{}; skipping", e);
            }
        }

        self.start().await
    }

    async fn provision_volume(&mut self, defn: &MachineSpec) -> Result<()> {
        let conn = self.conn.ensure_connected().await?;
        let pool = self.conn.ensure_pool(&defn.storage_pool).await?.ok_or_else(|| {
            VirtdError::Provisioning(format!("storage pool '{}' not found", defn.storage_pool))
        })?;

        let request = BuildRequest {
            deployment_id: self.deployment.id.clone(),
            deployment_name: self.deployment.name.clone(),
            machine_name: self.name.clone(),
            attribute: BuildRequest::base_image_attribute(&self.name),
            public_key: self.record.client_public_key.clone().unwrap_or_default(),
        };

        let vol = StorageProvisioner::new(&self.toolbox)
            .provision(conn.as_ref(), &pool, &self.machine_id(), &request)
            .await?;

        self.record.storage_volume = Some(vol.name.clone());
        self.conn.set_volume(vol);
        self.persist()
    }

    async fn define(&mut self, defn: &MachineSpec) -> Result<()> {
        let primary = defn
            .primary_network()
            .map(|n| n.network_name().to_string())
            .ok_or_else(|| VirtdError::InvalidConfig("no primary network".to_string()))?;

        let xml = self.domain_xml(defn, &primary).await?;

        let conn = self.conn.ensure_connected().await?;
        let dom = match conn.define_domain(&xml).await {
            Ok(Some(dom)) => dom,
            Ok(None) => {
                error!(machine = %self.name, "Failed to register domain XML with the hypervisor");
                return Err(VirtdError::DefineFailed(format!(
                    "hypervisor returned no domain for '{}'",
                    self.machine_id()
                )));
            }
            Err(e) => {
                error!(machine = %self.name, error = %e, "Failed to register domain XML with the hypervisor");
                return Err(VirtdError::DefineFailed(e.to_string()));
            }
        };
        info!(machine = %self.name, domain = %dom.name, "Domain defined");

        self.record.networks = defn.networks.clone();
        self.record.primary_net = Some(primary);
        self.record.domain_xml = Some(xml);
        self.record.vcpu = Some(defn.vcpu);
        self.record.vm_id = Some(self.machine_id());
        self.record.state = MachineState::Defined;
        self.conn.set_domain(dom);
        self.persist()
    }

    async fn domain_xml(&mut self, defn: &MachineSpec, primary: &str) -> Result<String> {
        let conn = self.conn.ensure_connected().await?;
        let caps = conn.domain_capabilities("x86_64", "kvm").await?;
        let emulator = emulator_from_capabilities(&caps)?;

        let volume_name = self
            .record
            .storage_volume
            .clone()
            .ok_or_else(|| VirtdError::State("no storage volume recorded".to_string()))?;
        let vol = self
            .conn
            .ensure_volume(&defn.storage_pool, &volume_name)
            .await?
            .ok_or_else(|| {
                VirtdError::DefineFailed(format!("storage volume '{}' not found", volume_name))
            })?;
        let volume_path = conn.volume_path(&vol).await?;

        let mac = self.record.primary_mac.clone().unwrap_or_default();
        let machine_id = self.machine_id();
        DomainXmlBuilder::new(defn, &machine_id, &emulator, &volume_path)
            .with_primary(primary, &mac)
            .build()
    }

    /// Swap the persistent interface configuration. The domain is stopped
    /// first; the new interfaces take effect on the next start.
    async fn update_networks(&mut self, defn: &MachineSpec) -> Result<()> {
        info!(machine = %self.name, "Updating networks");
        self.stop().await?;

        let dom = self.require_domain().await?;
        let conn = self.conn.ensure_connected().await?;
        let mac = self.record.primary_mac.clone().unwrap_or_default();

        let old_primary = self.record.primary_net.clone().unwrap_or_default();
        for xml in interfaces_xml(&self.record.networks, &old_primary, &mac)? {
            best_effort(conn.detach_device_config(&dom, &xml).await).log_ignored("detaching interface");
        }

        let primary = defn
            .primary_network()
            .map(|n| n.network_name().to_string())
            .unwrap_or_default();
        let domain_xml = self.domain_xml(defn, &primary).await?;

        // The record keeps the old networks until every interface is in
        // place, so a failed run is retried by the next one.
        let mut attached: Vec<String> = Vec::new();
        for xml in interfaces_xml(&defn.networks, &primary, &mac)? {
            if let Err(e) = conn.attach_device_config(&dom, &xml).await {
                error!(machine = %self.name, error = %e, "Failed attaching interface");
                for xml in &attached {
                    best_effort(conn.detach_device_config(&dom, xml).await)
                        .log_ignored("rolling back interface");
                }
                return Err(e);
            }
            attached.push(xml);
        }

        self.record.networks = defn.networks.clone();
        self.record.primary_net = Some(primary);
        self.record.domain_xml = Some(domain_xml);
        self.persist()
    }

    /// Boot the domain, or pick up its address if it already runs.
    #[instrument(skip(self), fields(machine = %self.name))]
    pub async fn start(&mut self) -> Result<()> {
        if self.record.vm_id.is_none()
            || self.record.domain_xml.is_none()
            || self.record.primary_net.is_none()
        {
            return Err(VirtdError::State(format!(
                "machine '{}' has not been defined",
                self.name
            )));
        }

        let dom = self.require_domain().await?;
        let conn = self.conn.ensure_connected().await?;
        let static_ip = self.record.primary_ip.clone();

        if self.is_running(&dom).await {
            info!(machine = %self.name, "Connecting");
            self.record.private_ipv4 = self
                .discovery
                .resolve(conn.as_ref(), &dom, static_ip.as_deref())
                .await?;
        } else {
            info!(machine = %self.name, "Starting");
            conn.start_domain(&dom).await?;
            self.record.state = MachineState::Running;
            self.persist()?;
            let ip = self
                .discovery
                .wait_for_ip(conn.as_ref(), &dom, static_ip.as_deref())
                .await?;
            self.record.private_ipv4 = Some(ip);
        }

        self.record.state = MachineState::Running;
        self.persist()
    }

    /// Power the domain off. Failures are logged, not returned.
    #[instrument(skip(self), fields(machine = %self.name))]
    pub async fn stop(&mut self) -> Result<()> {
        let Some(vm_id) = self.record.vm_id.clone() else {
            return Err(VirtdError::State(format!(
                "machine '{}' has not been defined",
                self.name
            )));
        };

        let dom = self.conn.ensure_domain(&vm_id).await?;
        let running = match &dom {
            Some(dom) => self.is_running(dom).await,
            None => false,
        };

        match dom {
            Some(dom) if running => {
                info!(machine = %self.name, "Shutting down");
                let conn = self.conn.ensure_connected().await?;
                if let Err(e) = conn.destroy_domain(&dom).await {
                    error!(machine = %self.name, error = %e, "Failed destroying machine");
                }
            }
            _ => info!(machine = %self.name, "Not running"),
        }

        self.record.state = MachineState::Stopped;
        self.persist()
    }

    /// Remove the domain and its volume.
    ///
    /// Returns `false` when the domain could not be undefined. Objects that
    /// are already gone are skipped. With `wipe` the SSH key pair and MAC
    /// are forgotten too; otherwise a later deploy reuses them.
    #[instrument(skip(self), fields(machine = %self.name))]
    pub async fn destroy(&mut self, wipe: bool) -> Result<bool> {
        info!(machine = %self.name, "Destroying");

        if let Some(vm_id) = self.record.vm_id.clone() {
            self.stop().await?;
            if let Some(dom) = self.conn.ensure_domain(&vm_id).await? {
                let conn = self.conn.ensure_connected().await?;
                if let Err(e) = conn.undefine_domain(&dom).await {
                    error!(machine = %self.name, error = %e, "Failed undefining domain");
                    return Ok(false);
                }
            }
            self.conn.forget_domain();
        }

        if let Some(disk) = self.record.disk_path.clone() {
            let path = Path::new(&disk);
            if path.exists() {
                info!(path = %disk, "Removing legacy disk image");
                tokio::fs::remove_file(path).await?;
            }
        }

        if let Some(volume) = self.record.storage_volume.clone() {
            let pool = self.record.storage_pool.clone().unwrap_or_default();
            if let Some(vol) = self.conn.ensure_volume(&pool, &volume).await? {
                let conn = self.conn.ensure_connected().await?;
                conn.delete_volume(&vol).await?;
            }
            self.conn.forget_volume();
        }

        let uri = self.record.uri.clone();
        self.record = if wipe {
            MachineRecord {
                uri,
                ..Default::default()
            }
        } else {
            MachineRecord {
                client_public_key: self.record.client_public_key.take(),
                client_private_key: self.record.client_private_key.take(),
                primary_mac: self.record.primary_mac.take(),
                storage_pool: self.record.storage_pool.take(),
                uri,
                ..Default::default()
            }
        };
        self.record.state = MachineState::Destroyed;
        self.persist()?;
        Ok(true)
    }

    /// Observe the domain and record what was found.
    #[instrument(skip(self), fields(machine = %self.name))]
    pub async fn check(&mut self) -> Result<MachineState> {
        let Some(vm_id) = self.record.vm_id.clone() else {
            return Ok(self.record.state);
        };

        self.conn.forget_domain();
        let observed = match self.conn.ensure_domain(&vm_id).await? {
            None => MachineState::Absent,
            Some(dom) => {
                if self.is_running(&dom).await {
                    MachineState::Running
                } else {
                    MachineState::Stopped
                }
            }
        };

        if observed != self.record.state {
            info!(machine = %self.name, from = %self.record.state, to = %observed, "State changed");
            self.record.state = observed;
            self.persist()?;
        }
        Ok(observed)
    }

    async fn recheck_domain(&mut self, allow_recreate: bool) -> Result<()> {
        if self.record.vm_id.is_none() || self.check().await? != MachineState::Absent {
            return Ok(());
        }

        if !allow_recreate {
            let e = VirtdError::Policy("domain is missing and recreating it is not allowed".to_string());
            warn!(machine = %self.name, "{}; skipping", e);
            return Ok(());
        }

        warn!(machine = %self.name, "Domain is missing; it will be defined again");
        self.record.vm_id = None;
        self.record.domain_xml = None;
        self.conn.forget_domain();
        self.persist()
    }

    async fn require_domain(&mut self) -> Result<DomainHandle> {
        let vm_id = self.record.vm_id.clone().unwrap_or_else(|| self.machine_id());
        self.conn
            .ensure_domain(&vm_id)
            .await?
            .ok_or_else(|| VirtdError::NotFound(format!("domain '{}'", vm_id)))
    }

    async fn is_running(&mut self, dom: &DomainHandle) -> bool {
        let active = match self.conn.ensure_connected().await {
            Ok(conn) => conn.domain_is_active(dom).await,
            Err(e) => Err(e),
        };
        match active {
            Ok(active) => active,
            Err(e) => {
                info!(domain = %dom.name, error = %e, "Domain is not running");
                false
            }
        }
    }

    // =========================================================================
    // Access helpers
    // =========================================================================

    /// Address to reach the machine over SSH, refreshed from the leases.
    pub async fn ssh_name(&mut self) -> Result<Option<String>> {
        let static_ip = self.record.primary_ip.clone();
        let ip = match static_ip {
            Some(ip) => Some(ip),
            None => {
                let dom = self.require_domain().await?;
                let conn = self.conn.ensure_connected().await?;
                self.discovery.resolve(conn.as_ref(), &dom, None).await?
            }
        };
        if ip != self.record.private_ipv4 {
            self.record.private_ipv4 = ip.clone();
            self.persist()?;
        }
        Ok(ip)
    }

    /// Write the client private key to `dir` with owner-only permissions.
    pub fn write_ssh_private_key(&self, dir: &Path) -> Result<PathBuf> {
        let key = self.record.client_private_key.as_deref().ok_or_else(|| {
            VirtdError::State(format!("machine '{}' has no SSH key pair", self.name))
        })?;
        write_private_key(&dir.join(format!("id-{}", self.name)), key)
    }

    /// NixOS options that install the client key for root.
    pub fn physical_spec(&self) -> serde_json::Value {
        let keys: Vec<&str> = self.record.client_public_key.as_deref().into_iter().collect();
        serde_json::json!({
            "users": { "extraUsers": { "root": { "openssh": { "authorizedKeys": { "keys": keys } } } } }
        })
    }

    /// Command that attaches to the serial console.
    pub fn console_command(&self) -> Vec<String> {
        vec![
            "virsh".to_string(),
            "-c".to_string(),
            self.record.uri.clone(),
            "console".to_string(),
            self.record.vm_id.clone().unwrap_or_else(|| self.machine_id()),
        ]
    }
}

/// Extra SSH options for libvirt machines.
pub fn ssh_flags(key_file: &Path) -> Vec<String> {
    vec![
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-i".to_string(),
        key_file.display().to_string(),
    ]
}

/// How `from` reaches the machine recorded in `to`.
pub fn address_to(to: &MachineRecord) -> Option<&str> {
    to.private_ipv4.as_deref()
}

fn write_private_key(path: &Path, key: &str) -> Result<PathBuf> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(key.as_bytes())?;
    if !key.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    Ok(path.to_path_buf())
}

/// Interface XML for `networks`, pinning `mac` on the first interface
/// bound to `primary`.
fn interfaces_xml(networks: &[NetworkRef], primary: &str, mac: &str) -> Result<Vec<String>> {
    let mut mac_pending = true;
    networks
        .iter()
        .map(|net| {
            let pin = mac_pending && net.network_name() == primary;
            if pin {
                mac_pending = false;
            }
            interface_element(net, pin.then_some(mac)).render()
        })
        .collect()
}
