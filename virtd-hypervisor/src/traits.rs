//! Core hypervisor abstraction trait.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;

// =============================================================================
// HANDLES
// =============================================================================

/// A resolved domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainHandle {
    pub name: String,
}

/// A resolved storage pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolHandle {
    pub name: String,
}

/// A resolved storage volume within a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHandle {
    pub pool: String,
    pub name: String,
}

/// A resolved virtual network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHandle {
    pub name: String,
}

impl DomainHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl PoolHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl VolumeHandle {
    pub fn new(pool: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            name: name.into(),
        }
    }
}

impl NetworkHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

// =============================================================================
// LIVE NETWORK UPDATES
// =============================================================================

/// Command of a live network update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkUpdateCommand {
    Modify,
    Delete,
    AddLast,
    AddFirst,
}

/// Section of the network definition a live update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkSection {
    Forward,
    IpDhcpHost,
}

/// Addresses the hypervisor reports for one domain interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceAddresses {
    /// Interface name on the host side (e.g. "vnet0")
    pub name: String,
    pub hwaddr: Option<String>,
    pub addrs: Vec<String>,
}

// =============================================================================
// HYPERVISOR
// =============================================================================

/// An open connection to one hypervisor.
///
/// Covers exactly the calls the reconcilers make. Lookups return
/// `Ok(None)` when the object does not exist; `Err` is reserved for
/// failures of the call itself.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// URI this connection was opened for.
    fn uri(&self) -> &str;

    // =========================================================================
    // Host
    // =========================================================================

    /// Library version as `major * 1_000_000 + minor * 1000 + release`.
    async fn lib_version(&self) -> Result<u64>;

    /// Domain capabilities document for `arch` and `virt_type`.
    async fn domain_capabilities(&self, arch: &str, virt_type: &str) -> Result<String>;

    // =========================================================================
    // Domains
    // =========================================================================

    /// Register a persistent domain. `None` means the hypervisor accepted
    /// the call but returned no domain.
    async fn define_domain(&self, xml: &str) -> Result<Option<DomainHandle>>;

    async fn lookup_domain(&self, name: &str) -> Result<Option<DomainHandle>>;

    async fn domain_is_active(&self, dom: &DomainHandle) -> Result<bool>;

    /// Boot a defined domain.
    async fn start_domain(&self, dom: &DomainHandle) -> Result<()>;

    /// Hard power-off.
    async fn destroy_domain(&self, dom: &DomainHandle) -> Result<()>;

    async fn undefine_domain(&self, dom: &DomainHandle) -> Result<()>;

    /// Interface addresses taken from the DHCP lease database.
    async fn domain_lease_addresses(&self, dom: &DomainHandle) -> Result<Vec<InterfaceAddresses>>;

    /// Add a device to the persistent configuration.
    async fn attach_device_config(&self, dom: &DomainHandle, xml: &str) -> Result<()>;

    /// Remove a device from the persistent configuration.
    async fn detach_device_config(&self, dom: &DomainHandle, xml: &str) -> Result<()>;

    // =========================================================================
    // Storage
    // =========================================================================

    async fn lookup_pool(&self, name: &str) -> Result<Option<PoolHandle>>;

    async fn create_volume(&self, pool: &PoolHandle, xml: &str) -> Result<VolumeHandle>;

    async fn lookup_volume(&self, pool: &PoolHandle, name: &str) -> Result<Option<VolumeHandle>>;

    async fn volume_path(&self, vol: &VolumeHandle) -> Result<String>;

    /// Stream `length` bytes of `source` into `vol` starting at `offset`.
    ///
    /// Returns the number of bytes sent.
    async fn upload_volume(
        &self,
        vol: &VolumeHandle,
        source: &Path,
        offset: u64,
        length: u64,
    ) -> Result<u64>;

    async fn delete_volume(&self, vol: &VolumeHandle) -> Result<()>;

    // =========================================================================
    // Networks
    // =========================================================================

    async fn lookup_network(&self, name: &str) -> Result<Option<NetworkHandle>>;

    async fn define_network(&self, xml: &str) -> Result<NetworkHandle>;

    async fn start_network(&self, net: &NetworkHandle) -> Result<()>;

    async fn destroy_network(&self, net: &NetworkHandle) -> Result<()>;

    async fn undefine_network(&self, net: &NetworkHandle) -> Result<()>;

    async fn set_network_autostart(&self, net: &NetworkHandle, autostart: bool) -> Result<()>;

    async fn network_bridge_name(&self, net: &NetworkHandle) -> Result<String>;

    /// Apply a live change to a running network and its persistent config.
    async fn update_network(
        &self,
        net: &NetworkHandle,
        command: NetworkUpdateCommand,
        section: NetworkSection,
        index: i32,
        xml: &str,
    ) -> Result<()>;
}

/// Opens hypervisor connections by URI.
#[async_trait]
pub trait HypervisorConnector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Hypervisor>>;
}
