//! Libvirt backend implementation.

use async_trait::async_trait;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::ErrorNumber;
use virt::network::Network;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;
use virt::stream::Stream;
use virt::sys;

use crate::connection::NO_DRIVER_HINT;
use crate::error::{Result, VirtdError};
use crate::traits::{
    DomainHandle, Hypervisor, HypervisorConnector, InterfaceAddresses, NetworkHandle,
    NetworkSection, NetworkUpdateCommand, PoolHandle, VolumeHandle,
};

/// Upload chunk size.
const UPLOAD_CHUNK: usize = 256 * 1024;

/// Libvirt/QEMU hypervisor backend.
pub struct LibvirtBackend {
    uri: String,
    connection: Connect,
}

impl LibvirtBackend {
    /// Open a connection to `uri`.
    ///
    /// Common URIs:
    /// - `qemu:///system` - System-wide QEMU/KVM
    /// - `qemu+ssh://user@host/system` - Remote via SSH
    pub fn open(uri: &str) -> Result<Self> {
        info!(uri = %uri, "Connecting to libvirt");

        let connection = Connect::open(Some(uri)).map_err(|e| {
            let hint = (e.code() == ErrorNumber::NoConnect).then(|| NO_DRIVER_HINT.to_string());
            VirtdError::ConnectionFailed {
                uri: uri.to_string(),
                reason: e.to_string(),
                hint,
            }
        })?;

        info!("Connected to libvirt");
        Ok(Self {
            uri: uri.to_string(),
            connection,
        })
    }

    fn domain(&self, dom: &DomainHandle) -> Result<Domain> {
        Domain::lookup_by_name(&self.connection, &dom.name)
            .map_err(|e| VirtdError::NotFound(format!("domain '{}': {}", dom.name, e)))
    }

    fn pool(&self, pool: &PoolHandle) -> Result<StoragePool> {
        StoragePool::lookup_by_name(&self.connection, &pool.name)
            .map_err(|e| VirtdError::NotFound(format!("storage pool '{}': {}", pool.name, e)))
    }

    fn volume(&self, vol: &VolumeHandle) -> Result<StorageVol> {
        let pool = self.pool(&PoolHandle::new(vol.pool.clone()))?;
        StorageVol::lookup_by_name(&pool, &vol.name)
            .map_err(|e| VirtdError::NotFound(format!("storage volume '{}': {}", vol.name, e)))
    }

    fn network(&self, net: &NetworkHandle) -> Result<Network> {
        Network::lookup_by_name(&self.connection, &net.name)
            .map_err(|e| VirtdError::NotFound(format!("network '{}': {}", net.name, e)))
    }
}

fn failed(e: virt::error::Error) -> VirtdError {
    VirtdError::OperationFailed(e.to_string())
}

/// Map a lookup error: "no such object" is a miss, anything else fails.
fn lookup<T>(result: std::result::Result<T, virt::error::Error>, missing: ErrorNumber) -> Result<Option<T>> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if e.code() == missing => Ok(None),
        Err(e) => Err(failed(e)),
    }
}

#[async_trait]
impl Hypervisor for LibvirtBackend {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn lib_version(&self) -> Result<u64> {
        Ok(u64::from(self.connection.get_lib_version().map_err(failed)?))
    }

    async fn domain_capabilities(&self, arch: &str, virt_type: &str) -> Result<String> {
        self.connection
            .get_domain_capabilities(None, Some(arch), None, Some(virt_type), 0)
            .map_err(failed)
    }

    #[instrument(skip(self, xml))]
    async fn define_domain(&self, xml: &str) -> Result<Option<DomainHandle>> {
        debug!(xml = %xml, "Defining domain");
        let domain = Domain::define_xml(&self.connection, xml)
            .map_err(|e| VirtdError::DefineFailed(e.to_string()))?;
        Ok(Some(DomainHandle::new(domain.get_name().map_err(failed)?)))
    }

    async fn lookup_domain(&self, name: &str) -> Result<Option<DomainHandle>> {
        let found = lookup(Domain::lookup_by_name(&self.connection, name), ErrorNumber::NoDomain)?;
        Ok(found.map(|_| DomainHandle::new(name)))
    }

    async fn domain_is_active(&self, dom: &DomainHandle) -> Result<bool> {
        self.domain(dom)?.is_active().map_err(failed)
    }

    #[instrument(skip(self), fields(domain = %dom.name))]
    async fn start_domain(&self, dom: &DomainHandle) -> Result<()> {
        self.domain(dom)?.create().map_err(failed)?;
        Ok(())
    }

    #[instrument(skip(self), fields(domain = %dom.name))]
    async fn destroy_domain(&self, dom: &DomainHandle) -> Result<()> {
        self.domain(dom)?.destroy().map_err(failed)
    }

    #[instrument(skip(self), fields(domain = %dom.name))]
    async fn undefine_domain(&self, dom: &DomainHandle) -> Result<()> {
        self.domain(dom)?.undefine().map_err(failed)
    }

    async fn domain_lease_addresses(&self, dom: &DomainHandle) -> Result<Vec<InterfaceAddresses>> {
        let ifaces = self
            .domain(dom)?
            .interface_addresses(sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE, 0)
            .map_err(failed)?;

        Ok(ifaces
            .into_iter()
            .map(|iface| InterfaceAddresses {
                name: iface.name,
                hwaddr: Some(iface.hwaddr).filter(|h| !h.is_empty()),
                addrs: iface.addrs.into_iter().map(|a| a.addr).collect(),
            })
            .collect())
    }

    async fn attach_device_config(&self, dom: &DomainHandle, xml: &str) -> Result<()> {
        self.domain(dom)?
            .attach_device_flags(xml, sys::VIR_DOMAIN_AFFECT_CONFIG)
            .map_err(failed)?;
        Ok(())
    }

    async fn detach_device_config(&self, dom: &DomainHandle, xml: &str) -> Result<()> {
        self.domain(dom)?
            .detach_device_flags(xml, sys::VIR_DOMAIN_AFFECT_CONFIG)
            .map_err(failed)?;
        Ok(())
    }

    async fn lookup_pool(&self, name: &str) -> Result<Option<PoolHandle>> {
        let found = lookup(
            StoragePool::lookup_by_name(&self.connection, name),
            ErrorNumber::NoStoragePool,
        )?;
        Ok(found.map(|_| PoolHandle::new(name)))
    }

    #[instrument(skip(self, xml), fields(pool = %pool.name))]
    async fn create_volume(&self, pool: &PoolHandle, xml: &str) -> Result<VolumeHandle> {
        let vol = StorageVol::create_xml(&self.pool(pool)?, xml, 0).map_err(failed)?;
        Ok(VolumeHandle::new(pool.name.clone(), vol.get_name().map_err(failed)?))
    }

    async fn lookup_volume(&self, pool: &PoolHandle, name: &str) -> Result<Option<VolumeHandle>> {
        let Some(p) = lookup(
            StoragePool::lookup_by_name(&self.connection, &pool.name),
            ErrorNumber::NoStoragePool,
        )?
        else {
            return Ok(None);
        };
        let found = lookup(StorageVol::lookup_by_name(&p, name), ErrorNumber::NoStorageVol)?;
        Ok(found.map(|_| VolumeHandle::new(pool.name.clone(), name)))
    }

    async fn volume_path(&self, vol: &VolumeHandle) -> Result<String> {
        self.volume(vol)?.get_path().map_err(failed)
    }

    #[instrument(skip(self), fields(volume = %vol.name, source = %source.display()))]
    async fn upload_volume(
        &self,
        vol: &VolumeHandle,
        source: &Path,
        offset: u64,
        length: u64,
    ) -> Result<u64> {
        let volume = self.volume(vol)?;
        let stream = Stream::new(&self.connection, 0).map_err(failed)?;
        volume.upload(&stream, offset, length, 0).map_err(failed)?;

        let mut file = std::fs::File::open(source)?.take(length);
        let mut buf = vec![0u8; UPLOAD_CHUNK];
        let mut sent: u64 = 0;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let mut chunk = &buf[..n];
            while !chunk.is_empty() {
                let written = stream.send(chunk).map_err(failed)?;
                chunk = &chunk[written..];
            }
            sent += n as u64;
        }
        stream.finish().map_err(failed)?;

        debug!(bytes = sent, "Upload finished");
        Ok(sent)
    }

    #[instrument(skip(self), fields(volume = %vol.name))]
    async fn delete_volume(&self, vol: &VolumeHandle) -> Result<()> {
        self.volume(vol)?.delete(0).map_err(failed)
    }

    async fn lookup_network(&self, name: &str) -> Result<Option<NetworkHandle>> {
        let found = lookup(Network::lookup_by_name(&self.connection, name), ErrorNumber::NoNetwork)?;
        Ok(found.map(|_| NetworkHandle::new(name)))
    }

    #[instrument(skip(self, xml))]
    async fn define_network(&self, xml: &str) -> Result<NetworkHandle> {
        debug!(xml = %xml, "Defining network");
        let net = Network::define_xml(&self.connection, xml)
            .map_err(|e| VirtdError::DefineFailed(e.to_string()))?;
        Ok(NetworkHandle::new(net.get_name().map_err(failed)?))
    }

    async fn start_network(&self, net: &NetworkHandle) -> Result<()> {
        self.network(net)?.create().map_err(failed)?;
        Ok(())
    }

    async fn destroy_network(&self, net: &NetworkHandle) -> Result<()> {
        self.network(net)?.destroy().map_err(failed)
    }

    async fn undefine_network(&self, net: &NetworkHandle) -> Result<()> {
        self.network(net)?.undefine().map_err(failed)
    }

    async fn set_network_autostart(&self, net: &NetworkHandle, autostart: bool) -> Result<()> {
        self.network(net)?.set_autostart(autostart).map_err(failed)?;
        Ok(())
    }

    async fn network_bridge_name(&self, net: &NetworkHandle) -> Result<String> {
        self.network(net)?.get_bridge_name().map_err(failed)
    }

    #[instrument(skip(self, xml), fields(network = %net.name))]
    async fn update_network(
        &self,
        net: &NetworkHandle,
        command: NetworkUpdateCommand,
        section: NetworkSection,
        index: i32,
        xml: &str,
    ) -> Result<()> {
        let command = match command {
            NetworkUpdateCommand::Modify => sys::VIR_NETWORK_UPDATE_COMMAND_MODIFY,
            NetworkUpdateCommand::Delete => sys::VIR_NETWORK_UPDATE_COMMAND_DELETE,
            NetworkUpdateCommand::AddLast => sys::VIR_NETWORK_UPDATE_COMMAND_ADD_LAST,
            NetworkUpdateCommand::AddFirst => sys::VIR_NETWORK_UPDATE_COMMAND_ADD_FIRST,
        };
        let section = match section {
            NetworkSection::Forward => sys::VIR_NETWORK_SECTION_FORWARD,
            NetworkSection::IpDhcpHost => sys::VIR_NETWORK_SECTION_IP_DHCP_HOST,
        };
        let flags = sys::VIR_NETWORK_UPDATE_AFFECT_LIVE | sys::VIR_NETWORK_UPDATE_AFFECT_CONFIG;

        self.network(net)?
            .update(command, section, index, xml, flags)
            .map_err(failed)
    }
}

/// Opens [`LibvirtBackend`] connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibvirtConnector;

#[async_trait]
impl HypervisorConnector for LibvirtConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Hypervisor>> {
        Ok(Arc::new(LibvirtBackend::open(uri)?))
    }
}
