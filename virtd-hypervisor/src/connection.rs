//! Per-resource hypervisor connection and handle cache.
//!
//! Each machine or network owns one `ConnectionManager`. The connection
//! and the handles resolved through it are filled explicitly by the
//! `ensure_*` calls and reused afterwards; nothing is resolved as a side
//! effect of reading a field.

use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Result, VirtdError};
use crate::traits::{
    DomainHandle, Hypervisor, HypervisorConnector, NetworkHandle, PoolHandle, VolumeHandle,
};

/// Hint shown when no driver is registered for the URI scheme.
pub const NO_DRIVER_HINT: &str = "make sure qemu-system-x86_64 is installed on the target host";

/// Lazily opened connection plus cached object handles.
pub struct ConnectionManager {
    uri: String,
    connector: Arc<dyn HypervisorConnector>,
    conn: Option<Arc<dyn Hypervisor>>,
    domain: Option<DomainHandle>,
    pool: Option<PoolHandle>,
    volume: Option<VolumeHandle>,
    network: Option<NetworkHandle>,
}

impl ConnectionManager {
    pub fn new(uri: impl Into<String>, connector: Arc<dyn HypervisorConnector>) -> Self {
        Self {
            uri: uri.into(),
            connector,
            conn: None,
            domain: None,
            pool: None,
            volume: None,
            network: None,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Point at another hypervisor. Drops the connection and every cached
    /// handle if the URI changes.
    pub fn set_uri(&mut self, uri: &str) {
        if self.uri != uri {
            self.uri = uri.to_string();
            self.conn = None;
            self.domain = None;
            self.pool = None;
            self.volume = None;
            self.network = None;
        }
    }

    /// Open the connection on first use.
    pub async fn ensure_connected(&mut self) -> Result<Arc<dyn Hypervisor>> {
        if let Some(conn) = &self.conn {
            return Ok(Arc::clone(conn));
        }

        info!(uri = %self.uri, "Connecting to hypervisor");
        let conn = self
            .connector
            .connect(&self.uri)
            .await
            .map_err(|e| classify_connect_error(&self.uri, e))?;

        self.conn = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// Resolve the domain called `name`. A miss is logged and yields `None`.
    pub async fn ensure_domain(&mut self, name: &str) -> Result<Option<DomainHandle>> {
        if let Some(dom) = self.domain.as_ref().filter(|d| d.name == name) {
            return Ok(Some(dom.clone()));
        }
        let conn = self.ensure_connected().await?;
        self.domain = lookup_or_warn("domain", name, conn.lookup_domain(name).await)?;
        Ok(self.domain.clone())
    }

    /// Resolve the storage pool called `name`.
    pub async fn ensure_pool(&mut self, name: &str) -> Result<Option<PoolHandle>> {
        if let Some(pool) = self.pool.as_ref().filter(|p| p.name == name) {
            return Ok(Some(pool.clone()));
        }
        let conn = self.ensure_connected().await?;
        self.pool = lookup_or_warn("storage pool", name, conn.lookup_pool(name).await)?;
        Ok(self.pool.clone())
    }

    /// Resolve volume `name` inside pool `pool`.
    pub async fn ensure_volume(&mut self, pool: &str, name: &str) -> Result<Option<VolumeHandle>> {
        if let Some(vol) = self
            .volume
            .as_ref()
            .filter(|v| v.pool == pool && v.name == name)
        {
            return Ok(Some(vol.clone()));
        }
        let Some(pool) = self.ensure_pool(pool).await? else {
            return Ok(None);
        };
        let conn = self.ensure_connected().await?;
        self.volume = lookup_or_warn("storage volume", name, conn.lookup_volume(&pool, name).await)?;
        Ok(self.volume.clone())
    }

    /// Resolve the virtual network called `name`.
    pub async fn ensure_network(&mut self, name: &str) -> Result<Option<NetworkHandle>> {
        if let Some(net) = self.network.as_ref().filter(|n| n.name == name) {
            return Ok(Some(net.clone()));
        }
        let conn = self.ensure_connected().await?;
        self.network = lookup_or_warn("network", name, conn.lookup_network(name).await)?;
        Ok(self.network.clone())
    }

    pub fn set_domain(&mut self, dom: DomainHandle) {
        self.domain = Some(dom);
    }

    pub fn set_volume(&mut self, vol: VolumeHandle) {
        self.volume = Some(vol);
    }

    pub fn set_network(&mut self, net: NetworkHandle) {
        self.network = Some(net);
    }

    pub fn forget_domain(&mut self) {
        self.domain = None;
    }

    pub fn forget_volume(&mut self) {
        self.volume = None;
    }

    pub fn forget_network(&mut self) {
        self.network = None;
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("uri", &self.uri)
            .field("connected", &self.conn.is_some())
            .field("domain", &self.domain)
            .field("pool", &self.pool)
            .field("volume", &self.volume)
            .field("network", &self.network)
            .finish()
    }
}

/// Turn a lookup failure into a logged miss.
fn lookup_or_warn<T>(what: &str, name: &str, result: Result<Option<T>>) -> Result<Option<T>> {
    match result {
        Ok(Some(handle)) => Ok(Some(handle)),
        Ok(None) => {
            warn!("{} '{}' not found", what, name);
            Ok(None)
        }
        Err(e) if !e.is_fatal() || matches!(e, VirtdError::OperationFailed(_)) => {
            warn!(error = %e, "{} '{}' lookup failed", what, name);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Attach the remediation hint to a "no driver" connection failure.
fn classify_connect_error(uri: &str, err: VirtdError) -> VirtdError {
    let (reason, hint) = match err {
        VirtdError::ConnectionFailed { reason, hint, .. } => (reason, hint),
        other => (other.to_string(), None),
    };
    let hint = hint.or_else(|| {
        reason
            .to_lowercase()
            .contains("no connection driver")
            .then(|| NO_DRIVER_HINT.to_string())
    });

    tracing::error!(uri = %uri, reason = %reason, "Failed to connect to the hypervisor");
    if let Some(hint) = &hint {
        tracing::error!("{}", hint);
    }

    VirtdError::ConnectionFailed {
        uri: uri.to_string(),
        reason,
        hint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockConnector};

    fn manager(backend: Arc<MockBackend>) -> ConnectionManager {
        ConnectionManager::new("qemu:///system", Arc::new(MockConnector::new(backend)))
    }

    #[tokio::test]
    async fn test_connection_is_memoized() {
        let backend = Arc::new(MockBackend::new());
        let connector = Arc::new(MockConnector::new(Arc::clone(&backend)));
        let mut mgr = ConnectionManager::new("qemu:///system", connector.clone());

        mgr.ensure_connected().await.unwrap();
        mgr.ensure_connected().await.unwrap();
        assert_eq!(connector.connect_count(), 1);

        mgr.set_uri("qemu+ssh://host/system");
        mgr.ensure_connected().await.unwrap();
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_no_driver_hint() {
        let backend = Arc::new(MockBackend::new());
        let connector = MockConnector::new(backend).without_driver();
        let mut mgr = ConnectionManager::new("qemu:///system", Arc::new(connector));

        let err = mgr.ensure_connected().await.err().unwrap();
        assert_eq!(err.hint(), Some(NO_DRIVER_HINT));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_lookup_miss_is_none() {
        let backend = Arc::new(MockBackend::new());
        let mut mgr = manager(Arc::clone(&backend));

        assert!(mgr.ensure_domain("nixops-x-web").await.unwrap().is_none());
        assert!(mgr.ensure_pool("default").await.unwrap().is_some());
        assert!(mgr.ensure_volume("default", "missing.qcow2").await.unwrap().is_none());
        assert!(mgr.ensure_volume("nope", "missing.qcow2").await.unwrap().is_none());
        assert!(mgr.ensure_network("lab").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handles_are_cached() {
        let backend = Arc::new(MockBackend::new());
        backend.add_network("lab", "virbr5", false);
        let mut mgr = manager(Arc::clone(&backend));

        let first = mgr.ensure_network("lab").await.unwrap();
        backend.remove_network("lab");
        let second = mgr.ensure_network("lab").await.unwrap();
        assert_eq!(first, second);

        mgr.forget_network();
        assert!(mgr.ensure_network("lab").await.unwrap().is_none());
    }
}
