//! IP address discovery from DHCP leases.

use std::time::Duration;
use tracing::{debug, info};

use crate::error::Result;
use crate::traits::{DomainHandle, Hypervisor};

/// Interval between lease polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Resolves a machine's private address.
///
/// A statically configured address always wins; otherwise the first
/// address found in the DHCP leases of any interface is used.
#[derive(Debug, Clone, Copy)]
pub struct IpDiscovery {
    interval: Duration,
}

impl Default for IpDiscovery {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl IpDiscovery {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One lookup, no waiting.
    pub async fn resolve(
        &self,
        conn: &dyn Hypervisor,
        dom: &DomainHandle,
        static_ip: Option<&str>,
    ) -> Result<Option<String>> {
        if let Some(ip) = static_ip {
            return Ok(Some(ip.to_string()));
        }
        lease_address(conn, dom).await
    }

    /// Poll until an address appears.
    ///
    /// There is no upper bound on the number of polls.
    pub async fn wait_for_ip(
        &self,
        conn: &dyn Hypervisor,
        dom: &DomainHandle,
        static_ip: Option<&str>,
    ) -> Result<String> {
        info!(domain = %dom.name, "Waiting for IP address to appear in DHCP leases");
        let mut polls: u64 = 0;
        loop {
            if let Some(ip) = self.resolve(conn, dom, static_ip).await? {
                info!(domain = %dom.name, ip = %ip, polls, "Got IP address");
                return Ok(ip);
            }
            polls += 1;
            debug!(domain = %dom.name, polls, "No lease yet");
            tokio::time::sleep(self.interval).await;
        }
    }
}

/// First non-empty address in the domain's DHCP leases.
pub async fn lease_address(conn: &dyn Hypervisor, dom: &DomainHandle) -> Result<Option<String>> {
    let ifaces = conn.domain_lease_addresses(dom).await?;
    Ok(ifaces
        .into_iter()
        .flat_map(|iface| iface.addrs)
        .find(|addr| !addr.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;

    fn fast() -> IpDiscovery {
        IpDiscovery::new(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_static_ip_short_circuits() {
        let backend = MockBackend::new();
        let dom = DomainHandle::new("nixops-1-web");

        let ip = fast().wait_for_ip(&backend, &dom, Some("10.0.0.9")).await.unwrap();
        assert_eq!(ip, "10.0.0.9");
        assert_eq!(backend.calls_named("domain_lease_addresses"), 0);
    }

    #[tokio::test]
    async fn test_polls_until_lease() {
        let backend = MockBackend::new();
        backend.set_lease("nixops-1-web", "192.168.122.17", 3);
        let dom = DomainHandle::new("nixops-1-web");

        let ip = fast().wait_for_ip(&backend, &dom, None).await.unwrap();
        assert_eq!(ip, "192.168.122.17");
        assert_eq!(backend.calls_named("domain_lease_addresses"), 4);
    }

    #[tokio::test]
    async fn test_resolve_without_lease() {
        let backend = MockBackend::new();
        let dom = DomainHandle::new("nixops-1-web");
        assert_eq!(fast().resolve(&backend, &dom, None).await.unwrap(), None);
    }

    #[test]
    fn test_default_interval() {
        assert_eq!(IpDiscovery::default().interval(), Duration::from_secs(1));
    }
}
