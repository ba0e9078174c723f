//! Development mode: an in-memory hypervisor with canned collaborators.

use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::info;
use virtd_hypervisor::mock::{MockImageBuilder, MockInspector, MockKeys};
use virtd_hypervisor::{DeploymentInfo, MockBackend, Result, Toolbox};

use crate::deployment::Deployment;

/// Virtual size reported for mock images (1 GiB).
const MOCK_IMAGE_SIZE: u64 = 1 << 30;

/// A mock hypervisor prepared for one deployment.
pub struct DevEnvironment {
    pub backend: Arc<MockBackend>,
    pub toolbox: Toolbox,
    /// Holds the fake image until the run is over
    _image_dir: tempfile::TempDir,
}

impl DevEnvironment {
    /// Create the backend, a fake image and a DHCP lease for every machine.
    ///
    /// Machines with a static binding get that address; the others are
    /// numbered from 192.168.122.10 in name order.
    pub fn new(deployment: &Deployment, identity: &DeploymentInfo) -> Result<Self> {
        let backend = Arc::new(MockBackend::new());
        for pool in deployment.machines.values().map(|m| m.storage_pool.as_str()) {
            backend.add_pool(pool);
        }

        let mut next = Ipv4Addr::new(192, 168, 122, 10);
        for (name, machine) in &deployment.machines {
            let address = machine
                .private_ipv4
                .clone()
                .or_else(|| static_binding(deployment, name))
                .unwrap_or_else(|| {
                    let address = next.to_string();
                    next = Ipv4Addr::from(u32::from(next) + 1);
                    address
                });
            info!(machine = %name, address = %address, "Mock lease");
            backend.set_lease(&identity.machine_id(name), &address, 0);
        }

        let image_dir = tempfile::tempdir()?;
        let builder = MockImageBuilder::new(image_dir.path());
        builder.set_image(b"QFI\xfb mock image")?;

        let toolbox = Toolbox::new(
            Arc::new(builder),
            Arc::new(MockInspector::new(MOCK_IMAGE_SIZE)),
            Arc::new(MockKeys),
        );

        Ok(Self {
            backend,
            toolbox,
            _image_dir: image_dir,
        })
    }
}

fn static_binding(deployment: &Deployment, machine: &str) -> Option<String> {
    deployment
        .networks
        .values()
        .find_map(|n| n.static_ips.get(machine).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pools_and_leases_prepared() {
        use virtd_hypervisor::traits::DomainHandle;
        use virtd_hypervisor::Hypervisor;

        let yaml = "machines:\n  a:\n    storagePool: fast\n  b:\n    privateIPv4: 10.1.1.1\n  c: {}\n";
        let deployment = Deployment::from_yaml(yaml).unwrap();
        let identity = DeploymentInfo::new("u", "d");
        let env = DevEnvironment::new(&deployment, &identity).unwrap();

        assert!(env.backend.lookup_pool("fast").await.unwrap().is_some());
        assert!(env.backend.lookup_pool("default").await.unwrap().is_some());

        let lease = |name: &str| {
            let dom = DomainHandle::new(identity.machine_id(name));
            let backend = env.backend.clone();
            async move { backend.domain_lease_addresses(&dom).await.unwrap()[0].addrs[0].clone() }
        };
        assert_eq!(lease("a").await, "192.168.122.10");
        assert_eq!(lease("b").await, "10.1.1.1");
        assert_eq!(lease("c").await, "192.168.122.11");
    }

    #[test]
    fn test_static_binding_lookup() {
        let yaml = "networks:\n  lab:\n    staticIPs:\n      - { machine: db, address: 192.168.56.7 }\nmachines:\n  db: {}\n";
        let deployment = Deployment::from_yaml(yaml).unwrap();
        assert_eq!(static_binding(&deployment, "db").as_deref(), Some("192.168.56.7"));
        assert_eq!(static_binding(&deployment, "web"), None);
    }
}
