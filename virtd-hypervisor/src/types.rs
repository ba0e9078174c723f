//! Type definitions for desired machine and network definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, VirtdError};

/// Connection URI used when neither definition nor state names one.
pub const DEFAULT_URI: &str = "qemu:///system";

// =============================================================================
// DEPLOYMENT IDENTITY
// =============================================================================

/// Identity of the deployment a resource belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentInfo {
    /// Deployment UUID
    pub id: String,
    /// Human-readable deployment name (may be empty)
    pub name: String,
}

impl DeploymentInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Identifier of the hypervisor domain backing `machine`.
    ///
    /// Deterministic in (deployment id, machine name); it is the only key
    /// used to look the live domain up again.
    pub fn machine_id(&self, machine: &str) -> String {
        format!("nixops-{}-{}", self.id, machine)
    }
}

// =============================================================================
// MACHINE DEFINITION
// =============================================================================

/// Desired state of one libvirt machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MachineSpec {
    /// Machine name within the deployment
    #[serde(skip)]
    pub name: String,
    /// Hypervisor connection URI
    #[serde(rename = "URI")]
    pub uri: String,
    /// Number of virtual CPUs
    pub vcpu: u32,
    /// Memory size in MiB
    pub memory_size: u64,
    /// Domain type attribute (e.g. "kvm", "qemu", "xen")
    pub domain_type: String,
    /// Direct kernel boot; empty means boot from disk
    pub kernel: String,
    pub initrd: String,
    pub cmdline: String,
    /// Omit the graphics device
    pub headless: bool,
    /// Storage pool holding the machine's disk volume
    pub storage_pool: String,
    /// Network interfaces; the first one is the primary interface
    pub networks: Vec<NetworkRef>,
    /// Appended verbatim inside `<devices>`
    #[serde(rename = "extraDevicesXML")]
    pub extra_devices_xml: String,
    /// Appended verbatim inside `<domain>`
    #[serde(rename = "extraDomainXML")]
    pub extra_domain_xml: String,
    /// Static private address; skips DHCP lease discovery when set
    #[serde(rename = "privateIPv4")]
    pub private_ipv4: Option<String>,
}

impl Default for MachineSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            uri: DEFAULT_URI.to_string(),
            vcpu: 1,
            memory_size: 512,
            domain_type: "kvm".to_string(),
            kernel: String::new(),
            initrd: String::new(),
            cmdline: String::new(),
            headless: false,
            storage_pool: "default".to_string(),
            networks: vec![NetworkRef::Named("default".to_string())],
            extra_devices_xml: String::new(),
            extra_domain_xml: String::new(),
            private_ipv4: None,
        }
    }
}

impl MachineSpec {
    /// Create a machine definition with default values.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_vcpu(mut self, vcpu: u32) -> Self {
        self.vcpu = vcpu;
        self
    }

    /// Set the memory size in MiB.
    pub fn with_memory(mut self, size_mib: u64) -> Self {
        self.memory_size = size_mib;
        self
    }

    pub fn with_networks(mut self, networks: Vec<NetworkRef>) -> Self {
        self.networks = networks;
        self
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_private_ipv4(mut self, address: impl Into<String>) -> Self {
        self.private_ipv4 = Some(address.into());
        self
    }

    /// The primary (first) network reference.
    pub fn primary_network(&self) -> Option<&NetworkRef> {
        self.networks.first()
    }

    /// Check the invariants a definition must hold before reconciliation.
    pub fn validate(&self) -> Result<()> {
        if self.networks.is_empty() {
            return Err(VirtdError::InvalidConfig(format!(
                "machine '{}' must be attached to at least one network",
                self.name
            )));
        }
        if self.vcpu == 0 {
            return Err(VirtdError::InvalidConfig(format!(
                "machine '{}' needs at least one vCPU",
                self.name
            )));
        }
        if self.memory_size == 0 {
            return Err(VirtdError::InvalidConfig(format!(
                "machine '{}' needs a non-zero memory size",
                self.name
            )));
        }
        if let Some(ip) = &self.private_ipv4 {
            ip.parse::<std::net::Ipv4Addr>().map_err(|_| {
                VirtdError::InvalidConfig(format!(
                    "machine '{}' has an invalid privateIPv4 '{}'",
                    self.name, ip
                ))
            })?;
        }
        Ok(())
    }
}

// =============================================================================
// NETWORK REFERENCES
// =============================================================================

/// One network interface of a machine.
///
/// Decided once at deserialization: a bare string names an existing
/// virtual network, a record carries a `type` discriminant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "NetworkRefRepr", into = "NetworkRefRepr")]
pub enum NetworkRef {
    /// Existing libvirt virtual network, by name
    Named(String),
    /// NAT virtual network managed as a deployment resource
    Nat { name: String },
    /// Isolated virtual network managed as a deployment resource
    Isolated { name: String },
    /// macvtap interface bound to a host device
    Direct {
        device: String,
        mode: DirectMode,
        virtualport: Option<VirtualPort>,
    },
    /// Interface on an existing host bridge
    Bridge {
        bridge: String,
        virtualport: Option<VirtualPort>,
    },
}

impl NetworkRef {
    /// Name of the network, host device or bridge this interface binds to.
    pub fn network_name(&self) -> &str {
        match self {
            NetworkRef::Named(name)
            | NetworkRef::Nat { name }
            | NetworkRef::Isolated { name } => name,
            NetworkRef::Direct { device, .. } => device,
            NetworkRef::Bridge { bridge, .. } => bridge,
        }
    }

    /// Libvirt interface type this reference produces.
    pub fn interface_type(&self) -> &'static str {
        match self {
            NetworkRef::Named(_) | NetworkRef::Nat { .. } | NetworkRef::Isolated { .. } => {
                "network"
            }
            NetworkRef::Direct { .. } => "direct",
            NetworkRef::Bridge { .. } => "bridge",
        }
    }

    /// Virtual-port descriptor, for the kinds that carry one.
    pub fn virtualport(&self) -> Option<&VirtualPort> {
        match self {
            NetworkRef::Direct { virtualport, .. } | NetworkRef::Bridge { virtualport, .. } => {
                virtualport.as_ref()
            }
            _ => None,
        }
    }

    /// Whether this interface attaches to the managed network `network` of
    /// kind `kind`.
    ///
    /// A bare name matches regardless of kind; an inline record must agree
    /// on both name and kind.
    pub fn attaches_to(&self, network: &str, kind: NetworkKind) -> bool {
        match self {
            NetworkRef::Named(name) => name == network,
            NetworkRef::Nat { name } => name == network && kind == NetworkKind::Nat,
            NetworkRef::Isolated { name } => name == network && kind == NetworkKind::Isolated,
            NetworkRef::Direct { .. } | NetworkRef::Bridge { .. } => false,
        }
    }
}

impl fmt::Display for NetworkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkRef::Named(name) => write!(f, "{}", name),
            NetworkRef::Nat { name } => write!(f, "{} (nat)", name),
            NetworkRef::Isolated { name } => write!(f, "{} (isolated)", name),
            NetworkRef::Direct { device, mode, .. } => {
                write!(f, "{} (direct, {})", device, mode.as_str())
            }
            NetworkRef::Bridge { bridge, .. } => write!(f, "{} (bridge)", bridge),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum NetworkRefRepr {
    Name(String),
    Inline(InlineNetworkRepr),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum InlineNetworkRepr {
    Nat {
        #[serde(alias = "_name")]
        name: String,
    },
    #[serde(alias = "isolate")]
    Isolated {
        #[serde(alias = "_name")]
        name: String,
    },
    Direct {
        #[serde(alias = "name", alias = "_name")]
        device: String,
        #[serde(default)]
        mode: DirectMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        virtualport: Option<VirtualPort>,
    },
    Bridge {
        #[serde(alias = "name", alias = "_name")]
        bridge: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        virtualport: Option<VirtualPort>,
    },
}

impl TryFrom<NetworkRefRepr> for NetworkRef {
    type Error = String;

    fn try_from(repr: NetworkRefRepr) -> std::result::Result<Self, Self::Error> {
        let net = match repr {
            NetworkRefRepr::Name(name) => NetworkRef::Named(name),
            NetworkRefRepr::Inline(InlineNetworkRepr::Nat { name }) => NetworkRef::Nat { name },
            NetworkRefRepr::Inline(InlineNetworkRepr::Isolated { name }) => {
                NetworkRef::Isolated { name }
            }
            NetworkRefRepr::Inline(InlineNetworkRepr::Direct { device, mode, virtualport }) => {
                NetworkRef::Direct { device, mode, virtualport }
            }
            NetworkRefRepr::Inline(InlineNetworkRepr::Bridge { bridge, virtualport }) => {
                NetworkRef::Bridge { bridge, virtualport }
            }
        };
        if net.network_name().is_empty() {
            return Err("network reference has an empty name".to_string());
        }
        Ok(net)
    }
}

impl From<NetworkRef> for NetworkRefRepr {
    fn from(net: NetworkRef) -> Self {
        match net {
            NetworkRef::Named(name) => NetworkRefRepr::Name(name),
            NetworkRef::Nat { name } => NetworkRefRepr::Inline(InlineNetworkRepr::Nat { name }),
            NetworkRef::Isolated { name } => {
                NetworkRefRepr::Inline(InlineNetworkRepr::Isolated { name })
            }
            NetworkRef::Direct { device, mode, virtualport } => {
                NetworkRefRepr::Inline(InlineNetworkRepr::Direct { device, mode, virtualport })
            }
            NetworkRef::Bridge { bridge, virtualport } => {
                NetworkRefRepr::Inline(InlineNetworkRepr::Bridge { bridge, virtualport })
            }
        }
    }
}

/// macvtap emulation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectMode {
    Bridge,
    Private,
    #[default]
    Vepa,
    Passthrough,
}

impl DirectMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirectMode::Bridge => "bridge",
            DirectMode::Private => "private",
            DirectMode::Vepa => "vepa",
            DirectMode::Passthrough => "passthrough",
        }
    }
}

/// Virtual-port descriptor (e.g. Open vSwitch or 802.1Qbh).
///
/// Accepts either a bare type string or a record with `type` and
/// `parameters`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "VirtualPortRepr")]
pub struct VirtualPort {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

impl VirtualPort {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VirtualPortRepr {
    Type(String),
    Full {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        parameters: BTreeMap<String, String>,
    },
}

impl From<VirtualPortRepr> for VirtualPort {
    fn from(repr: VirtualPortRepr) -> Self {
        match repr {
            VirtualPortRepr::Type(kind) => VirtualPort::new(kind),
            VirtualPortRepr::Full { kind, parameters } => VirtualPort { kind, parameters },
        }
    }
}

// =============================================================================
// NETWORK DEFINITION
// =============================================================================

/// Forwarding kind of a managed virtual network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    #[default]
    Nat,
    #[serde(alias = "isolate")]
    Isolated,
}

impl NetworkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkKind::Nat => "nat",
            NetworkKind::Isolated => "isolated",
        }
    }
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static DHCP bindings, machine name → IPv4 address.
pub type StaticIps = BTreeMap<String, String>;

/// Desired state of one managed libvirt virtual network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Resource name; also the libvirt network name
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NetworkKind,
    /// Address block, e.g. "192.168.56.0/24"
    pub cidr_block: String,
    #[serde(rename = "staticIPs", deserialize_with = "deserialize_static_ips")]
    pub static_ips: StaticIps,
    #[serde(rename = "URI")]
    pub uri: String,
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: NetworkKind::Nat,
            cidr_block: "192.168.56.0/24".to_string(),
            static_ips: StaticIps::new(),
            uri: DEFAULT_URI.to_string(),
        }
    }
}

impl NetworkSpec {
    pub fn new(name: impl Into<String>, kind: NetworkKind, cidr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            cidr_block: cidr.into(),
            ..Default::default()
        }
    }

    pub fn with_static_ip(mut self, machine: impl Into<String>, address: impl Into<String>) -> Self {
        self.static_ips.insert(machine.into(), address.into());
        self
    }

    /// Short type description, e.g. `libvirtd-network [nat 10.0.0.0/24]`.
    pub fn show_type(&self) -> String {
        format!("libvirtd-network [{} {}]", self.kind, self.cidr_block)
    }
}

/// `staticIPs` comes either as a list of `{machine, address}` records or as
/// a mapping from address to machine; both end up keyed by machine.
fn deserialize_static_ips<'de, D>(deserializer: D) -> std::result::Result<StaticIps, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Binding {
        machine: String,
        address: String,
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        List(Vec<Binding>),
        ByAddress(BTreeMap<String, String>),
    }

    Ok(match Repr::deserialize(deserializer)? {
        Repr::List(bindings) => bindings
            .into_iter()
            .map(|b| (b.machine, b.address))
            .collect(),
        Repr::ByAddress(by_address) => by_address
            .into_iter()
            .map(|(address, machine)| (machine, address))
            .collect(),
    })
}
