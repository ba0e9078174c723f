//! Persisted resource state.
//!
//! Each resource is stored as a flat attribute map keyed by the attribute
//! names below. Lists and maps nested inside a record are JSON-encoded
//! strings, so every attribute value stays a scalar.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use crate::error::{Result, VirtdError};
use crate::types::{NetworkKind, NetworkRef, StaticIps, DEFAULT_URI};

/// Flat attribute map of one resource.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Key/value store holding one attribute map per resource.
///
/// `store` replaces the whole map of a resource in one transaction.
pub trait StateStore: Send + Sync {
    /// Attributes of `resource`; empty if it was never stored.
    fn load(&self, resource: &str) -> Result<Attributes>;

    fn store(&self, resource: &str, attrs: &Attributes) -> Result<()>;

    fn remove(&self, resource: &str) -> Result<()>;

    /// Names of all stored resources.
    fn resources(&self) -> Result<Vec<String>>;
}

/// In-memory state store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Attributes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> VirtdError {
    VirtdError::State("state store lock poisoned".to_string())
}

impl StateStore for MemoryStore {
    fn load(&self, resource: &str) -> Result<Attributes> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.get(resource).cloned().unwrap_or_default())
    }

    fn store(&self, resource: &str, attrs: &Attributes) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert(resource.to_string(), attrs.clone());
        Ok(())
    }

    fn remove(&self, resource: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.remove(resource);
        Ok(())
    }

    fn resources(&self) -> Result<Vec<String>> {
        let entries = self.entries.read().map_err(poisoned)?;
        let mut names: Vec<String> = entries.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

// =============================================================================
// MACHINE RECORD
// =============================================================================

/// Lifecycle state of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    #[default]
    Absent,
    Defined,
    Running,
    Stopped,
    Destroyed,
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MachineState::Absent => "absent",
            MachineState::Defined => "defined",
            MachineState::Running => "running",
            MachineState::Stopped => "stopped",
            MachineState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Persisted state of one machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineRecord {
    #[serde(default)]
    pub state: MachineState,
    #[serde(rename = "vmId", default, skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<String>,
    #[serde(rename = "privateIpv4", default, skip_serializing_if = "Option::is_none")]
    pub private_ipv4: Option<String>,
    #[serde(rename = "libvirtd.clientPublicKey", default, skip_serializing_if = "Option::is_none")]
    pub client_public_key: Option<String>,
    #[serde(rename = "libvirtd.clientPrivateKey", default, skip_serializing_if = "Option::is_none")]
    pub client_private_key: Option<String>,
    #[serde(rename = "libvirtd.primaryNet", default, skip_serializing_if = "Option::is_none")]
    pub primary_net: Option<String>,
    #[serde(rename = "libvirtd.primaryMAC", default, skip_serializing_if = "Option::is_none")]
    pub primary_mac: Option<String>,
    #[serde(rename = "libvirtd.primaryIp", default, skip_serializing_if = "Option::is_none")]
    pub primary_ip: Option<String>,
    #[serde(rename = "libvirtd.domainXML", default, skip_serializing_if = "Option::is_none")]
    pub domain_xml: Option<String>,
    /// Local disk image of deployments that predate managed volumes
    #[serde(rename = "libvirtd.diskPath", default, skip_serializing_if = "Option::is_none")]
    pub disk_path: Option<String>,
    #[serde(rename = "libvirtd.storageVolume", default, skip_serializing_if = "Option::is_none")]
    pub storage_volume: Option<String>,
    #[serde(rename = "libvirtd.storagePool", default, skip_serializing_if = "Option::is_none")]
    pub storage_pool: Option<String>,
    #[serde(rename = "libvirtd.vcpu", default, skip_serializing_if = "Option::is_none")]
    pub vcpu: Option<u32>,
    #[serde(rename = "libvirtd.networks", default, with = "json_encoded")]
    pub networks: Vec<NetworkRef>,
    #[serde(rename = "libvirtd.URI", default = "default_uri")]
    pub uri: String,
}

impl Default for MachineRecord {
    fn default() -> Self {
        Self {
            state: MachineState::Absent,
            vm_id: None,
            private_ipv4: None,
            client_public_key: None,
            client_private_key: None,
            primary_net: None,
            primary_mac: None,
            primary_ip: None,
            domain_xml: None,
            disk_path: None,
            storage_volume: None,
            storage_pool: None,
            vcpu: None,
            networks: Vec::new(),
            uri: default_uri(),
        }
    }
}

impl MachineRecord {
    pub fn from_attributes(attrs: &Attributes) -> Result<Self> {
        from_attributes(attrs)
    }

    pub fn to_attributes(&self) -> Result<Attributes> {
        to_attributes(self)
    }
}

// =============================================================================
// NETWORK RECORD
// =============================================================================

/// Lifecycle state of a managed network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkState {
    #[default]
    Missing,
    Up,
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkState::Missing => f.write_str("missing"),
            NetworkState::Up => f.write_str("up"),
        }
    }
}

/// Persisted state of one managed network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRecord {
    #[serde(default)]
    pub state: NetworkState,
    /// Bridge device the network runs on
    #[serde(rename = "libvirtd.network_name", default, skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,
    #[serde(rename = "libvirtd.network_type", default, skip_serializing_if = "Option::is_none")]
    pub network_type: Option<NetworkKind>,
    #[serde(rename = "libvirtd.network_cidr", default, skip_serializing_if = "Option::is_none")]
    pub network_cidr: Option<String>,
    #[serde(rename = "libvirtd.static_ips", default, with = "json_encoded")]
    pub static_ips: StaticIps,
    #[serde(rename = "libvirtd.URI", default = "default_uri")]
    pub uri: String,
}

impl Default for NetworkRecord {
    fn default() -> Self {
        Self {
            state: NetworkState::Missing,
            network_name: None,
            network_type: None,
            network_cidr: None,
            static_ips: StaticIps::new(),
            uri: default_uri(),
        }
    }
}

impl NetworkRecord {
    pub fn from_attributes(attrs: &Attributes) -> Result<Self> {
        from_attributes(attrs)
    }

    pub fn to_attributes(&self) -> Result<Attributes> {
        to_attributes(self)
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn default_uri() -> String {
    DEFAULT_URI.to_string()
}

fn from_attributes<T: serde::de::DeserializeOwned>(attrs: &Attributes) -> Result<T> {
    Ok(serde_json::from_value(serde_json::Value::Object(attrs.clone()))?)
}

fn to_attributes<T: Serialize>(record: &T) -> Result<Attributes> {
    match serde_json::to_value(record)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(VirtdError::State(format!(
            "record serialized to a non-object value: {}",
            other
        ))),
    }
}

/// (De)serialize a value as a JSON document stored in a string attribute.
mod json_encoded {
    use serde::de::{DeserializeOwned, Error as _};
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        let text = serde_json::to_string(value).map_err(S::Error::custom)?;
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: DeserializeOwned + Default,
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) if !text.is_empty() => {
                serde_json::from_str(&text).map_err(D::Error::custom)
            }
            _ => Ok(T::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: serde_json::Value) -> Attributes {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_missing_uri_defaults() {
        let machine = MachineRecord::from_attributes(&Attributes::new()).unwrap();
        assert_eq!(machine.uri, "qemu:///system");
        assert_eq!(machine.state, MachineState::Absent);
        assert!(machine.networks.is_empty());

        let network = NetworkRecord::from_attributes(&Attributes::new()).unwrap();
        assert_eq!(network.uri, "qemu:///system");
        assert_eq!(network.state, NetworkState::Missing);
    }

    #[test]
    fn test_machine_attribute_keys() {
        let record = MachineRecord {
            state: MachineState::Running,
            vm_id: Some("nixops-1-web".into()),
            primary_mac: Some("52:54:00:01:02:03".into()),
            storage_volume: Some("nixops-1-web.qcow2".into()),
            networks: vec![NetworkRef::Named("default".into())],
            ..Default::default()
        };

        let map = record.to_attributes().unwrap();
        assert_eq!(map["state"], json!("running"));
        assert_eq!(map["vmId"], json!("nixops-1-web"));
        assert_eq!(map["libvirtd.primaryMAC"], json!("52:54:00:01:02:03"));
        assert_eq!(map["libvirtd.storageVolume"], json!("nixops-1-web.qcow2"));
        assert_eq!(map["libvirtd.networks"], json!(r#"["default"]"#));
        assert_eq!(map["libvirtd.URI"], json!("qemu:///system"));
        assert!(!map.contains_key("libvirtd.domainXML"));

        assert_eq!(MachineRecord::from_attributes(&map).unwrap(), record);
    }

    #[test]
    fn test_reads_legacy_attributes() {
        let map = attrs(json!({
            "privateIpv4": "192.168.122.40",
            "libvirtd.diskPath": "/var/lib/nixops/disk.qcow2",
            "libvirtd.networks": "[\"default\", {\"type\": \"bridge\", \"name\": \"br0\"}]",
        }));

        let record = MachineRecord::from_attributes(&map).unwrap();
        assert_eq!(record.private_ipv4.as_deref(), Some("192.168.122.40"));
        assert_eq!(record.disk_path.as_deref(), Some("/var/lib/nixops/disk.qcow2"));
        assert_eq!(record.networks.len(), 2);
        assert_eq!(record.networks[1].network_name(), "br0");
    }

    #[test]
    fn test_network_record_static_ips() {
        let record = NetworkRecord {
            state: NetworkState::Up,
            network_name: Some("virbr3".into()),
            network_type: Some(NetworkKind::Nat),
            network_cidr: Some("10.0.0.0/24".into()),
            static_ips: [("web".to_string(), "10.0.0.10".to_string())].into_iter().collect(),
            uri: DEFAULT_URI.into(),
        };

        let map = record.to_attributes().unwrap();
        assert_eq!(map["libvirtd.static_ips"], json!(r#"{"web":"10.0.0.10"}"#));
        assert_eq!(map["libvirtd.network_type"], json!("nat"));
        assert_eq!(NetworkRecord::from_attributes(&map).unwrap(), record);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.load("web").unwrap().is_empty());

        let map = attrs(json!({"state": "running"}));
        store.store("web", &map).unwrap();
        store.store("lab", &Attributes::new()).unwrap();
        assert_eq!(store.load("web").unwrap(), map);
        assert_eq!(store.resources().unwrap(), vec!["lab", "web"]);

        store.remove("web").unwrap();
        assert!(store.load("web").unwrap().is_empty());
    }
}
