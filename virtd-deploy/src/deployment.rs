//! Deployment definition files.
//!
//! ```yaml
//! name: lab
//! networkExprs: [./lab.nix]
//! networks:
//!   lab-net:
//!     type: nat
//!     cidrBlock: 10.10.0.0/24
//!     staticIPs:
//!       - { machine: web, address: 10.10.0.10 }
//! machines:
//!   web:
//!     memorySize: 1024
//!     networks:
//!       - { type: nat, name: lab-net }
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use virtd_hypervisor::{MachineCatalog, MachineSpec, NetworkSpec};

/// Problems with a deployment definition.
#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("Failed to read deployment {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse deployment: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Machine '{machine}': {reason}")]
    Machine { machine: String, reason: String },

    #[error("'{0}' is defined both as a machine and as a network")]
    NameClash(String),
}

/// A deployment: the desired machines and networks plus the expressions
/// their images are built from.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Deployment {
    pub name: String,
    /// Fixed deployment UUID; generated and kept in the state file if absent
    pub uuid: Option<String>,
    /// Nix expressions describing the machines
    #[serde(alias = "networkExpr")]
    pub network_exprs: Vec<PathBuf>,
    pub machines: BTreeMap<String, MachineSpec>,
    pub networks: BTreeMap<String, NetworkSpec>,
}

impl Deployment {
    /// Parse a definition and fill in resource names from their keys.
    pub fn from_yaml(yaml: &str) -> Result<Self, DefinitionError> {
        let mut deployment: Deployment = serde_yaml::from_str(yaml)?;

        for (name, machine) in deployment.machines.iter_mut() {
            machine.name = name.clone();
        }
        for (name, network) in deployment.networks.iter_mut() {
            network.name = name.clone();
        }

        deployment.validate()?;
        Ok(deployment)
    }

    /// Read a definition file.
    ///
    /// Relative expression paths are resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self, DefinitionError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| DefinitionError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut deployment = Self::from_yaml(&yaml)?;

        if let Some(base) = path.parent() {
            for expr in deployment.network_exprs.iter_mut() {
                if expr.is_relative() {
                    *expr = base.join(&*expr);
                }
            }
        }
        Ok(deployment)
    }

    fn validate(&self) -> Result<(), DefinitionError> {
        for (name, machine) in &self.machines {
            machine.validate().map_err(|e| DefinitionError::Machine {
                machine: name.clone(),
                reason: e.to_string(),
            })?;
            if self.networks.contains_key(name) {
                return Err(DefinitionError::NameClash(name.clone()));
            }
        }
        Ok(())
    }

    /// Machine definitions keyed by name, as networks see them.
    pub fn catalog(&self) -> MachineCatalog {
        self.machines.clone()
    }

    /// Resource names in deployment order: networks, then machines.
    pub fn resource_names(&self) -> impl Iterator<Item = &str> {
        self.networks
            .keys()
            .chain(self.machines.keys())
            .map(String::as_str)
    }

    /// Apply `uri` to resources that kept the built-in default.
    pub fn with_default_uri(mut self, uri: &str) -> Self {
        let builtin = MachineSpec::default().uri;
        for machine in self.machines.values_mut() {
            if machine.uri == builtin {
                machine.uri = uri.to_string();
            }
        }
        for network in self.networks.values_mut() {
            if network.uri == builtin {
                network.uri = uri.to_string();
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtd_hypervisor::{NetworkKind, NetworkRef};

    const LAB: &str = r#"
name: lab
networkExprs: [lab.nix]
networks:
  lab-net:
    type: nat
    cidrBlock: 10.10.0.0/24
    staticIPs:
      - { machine: web, address: 10.10.0.10 }
  backend:
    type: isolate
    cidrBlock: 10.20.0.0/24
    staticIPs:
      10.20.0.5: db
machines:
  web:
    memorySize: 1024
    networks:
      - { type: nat, name: lab-net }
      - default
  db:
    headless: true
    networks:
      - { type: isolated, name: backend }
"#;

    #[test]
    fn test_parse_fills_names_and_defaults() {
        let deployment = Deployment::from_yaml(LAB).unwrap();

        assert_eq!(deployment.name, "lab");
        assert!(deployment.uuid.is_none());
        let web = &deployment.machines["web"];
        assert_eq!(web.name, "web");
        assert_eq!(web.memory_size, 1024);
        assert_eq!(web.vcpu, 1);
        assert_eq!(web.domain_type, "kvm");
        assert_eq!(web.storage_pool, "default");
        assert_eq!(web.networks[0], NetworkRef::Nat { name: "lab-net".into() });
        assert_eq!(web.networks[1], NetworkRef::Named("default".into()));

        let backend = &deployment.networks["backend"];
        assert_eq!(backend.name, "backend");
        assert_eq!(backend.kind, NetworkKind::Isolated);
        assert_eq!(backend.static_ips.get("db").map(String::as_str), Some("10.20.0.5"));
        assert_eq!(
            deployment.networks["lab-net"].static_ips.get("web").map(String::as_str),
            Some("10.10.0.10")
        );
    }

    #[test]
    fn test_resource_order() {
        let deployment = Deployment::from_yaml(LAB).unwrap();
        let names: Vec<&str> = deployment.resource_names().collect();
        assert_eq!(names, vec!["backend", "lab-net", "db", "web"]);
    }

    #[test]
    fn test_machine_without_networks_rejected() {
        let err = Deployment::from_yaml("machines:\n  web:\n    networks: []\n").unwrap_err();
        assert!(matches!(err, DefinitionError::Machine { ref machine, .. } if machine == "web"));
    }

    #[test]
    fn test_name_clash_rejected() {
        let yaml = "machines:\n  lab: {}\nnetworks:\n  lab: {}\n";
        assert!(matches!(
            Deployment::from_yaml(yaml),
            Err(DefinitionError::NameClash(name)) if name == "lab"
        ));
    }

    #[test]
    fn test_default_uri_applies_only_to_unset() {
        let yaml = "machines:\n  a: {}\n  b:\n    URI: qemu+ssh://host/system\n";
        let deployment = Deployment::from_yaml(yaml)
            .unwrap()
            .with_default_uri("qemu:///session");
        assert_eq!(deployment.machines["a"].uri, "qemu:///session");
        assert_eq!(deployment.machines["b"].uri, "qemu+ssh://host/system");
    }

    #[test]
    fn test_load_resolves_relative_exprs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deployment.yaml");
        std::fs::write(&path, LAB).unwrap();

        let deployment = Deployment::load(&path).unwrap();
        assert_eq!(deployment.network_exprs, vec![dir.path().join("lab.nix")]);
    }
}
