//! # virtd Hypervisor
//!
//! Reconciliation engine for libvirt machines and virtual networks.
//!
//! Given the persisted state of a resource and its desired definition, the
//! reconcilers decide which hypervisor calls to make: provision and upload
//! the root volume, define the domain, hot-swap interfaces, start it and
//! wait for its lease; define a virtual network and apply live DHCP and
//! forwarding updates.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────┐   ┌───────────────────────┐
//! │   MachineReconciler   │   │   NetworkReconciler   │
//! └───────────┬───────────┘   └───────────┬───────────┘
//!             │   ConnectionManager (per resource)
//!             └─────────────┬─────────────┘
//!                           ▼
//!               ┌───────────────────────┐
//!               │    Hypervisor trait   │
//!               └───────────┬───────────┘
//!             ┌─────────────┴─────────────┐
//!             ▼                           ▼
//!   ┌───────────────────┐       ┌───────────────────┐
//!   │  LibvirtBackend   │       │    MockBackend    │
//!   │   (via libvirt)   │       │    (in memory)    │
//!   └───────────────────┘       └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use virtd_hypervisor::{MachineReconciler, MachineSpec, DeploymentInfo, MemoryStore};
//!
//! let mut machine = MachineReconciler::load(
//!     "web",
//!     DeploymentInfo::new(uuid, "demo"),
//!     Arc::new(MemoryStore::new()),
//!     connector,
//!     toolbox,
//! )?;
//! machine.create(&MachineSpec::new("web"), false, false, false).await?;
//! ```

pub mod connection;
pub mod discovery;
pub mod error;
pub mod external;
pub mod libvirt;
pub mod machine;
pub mod mock;
pub mod network;
pub mod state;
pub mod storage;
pub mod traits;
pub mod types;
pub mod xml;

pub use connection::ConnectionManager;
pub use discovery::IpDiscovery;
pub use error::{best_effort, BestEffort, Result, VirtdError};
pub use external::{
    AutoConfirm, BuildRequest, Confirm, ImageBuilder, ImageInfo, ImageInspector, KeyGenerator,
    KeyPair, Toolbox,
};
pub use machine::{address_to, ssh_flags, MachineReconciler};
pub use mock::{MockBackend, MockConnector};
pub use network::{MachineCatalog, NetworkReconciler};
pub use state::{
    Attributes, MachineRecord, MachineState, MemoryStore, NetworkRecord, NetworkState, StateStore,
};
pub use storage::QemuImg;
pub use traits::{Hypervisor, HypervisorConnector};
pub use types::*;

// Re-export libvirt backend when available
#[cfg(feature = "libvirt")]
pub use libvirt::{LibvirtBackend, LibvirtConnector};
