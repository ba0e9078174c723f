//! Managed libvirt virtual networks.
//!
//! - CIDR arithmetic for gateway and DHCP range
//! - Network reconciliation (define, live updates, destroy, re-check)

mod reconciler;
mod subnet;

pub use reconciler::{MachineCatalog, NetworkReconciler};
pub use subnet::{addressing, contains, parse_cidr};
