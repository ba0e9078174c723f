//! Libvirt hypervisor backend.
//!
//! Requires the `libvirt` feature and the libvirt client library on the
//! build host.

#[cfg(feature = "libvirt")]
mod backend;

#[cfg(feature = "libvirt")]
pub use backend::{LibvirtBackend, LibvirtConnector};

/// Check if libvirt backend is compiled in.
pub fn is_available() -> bool {
    cfg!(feature = "libvirt")
}
