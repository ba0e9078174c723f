//! Collaborators outside the hypervisor: image builds, image inspection,
//! key generation and operator confirmation.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;

/// What to build for one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub deployment_id: String,
    pub deployment_name: String,
    pub machine_name: String,
    /// Attribute path of the artifact, e.g.
    /// `nodes.web.config.deployment.libvirtd.baseImage`
    pub attribute: String,
    /// Public key baked into the image for root access
    pub public_key: String,
}

impl BuildRequest {
    /// Attribute path of a machine's base disk image.
    pub fn base_image_attribute(machine: &str) -> String {
        format!("nodes.{}.config.deployment.libvirtd.baseImage", machine)
    }
}

/// Builds deployment artifacts.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build the artifact and return the output directory.
    async fn build(&self, request: &BuildRequest) -> Result<PathBuf>;
}

/// Sizes of a disk image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    /// Logical size seen by the guest
    pub virtual_size: u64,
    /// Bytes on disk
    pub file_length: u64,
}

/// Reads disk image metadata.
#[async_trait]
pub trait ImageInspector: Send + Sync {
    async fn inspect(&self, image: &Path) -> Result<ImageInfo>;
}

/// An SSH key pair in OpenSSH text form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// Generates SSH key pairs.
#[async_trait]
pub trait KeyGenerator: Send + Sync {
    async fn generate(&self) -> Result<KeyPair>;
}

/// Asks the operator to confirm a destructive action.
pub trait Confirm: Send + Sync {
    fn confirm(&self, question: &str) -> bool;
}

/// Always answers with a fixed value (`--yes`, non-interactive runs).
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm(pub bool);

impl Confirm for AutoConfirm {
    fn confirm(&self, _question: &str) -> bool {
        self.0
    }
}

/// The external collaborators a machine reconciliation needs.
#[derive(Clone)]
pub struct Toolbox {
    pub builder: Arc<dyn ImageBuilder>,
    pub inspector: Arc<dyn ImageInspector>,
    pub keys: Arc<dyn KeyGenerator>,
}

impl Toolbox {
    pub fn new(
        builder: Arc<dyn ImageBuilder>,
        inspector: Arc<dyn ImageInspector>,
        keys: Arc<dyn KeyGenerator>,
    ) -> Self {
        Self {
            builder,
            inspector,
            keys,
        }
    }
}

impl std::fmt::Debug for Toolbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolbox").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_image_attribute() {
        assert_eq!(
            BuildRequest::base_image_attribute("web"),
            "nodes.web.config.deployment.libvirtd.baseImage"
        );
    }

    #[test]
    fn test_auto_confirm() {
        assert!(AutoConfirm(true).confirm("destroy?"));
        assert!(!AutoConfirm(false).confirm("destroy?"));
    }
}
