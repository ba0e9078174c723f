//! Disk image provisioning.
//!
//! Builds the machine's base image, inspects it with `qemu-img`, creates a
//! managed volume for it and streams the image into that volume.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, error, info, instrument};

use crate::error::{Result, VirtdError};
use crate::external::{BuildRequest, ImageInfo, ImageInspector, Toolbox};
use crate::traits::{Hypervisor, PoolHandle, VolumeHandle};
use crate::xml::XmlElement;

/// Image file the evaluator is expected to produce.
pub const IMAGE_FILE_NAME: &str = "nixos.qcow2";

/// Name of the managed volume backing `machine_id`.
pub fn volume_name(machine_id: &str) -> String {
    format!("{}.qcow2", machine_id)
}

/// Volume definition for a qcow2 image.
pub fn volume_xml(name: &str, info: &ImageInfo) -> Result<String> {
    XmlElement::new("volume")
        .child(XmlElement::new("name").text(name))
        .child(XmlElement::new("capacity").text(info.virtual_size))
        .child(XmlElement::new("allocation").text(info.file_length))
        .child(
            XmlElement::new("target")
                .child(XmlElement::new("format").attr("type", "qcow2")),
        )
        .render()
}

/// Runs the build, inspect, create and upload steps for one machine.
pub struct StorageProvisioner<'a> {
    toolbox: &'a Toolbox,
}

impl<'a> StorageProvisioner<'a> {
    pub fn new(toolbox: &'a Toolbox) -> Self {
        Self { toolbox }
    }

    /// Provision the root volume of `machine_id` in `pool`.
    ///
    /// Any failure aborts provisioning. A volume created before a failed
    /// upload is left behind.
    #[instrument(skip(self, conn, request), fields(machine = %request.machine_name))]
    pub async fn provision(
        &self,
        conn: &dyn Hypervisor,
        pool: &PoolHandle,
        machine_id: &str,
        request: &BuildRequest,
    ) -> Result<VolumeHandle> {
        info!("Preparing disk image");
        let out_dir = self
            .toolbox
            .builder
            .build(request)
            .await
            .map_err(|e| fail("building the base image", e))?;

        let image = image_path(&out_dir)?;
        let info = self
            .toolbox
            .inspector
            .inspect(&image)
            .await
            .map_err(|e| fail("inspecting the base image", e))?;
        debug!(
            virtual_size = info.virtual_size,
            file_length = info.file_length,
            "Inspected disk image"
        );

        info!("Uploading disk image");
        let name = volume_name(machine_id);
        let xml = volume_xml(&name, &info)?;
        let vol = conn
            .create_volume(pool, &xml)
            .await
            .map_err(|e| fail("creating the storage volume", e))?;

        let sent = conn
            .upload_volume(&vol, &image, 0, info.file_length)
            .await
            .map_err(|e| fail("uploading the disk image", e))?;
        if sent != info.file_length {
            return Err(fail(
                "uploading the disk image",
                VirtdError::OperationFailed(format!(
                    "sent {} of {} bytes",
                    sent, info.file_length
                )),
            ));
        }

        info!(volume = %vol.name, pool = %vol.pool, "Disk image uploaded");
        Ok(vol)
    }
}

fn image_path(out_dir: &Path) -> Result<PathBuf> {
    let image = out_dir.join(IMAGE_FILE_NAME);
    if !image.is_file() {
        return Err(fail(
            "locating the base image",
            VirtdError::NotFound(format!("{} has no {}", out_dir.display(), IMAGE_FILE_NAME)),
        ));
    }
    Ok(image)
}

fn fail(step: &str, e: VirtdError) -> VirtdError {
    error!(error = %e, "Failed {}", step);
    match e {
        VirtdError::Provisioning(_) => e,
        other => VirtdError::Provisioning(format!("{}: {}", step, other)),
    }
}

// =============================================================================
// QEMU-IMG INSPECTOR
// =============================================================================

/// Inspects images with `qemu-img info`.
#[derive(Debug, Clone)]
pub struct QemuImg {
    qemu_img_path: String,
}

impl QemuImg {
    pub fn new() -> Self {
        Self {
            qemu_img_path: "qemu-img".to_string(),
        }
    }

    /// Set the qemu-img binary path.
    pub fn with_binary(mut self, path: impl Into<String>) -> Self {
        self.qemu_img_path = path.into();
        self
    }
}

impl Default for QemuImg {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageInspector for QemuImg {
    #[instrument(skip(self), fields(path = %image.display()))]
    async fn inspect(&self, image: &Path) -> Result<ImageInfo> {
        let output = Command::new(&self.qemu_img_path)
            .arg("info")
            .arg("--output")
            .arg("json")
            .arg(image)
            .output()
            .await
            .map_err(|e| {
                VirtdError::OperationFailed(format!("Failed to execute qemu-img: {}", e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VirtdError::OperationFailed(format!(
                "qemu-img info failed: {}",
                stderr.trim()
            )));
        }

        // The on-disk length is taken from the file itself; qemu-img's
        // "actual-size" counts allocated blocks, which differs per filesystem.
        let file_length = tokio::fs::metadata(image).await?.len();
        parse_image_info(&output.stdout, file_length)
    }
}

/// Extract the virtual size from `qemu-img info --output json`.
pub fn parse_image_info(json: &[u8], file_length: u64) -> Result<ImageInfo> {
    let info: serde_json::Value = serde_json::from_slice(json).map_err(|e| {
        VirtdError::OperationFailed(format!("Failed to parse qemu-img output: {}", e))
    })?;

    let virtual_size = info["virtual-size"].as_u64().ok_or_else(|| {
        VirtdError::OperationFailed("qemu-img output has no virtual-size".to_string())
    })?;

    Ok(ImageInfo {
        virtual_size,
        file_length,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockImageBuilder, MockInspector, MockKeys};
    use std::sync::Arc;

    fn toolbox(builder: Arc<MockImageBuilder>) -> Toolbox {
        Toolbox::new(builder, Arc::new(MockInspector::new(8 << 30)), Arc::new(MockKeys))
    }

    fn request() -> BuildRequest {
        BuildRequest {
            deployment_id: "d1".into(),
            deployment_name: "test".into(),
            machine_name: "web".into(),
            attribute: BuildRequest::base_image_attribute("web"),
            public_key: "ssh-ed25519 AAAA".into(),
        }
    }

    #[test]
    fn test_volume_xml() {
        let info = ImageInfo {
            virtual_size: 8589934592,
            file_length: 1234567,
        };
        assert_eq!(
            volume_xml("nixops-1-web.qcow2", &info).unwrap(),
            concat!(
                "<volume><name>nixops-1-web.qcow2</name>",
                "<capacity>8589934592</capacity><allocation>1234567</allocation>",
                r#"<target><format type="qcow2"/></target></volume>"#
            )
        );
    }

    #[test]
    fn test_parse_image_info() {
        let json = br#"{
            "virtual-size": 4294967296,
            "filename": "nixos.qcow2",
            "format": "qcow2",
            "actual-size": 1007616,
            "dirty-flag": false
        }"#;
        let info = parse_image_info(json, 999).unwrap();
        assert_eq!(info.virtual_size, 4294967296);
        assert_eq!(info.file_length, 999);

        assert!(parse_image_info(b"{}", 1).is_err());
        assert!(parse_image_info(b"not json", 1).is_err());
    }

    #[tokio::test]
    async fn test_provision_uploads_whole_image() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Arc::new(MockImageBuilder::new(dir.path()));
        builder.set_image(&[7u8; 4096]).unwrap();
        let tools = toolbox(Arc::clone(&builder));
        let backend = MockBackend::new();
        let pool = PoolHandle::new("default");

        let vol = StorageProvisioner::new(&tools)
            .provision(&backend, &pool, "nixops-d1-web", &request())
            .await
            .unwrap();

        assert_eq!(vol, VolumeHandle::new("default", "nixops-d1-web.qcow2"));
        let stored = backend.volume("default", "nixops-d1-web.qcow2").unwrap();
        assert_eq!(stored.capacity, 8 << 30);
        assert_eq!(stored.allocation, 4096);
        assert_eq!(stored.uploaded, 4096);
        assert_eq!(builder.requests(), vec![request()]);
    }

    #[tokio::test]
    async fn test_missing_image_is_provisioning_error() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Arc::new(MockImageBuilder::new(dir.path()));
        let tools = toolbox(builder);
        let backend = MockBackend::new();

        let err = StorageProvisioner::new(&tools)
            .provision(&backend, &PoolHandle::new("default"), "nixops-d1-web", &request())
            .await
            .unwrap_err();
        assert!(matches!(err, VirtdError::Provisioning(_)));
        assert!(backend.volume("default", "nixops-d1-web.qcow2").is_none());
    }

    #[tokio::test]
    async fn test_upload_failure_leaves_volume() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Arc::new(MockImageBuilder::new(dir.path()));
        builder.set_image(b"qcow").unwrap();
        let tools = toolbox(builder);
        let backend = MockBackend::new();
        backend.fail_on("upload_volume");

        let err = StorageProvisioner::new(&tools)
            .provision(&backend, &PoolHandle::new("default"), "nixops-d1-web", &request())
            .await
            .unwrap_err();
        assert!(matches!(err, VirtdError::Provisioning(_)));
        assert!(backend.volume("default", "nixops-d1-web.qcow2").is_some());
    }
}
