//! Machine image builds through `nix-build`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, instrument};
use virtd_hypervisor::{BuildRequest, ImageBuilder, Result, VirtdError};

use crate::config::EvaluatorSettings;

/// Environment variable carrying the client public key into the build.
pub const PUBKEY_ENV: &str = "NIXOPS_LIBVIRTD_PUBKEY";

/// Builds machine images with `nix-build`.
///
/// Result links are created in a private temporary directory that lives as
/// long as the builder.
pub struct NixBuilder {
    settings: EvaluatorSettings,
    network_exprs: Vec<PathBuf>,
    work_dir: tempfile::TempDir,
}

impl NixBuilder {
    pub fn new(settings: EvaluatorSettings, network_exprs: Vec<PathBuf>) -> Result<Self> {
        let work_dir = tempfile::Builder::new().prefix("virtd-build-").tempdir()?;
        Ok(Self {
            settings,
            network_exprs,
            work_dir,
        })
    }

    fn link_path(&self, machine: &str) -> PathBuf {
        self.work_dir.path().join(format!("libvirtd-image-{}", machine))
    }
}

/// Arguments of the `nix-build` call for `request`.
pub fn nix_build_args(
    settings: &EvaluatorSettings,
    network_exprs: &[PathBuf],
    request: &BuildRequest,
    link: &Path,
) -> Vec<String> {
    let mut args = Vec::new();

    for include in &settings.include_paths {
        args.push("-I".to_string());
        args.push(include.clone());
    }

    let exprs: Vec<String> = network_exprs
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    args.push("--arg".to_string());
    args.push("networkExprs".to_string());
    args.push(format!("[ {} ]", exprs.join(" ")));

    args.push("--argstr".to_string());
    args.push("uuid".to_string());
    args.push(request.deployment_id.clone());
    args.push("--argstr".to_string());
    args.push("deploymentName".to_string());
    args.push(request.deployment_name.clone());

    args.push(settings.entry_expr.clone());

    args.push("--arg".to_string());
    args.push("checkConfigurationOptions".to_string());
    args.push("false".to_string());
    args.push("-A".to_string());
    args.push(request.attribute.clone());
    args.push("-o".to_string());
    args.push(link.display().to_string());

    args
}

#[async_trait]
impl ImageBuilder for NixBuilder {
    #[instrument(skip(self, request), fields(machine = %request.machine_name))]
    async fn build(&self, request: &BuildRequest) -> Result<PathBuf> {
        let link = self.link_path(&request.machine_name);
        let args = nix_build_args(&self.settings, &self.network_exprs, request, &link);
        debug!(args = ?args, "Running nix-build");
        info!(machine = %request.machine_name, "Building disk image");

        let output = Command::new(&self.settings.nix_build)
            .args(&args)
            .env(PUBKEY_ENV, &request.public_key)
            .output()
            .await
            .map_err(|e| VirtdError::Provisioning(format!("Failed to execute nix-build: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VirtdError::Provisioning(format!(
                "nix-build failed: {}",
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match stdout.lines().map(str::trim).filter(|l| !l.is_empty()).last() {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(link),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> BuildRequest {
        BuildRequest {
            deployment_id: "0b4c".to_string(),
            deployment_name: "lab".to_string(),
            machine_name: "web".to_string(),
            attribute: BuildRequest::base_image_attribute("web"),
            public_key: "ssh-ed25519 AAAA".to_string(),
        }
    }

    #[test]
    fn test_args_carry_deployment_identity() {
        let settings = EvaluatorSettings {
            include_paths: vec!["nixpkgs=/src/nixpkgs".to_string()],
            ..Default::default()
        };
        let args = nix_build_args(
            &settings,
            &[PathBuf::from("/d/lab.nix"), PathBuf::from("/d/hw.nix")],
            &request(),
            Path::new("/tmp/link"),
        );

        let joined = args.join(" ");
        assert!(joined.starts_with("-I nixpkgs=/src/nixpkgs --arg networkExprs [ /d/lab.nix /d/hw.nix ]"));
        assert!(joined.contains("--argstr uuid 0b4c --argstr deploymentName lab"));
        assert!(joined.contains("--arg checkConfigurationOptions false"));
        assert!(joined.ends_with("-A nodes.web.config.deployment.libvirtd.baseImage -o /tmp/link"));
    }

    #[test]
    fn test_link_is_per_machine() {
        let builder = NixBuilder::new(EvaluatorSettings::default(), Vec::new()).unwrap();
        let link = builder.link_path("db");
        assert!(link.ends_with("libvirtd-image-db"));
        assert!(link.starts_with(builder.work_dir.path()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_build_failure_is_provisioning_error() {
        let settings = EvaluatorSettings {
            nix_build: "false".to_string(),
            ..Default::default()
        };
        let builder = NixBuilder::new(settings, Vec::new()).unwrap();
        let err = builder.build(&request()).await.unwrap_err();
        assert!(matches!(err, VirtdError::Provisioning(_)));
    }
}
