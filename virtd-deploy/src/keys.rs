//! SSH key pairs through `ssh-keygen`.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use virtd_hypervisor::{KeyGenerator, KeyPair, Result, VirtdError};

/// Generates ed25519 key pairs with an empty passphrase.
#[derive(Debug, Clone)]
pub struct SshKeygen {
    binary: String,
}

impl SshKeygen {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for SshKeygen {
    fn default() -> Self {
        Self::new("ssh-keygen")
    }
}

#[async_trait]
impl KeyGenerator for SshKeygen {
    async fn generate(&self) -> Result<KeyPair> {
        let dir = tempfile::tempdir()?;
        let key_file = dir.path().join("id_ed25519");

        let output = Command::new(&self.binary)
            .arg("-t")
            .arg("ed25519")
            .arg("-N")
            .arg("")
            .arg("-C")
            .arg("virtd")
            .arg("-q")
            .arg("-f")
            .arg(&key_file)
            .output()
            .await
            .map_err(|e| {
                VirtdError::OperationFailed(format!("Failed to execute ssh-keygen: {}", e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VirtdError::OperationFailed(format!(
                "ssh-keygen failed: {}",
                stderr.trim()
            )));
        }

        let private_key = tokio::fs::read_to_string(&key_file).await?;
        let public_key = tokio::fs::read_to_string(key_file.with_extension("pub")).await?;
        debug!("Generated client key pair");

        Ok(KeyPair {
            private_key,
            public_key: public_key.trim().to_string(),
        })
    }
}
