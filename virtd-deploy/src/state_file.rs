//! JSON state file.
//!
//! The whole file is rewritten on every store: the new contents go to a
//! temporary file in the same directory which is then renamed over the
//! old one, so a crash leaves either the previous or the new state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;
use virtd_hypervisor::{Attributes, Result, StateStore, VirtdError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateDocument {
    /// Deployment UUID the resources belong to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    resources: BTreeMap<String, Attributes>,
}

/// State store backed by one JSON file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    document: RwLock<StateDocument>,
}

impl JsonFileStore {
    /// Open the state file at `path`; a missing file is an empty state.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let document: StateDocument = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                VirtdError::State(format!("corrupt state file {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StateDocument::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), "Opened state file");
        Ok(Self {
            path,
            document: RwLock::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deployment UUID recorded in the file.
    pub fn uuid(&self) -> Result<Option<String>> {
        Ok(self.read()?.uuid.clone())
    }

    /// Return the recorded UUID, recording `candidate` first if none is set.
    pub fn ensure_uuid(&self, candidate: impl FnOnce() -> String) -> Result<String> {
        let mut document = self.write()?;
        if let Some(uuid) = &document.uuid {
            return Ok(uuid.clone());
        }
        let uuid = candidate();
        document.uuid = Some(uuid.clone());
        self.flush(&mut document)?;
        Ok(uuid)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, StateDocument>> {
        self.document
            .read()
            .map_err(|_| VirtdError::State("state lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, StateDocument>> {
        self.document
            .write()
            .map_err(|_| VirtdError::State("state lock poisoned".to_string()))
    }

    fn flush(&self, document: &mut StateDocument) -> Result<()> {
        document.updated_at = Some(Utc::now());
        let json = serde_json::to_vec_pretty(&*document)?;

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&json)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| VirtdError::Io(e.error))?;
        Ok(())
    }
}

impl StateStore for JsonFileStore {
    fn load(&self, resource: &str) -> Result<Attributes> {
        Ok(self
            .read()?
            .resources
            .get(resource)
            .cloned()
            .unwrap_or_default())
    }

    fn store(&self, resource: &str, attrs: &Attributes) -> Result<()> {
        let mut document = self.write()?;
        document.resources.insert(resource.to_string(), attrs.clone());
        self.flush(&mut document)
    }

    fn remove(&self, resource: &str) -> Result<()> {
        let mut document = self.write()?;
        if document.resources.remove(resource).is_some() {
            self.flush(&mut document)?;
        }
        Ok(())
    }

    fn resources(&self) -> Result<Vec<String>> {
        Ok(self.read()?.resources.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: serde_json::Value) -> Attributes {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("state.json")).unwrap();
        assert!(store.load("web").unwrap().is_empty());
        assert!(store.resources().unwrap().is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = JsonFileStore::open(&path).unwrap();
        store
            .store("web", &attrs(json!({"state": "running", "vmId": "nixops-1-web"})))
            .unwrap();
        store.store("lab-net", &attrs(json!({"state": "up"}))).unwrap();

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.resources().unwrap(), vec!["lab-net", "web"]);
        assert_eq!(reopened.load("web").unwrap()["vmId"], json!("nixops-1-web"));

        reopened.remove("web").unwrap();
        let again = JsonFileStore::open(&path).unwrap();
        assert_eq!(again.resources().unwrap(), vec!["lab-net"]);
    }

    #[test]
    fn test_uuid_is_recorded_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(store.uuid().unwrap(), None);
        assert_eq!(store.ensure_uuid(|| "first".to_string()).unwrap(), "first");
        assert_eq!(store.ensure_uuid(|| "second".to_string()).unwrap(), "first");

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.uuid().unwrap().as_deref(), Some("first"));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(JsonFileStore::open(&path), Err(VirtdError::State(_))));
    }
}
