//! Registry persistence backends.
//!
//! The registry hands the full snapshot to its store after every mutation.
//! [`MemoryStore`] keeps nothing; [`JsonFileStore`] writes a keyed JSON
//! document so a restarted supervisor can at least show what it launched.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::RegistryError;
use crate::types::{Deployment, DeploymentId, OwnerId};

/// Every owner's deployments, keyed by id.
pub type Snapshot = BTreeMap<OwnerId, BTreeMap<DeploymentId, Deployment>>;

/// Backend for persisting the registry.
pub trait RegistryStore: Send + Sync {
    /// Load the last saved snapshot; an absent snapshot is empty.
    fn load(&self) -> Result<Snapshot, RegistryError>;

    /// Replace the saved snapshot.
    fn save(&self, snapshot: &Snapshot) -> Result<(), RegistryError>;
}

/// Store that forgets everything when the process exits.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryStore;

impl RegistryStore for MemoryStore {
    fn load(&self) -> Result<Snapshot, RegistryError> {
        Ok(Snapshot::new())
    }

    fn save(&self, _snapshot: &Snapshot) -> Result<(), RegistryError> {
        Ok(())
    }
}

/// Store backed by a JSON document of the form
/// `{"<owner>": {"<id>": {entry_point, process, directory, ...}}}`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sidecar(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }
}

impl RegistryStore for JsonFileStore {
    fn load(&self) -> Result<Snapshot, RegistryError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Snapshot::new()),
            Err(e) => return Err(RegistryError::Persist(format!("read {}: {e}", self.path.display()))),
        };

        match serde_json::from_slice::<Snapshot>(&raw) {
            Ok(mut snapshot) => {
                // The map key is authoritative for the id.
                for deployments in snapshot.values_mut() {
                    for (id, deployment) in deployments.iter_mut() {
                        deployment.id = *id;
                    }
                }
                snapshot.retain(|_, deployments| !deployments.is_empty());
                debug!(path = %self.path.display(), owners = snapshot.len(), "registry loaded");
                Ok(snapshot)
            }
            Err(e) => {
                let aside = self.sidecar(".corrupt");
                warn!(
                    path = %self.path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "registry file is unreadable, starting empty"
                );
                fs::rename(&self.path, &aside)
                    .map_err(|e| RegistryError::Persist(format!("move aside: {e}")))?;
                Ok(Snapshot::new())
            }
        }
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), RegistryError> {
        let persist = |e: &dyn std::fmt::Display| {
            RegistryError::Persist(format!("{}: {e}", self.path.display()))
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| persist(&e))?;
        }
        let body = serde_json::to_vec_pretty(snapshot).map_err(|e| persist(&e))?;
        let tmp = self.sidecar(".tmp");
        fs::write(&tmp, body).map_err(|e| persist(&e))?;
        fs::rename(&tmp, &self.path).map_err(|e| persist(&e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeploymentStatus, EntryPoint, ProcessHandle};

    fn deployment(id: u64, entry: &str) -> Deployment {
        Deployment {
            id: DeploymentId::new(id),
            entry_point: EntryPoint::new(entry).unwrap(),
            directory: PathBuf::from(format!("/srv/scripts/42/bot_{id}")),
            secret_var: "BOT_TOKEN".to_owned(),
            process: ProcessHandle {
                pid: 4000 + i32::try_from(id).unwrap(),
                start_time: Some(123_456),
            },
            status: DeploymentStatus::Running,
            created_at: 1_700_000_000,
        }
    }

    fn sample() -> Snapshot {
        let mut snapshot = Snapshot::new();
        let alice = OwnerId::new("42").unwrap();
        let bob = OwnerId::new("bob").unwrap();
        snapshot.entry(alice.clone()).or_default().insert(DeploymentId::new(1), deployment(1, "main.py"));
        snapshot.entry(alice).or_default().insert(DeploymentId::new(3), deployment(3, "src/bot.py"));
        snapshot.entry(bob).or_default().insert(DeploymentId::new(1), deployment(1, "run.py"));
        snapshot
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn repeated_save_load_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("state.json"));
        let original = sample();

        store.save(&original).unwrap();
        let first = store.load().unwrap();
        store.save(&first).unwrap();
        let second = store.load().unwrap();

        assert_eq!(first, original);
        assert_eq!(second, original);
    }

    #[test]
    fn document_is_keyed_by_owner_then_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state.json"));
        store.save(&sample()).unwrap();

        let doc: serde_json::Value =
            serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();

        assert_eq!(doc["42"]["3"]["entry_point"], "src/bot.py");
        assert_eq!(doc["bob"]["1"]["process"]["pid"], 4001);
        assert_eq!(doc["42"]["1"]["directory"], "/srv/scripts/42/bot_1");
    }

    #[test]
    fn corrupt_file_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        let store = JsonFileStore::new(&path);

        assert!(store.load().unwrap().is_empty());
        assert!(!path.exists());
        assert!(dir.path().join("state.json.corrupt").exists());
    }
}
