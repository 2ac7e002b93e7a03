//! Owner-scoped deployment registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::error::RegistryError;
use crate::store::{MemoryStore, RegistryStore, Snapshot};
use crate::types::{Deployment, DeploymentId, DeploymentStatus, NewDeployment, OwnerId};

/// Authoritative map of (owner, id) to deployment.
///
/// All state sits behind one lock. Every mutation is persisted while the
/// write lock is held, so the store always sees mutations in order. The save
/// itself runs on the blocking pool.
pub struct Registry {
    owners: RwLock<Snapshot>,
    store: Arc<dyn RegistryStore>,
}

impl Registry {
    /// Open a registry, loading whatever `store` last saved.
    pub fn open(store: Arc<dyn RegistryStore>) -> Result<Self, RegistryError> {
        let owners = store.load()?;
        Ok(Self {
            owners: RwLock::new(owners),
            store,
        })
    }

    /// Registry without persistence.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            owners: RwLock::new(Snapshot::new()),
            store: Arc::new(MemoryStore),
        }
    }

    /// Assign the smallest free id in `owner`'s namespace and record the
    /// deployment under it.
    ///
    /// If the store fails to persist, the insert is undone.
    pub async fn create(
        &self,
        owner: &OwnerId,
        new: NewDeployment,
    ) -> Result<DeploymentId, RegistryError> {
        let mut owners = self.owners.write().await;
        let deployments = owners.entry(owner.clone()).or_default();
        let id = next_free_id(deployments)
            .ok_or_else(|| RegistryError::IdsExhausted(owner.to_string()))?;
        deployments.insert(id, new.into_deployment(id));

        if let Err(e) = self.persist(&owners).await {
            error!(%owner, deployment_id = %id, error = %e, "rolling back registry insert");
            if let Some(deployments) = owners.get_mut(owner) {
                deployments.remove(&id);
                if deployments.is_empty() {
                    owners.remove(owner);
                }
            }
            return Err(e);
        }

        debug!(%owner, deployment_id = %id, "deployment registered");
        Ok(id)
    }

    /// The owner's deployments in id order.
    pub async fn list(&self, owner: &OwnerId) -> Vec<Deployment> {
        self.owners
            .read()
            .await
            .get(owner)
            .map(|d| d.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn get(&self, owner: &OwnerId, id: DeploymentId) -> Option<Deployment> {
        self.owners
            .read()
            .await
            .get(owner)
            .and_then(|d| d.get(&id))
            .cloned()
    }

    /// Remove a deployment. `Ok(false)` if it was not there.
    pub async fn delete(&self, owner: &OwnerId, id: DeploymentId) -> Result<bool, RegistryError> {
        self.delete_if(owner, id, |_| true).await
    }

    /// Remove a deployment only if `matches` accepts the record currently
    /// stored under `id`. Ids are reused, so callers that looked a record up
    /// earlier pass a check that it is still the same deployment.
    pub async fn delete_if(
        &self,
        owner: &OwnerId,
        id: DeploymentId,
        matches: impl FnOnce(&Deployment) -> bool,
    ) -> Result<bool, RegistryError> {
        let mut owners = self.owners.write().await;
        let Some(deployments) = owners.get_mut(owner) else {
            return Ok(false);
        };
        if !deployments.get(&id).is_some_and(matches) {
            return Ok(false);
        }
        let Some(removed) = deployments.remove(&id) else {
            return Ok(false);
        };
        if deployments.is_empty() {
            owners.remove(owner);
        }

        if let Err(e) = self.persist(&owners).await {
            error!(%owner, deployment_id = %id, error = %e, "restoring deleted registry entry");
            owners.entry(owner.clone()).or_default().insert(id, removed);
            return Err(e);
        }

        debug!(%owner, deployment_id = %id, "deployment removed from registry");
        Ok(true)
    }

    /// Update a deployment's status. `Ok(false)` if it was not there.
    pub async fn set_status(
        &self,
        owner: &OwnerId,
        id: DeploymentId,
        status: DeploymentStatus,
    ) -> Result<bool, RegistryError> {
        self.set_status_if(owner, id, status, |_| true).await
    }

    /// Like [`Registry::set_status`], but only if `matches` accepts the
    /// record currently stored under `id`.
    pub async fn set_status_if(
        &self,
        owner: &OwnerId,
        id: DeploymentId,
        status: DeploymentStatus,
        matches: impl FnOnce(&Deployment) -> bool,
    ) -> Result<bool, RegistryError> {
        let mut owners = self.owners.write().await;
        let Some(deployment) = owners
            .get_mut(owner)
            .and_then(|d| d.get_mut(&id))
            .filter(|d| matches(&**d))
        else {
            return Ok(false);
        };
        let previous = deployment.status;
        if previous == status {
            return Ok(true);
        }
        deployment.status = status;

        if let Err(e) = self.persist(&owners).await {
            if let Some(deployment) = owners.get_mut(owner).and_then(|d| d.get_mut(&id)) {
                deployment.status = previous;
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Every deployment still marked running, across all owners.
    pub async fn running(&self) -> Vec<(OwnerId, Deployment)> {
        self.owners
            .read()
            .await
            .iter()
            .flat_map(|(owner, deployments)| {
                deployments
                    .values()
                    .filter(|d| d.status == DeploymentStatus::Running)
                    .map(move |d| (owner.clone(), d.clone()))
            })
            .collect()
    }

    async fn persist(&self, snapshot: &Snapshot) -> Result<(), RegistryError> {
        let store = Arc::clone(&self.store);
        let snapshot = snapshot.clone();
        tokio::task::spawn_blocking(move || store.save(&snapshot))
            .await
            .map_err(|e| RegistryError::Persist(format!("save task failed: {e}")))?
    }
}

fn next_free_id(existing: &BTreeMap<DeploymentId, Deployment>) -> Option<DeploymentId> {
    let mut candidate: u64 = 1;
    for id in existing.keys() {
        match id.get().cmp(&candidate) {
            std::cmp::Ordering::Less => {}
            std::cmp::Ordering::Equal => candidate = candidate.checked_add(1)?,
            std::cmp::Ordering::Greater => break,
        }
    }
    Some(DeploymentId::new(candidate))
}
