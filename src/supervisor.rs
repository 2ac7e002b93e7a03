//! Deploy, list and terminate operations over the registry.
//!
//! A deploy attempt moves through extraction, provisioning, launch and
//! registration. Whatever step fails, the attempt's directory is removed
//! and, once a process exists, that process is killed before the failure is
//! reported. Long-running steps never hold the registry lock.

use std::collections::HashMap;
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use crate::archive::{self, remove_tree};
use crate::config::SupervisorConfig;
use crate::error::{AbortReason, ExtractError, RegistryError, SupervisorError};
use crate::launcher::{self, Liveness};
use crate::notify::{LogNotifier, Notice, Notifier, StatusNotification};
use crate::provision::{provision, ProvisionOutcome};
use crate::registry::Registry;
use crate::secret::resolve_secret_var;
use crate::store::{JsonFileStore, MemoryStore, RegistryStore};
use crate::types::{
    Deployment, DeploymentId, DeploymentStatus, DeploymentSummary, EntryPoint, NewDeployment,
    OwnerId,
};

/// Suffixes tried after the archive-derived directory name is taken.
const MAX_NAME_ATTEMPTS: usize = 1000;
const MAX_STEM_LEN: usize = 64;

/// A complete request to deploy one archive.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub owner: OwnerId,
    pub archive: Vec<u8>,
    /// Upload file name, used to name the deployment directory.
    pub archive_name: Option<String>,
    pub entry_point: EntryPoint,
    /// Value injected into the script's secret variable.
    pub secret: Option<String>,
}

/// A registered, launched deployment.
#[derive(Debug, Clone, Serialize)]
pub struct Deployed {
    pub id: DeploymentId,
    pub pid: i32,
    pub secret_var: String,
    pub directory: PathBuf,
    pub top_level: Vec<String>,
    /// Non-fatal problems, such as a failed dependency install.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Removal {
    pub removed: bool,
}

pub struct Supervisor {
    config: SupervisorConfig,
    registry: Arc<Registry>,
    notifier: Arc<dyn Notifier>,
    /// Terminations are serialised per owner, so a freed directory name is
    /// never removed a second time after a new deploy has taken it.
    terminations: Mutex<HashMap<OwnerId, Arc<Mutex<()>>>>,
}

impl Supervisor {
    pub fn new(
        mut config: SupervisorConfig,
        registry: Arc<Registry>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        if config.root.is_relative() {
            if let Ok(cwd) = env::current_dir() {
                config.root = cwd.join(&config.root);
            }
        }
        Self {
            config,
            registry,
            notifier,
            terminations: Mutex::new(HashMap::new()),
        }
    }

    /// Build a supervisor whose registry persists to `config.state_file`,
    /// if one is set, and whose notices go to the log.
    pub fn open(config: SupervisorConfig) -> Result<Self, RegistryError> {
        let store: Arc<dyn RegistryStore> = match &config.state_file {
            Some(path) => Arc::new(JsonFileStore::new(path)),
            None => Arc::new(MemoryStore),
        };
        let registry = Arc::new(Registry::open(store)?);
        Ok(Self::new(config, registry, Arc::new(LogNotifier)))
    }

    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Unpack, provision, launch and register a script.
    #[instrument(skip_all, fields(owner = %request.owner, attempt = %uuid::Uuid::new_v4()))]
    pub async fn deploy(&self, request: DeployRequest) -> Result<Deployed, AbortReason> {
        let owner = request.owner.clone();
        let outcome = self.run_deploy(request).await;
        match &outcome {
            Ok(deployed) => {
                for message in &deployed.warnings {
                    self.notify(
                        &owner,
                        Notice::Warning {
                            message: message.clone(),
                        },
                    );
                }
                self.notify(
                    &owner,
                    Notice::Deployed {
                        deployment_id: deployed.id,
                        pid: deployed.pid,
                        secret_var: deployed.secret_var.clone(),
                    },
                );
            }
            Err(reason) => {
                warn!(kind = reason.kind(), %reason, "deploy aborted");
                self.notify(
                    &owner,
                    Notice::Aborted {
                        reason: reason.to_string(),
                    },
                );
            }
        }
        outcome
    }

    async fn run_deploy(&self, request: DeployRequest) -> Result<Deployed, AbortReason> {
        let DeployRequest {
            owner,
            archive,
            archive_name,
            entry_point,
            secret,
        } = request;

        let owner_dir = self.config.root.join(owner.as_str());
        let stem = directory_stem(archive_name.as_deref());
        let limits = self.config.extract;
        let (directory, top_level) = tokio::task::spawn_blocking(move || {
            stage_archive(&archive, &owner_dir, &stem, limits)
        })
        .await
        .map_err(|e| AbortReason::Io(e.to_string()))??;
        debug!(dir = %directory.display(), ?top_level, "extracted");

        let entry_path = entry_point.resolve(&directory);
        if !entry_path.is_file() {
            discard(&directory).await;
            return Err(AbortReason::EntryPointNotFound(entry_point.to_string()));
        }

        let mut warnings = Vec::new();
        match provision(&directory, &self.config.provisioner).await {
            Ok(ProvisionOutcome::Installed) => debug!("dependencies installed"),
            Ok(ProvisionOutcome::Skipped) => {}
            Err(e) => {
                warn!(error = %e, "continuing without dependencies");
                warnings.push(e.to_string());
            }
        }

        let secret_var = resolve_secret_var(&entry_path);
        let mut env_overrides = HashMap::new();
        if let Some(secret) = secret {
            env_overrides.insert(secret_var.clone(), secret);
        }

        let launcher_config = self.config.launcher.clone();
        let launch_dir = directory.clone();
        let launch_entry = entry_point.clone();
        let launched = tokio::task::spawn_blocking(move || {
            launcher::launch(&launcher_config, &launch_dir, &launch_entry, &env_overrides)
        })
        .await;
        let process = match launched {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                discard(&directory).await;
                return Err(AbortReason::LaunchFailed(e.to_string()));
            }
            Err(e) => {
                discard(&directory).await;
                return Err(AbortReason::LaunchFailed(e.to_string()));
            }
        };

        let new = NewDeployment {
            entry_point,
            directory: directory.clone(),
            secret_var: secret_var.clone(),
            process,
        };
        match self.registry.create(&owner, new).await {
            Ok(id) => {
                info!(deployment_id = %id, pid = process.pid, "deployment registered");
                Ok(Deployed {
                    id,
                    pid: process.pid,
                    secret_var,
                    directory,
                    top_level,
                    warnings,
                })
            }
            Err(e) => {
                // An untracked process must not outlive a failed registration.
                error!(error = %e, pid = process.pid, "registration failed, killing process");
                let grace = self.config.terminate_grace;
                match tokio::task::spawn_blocking(move || launcher::terminate(process, grace)).await
                {
                    Ok(Ok(_)) => {}
                    Ok(Err(kill_err)) => error!(error = %kill_err, "could not kill unregistered process"),
                    Err(join_err) => error!(error = %join_err, "kill task failed"),
                }
                discard(&directory).await;
                Err(AbortReason::RegistrationFailed(e.to_string()))
            }
        }
    }

    pub async fn list(&self, owner: &OwnerId) -> Vec<DeploymentSummary> {
        self.registry
            .list(owner)
            .await
            .iter()
            .map(DeploymentSummary::from)
            .collect()
    }

    pub async fn get(&self, owner: &OwnerId, id: DeploymentId) -> Option<Deployment> {
        self.registry.get(owner, id).await
    }

    /// Kill a deployment's process, delete its directory and forget it.
    ///
    /// An unknown id yields `removed: false`. A process or directory that is
    /// already gone does not stop the remaining steps.
    #[instrument(skip_all, fields(%owner, deployment_id = %id))]
    pub async fn terminate(
        &self,
        owner: &OwnerId,
        id: DeploymentId,
    ) -> Result<Removal, SupervisorError> {
        let lock = Arc::clone(
            self.terminations
                .lock()
                .await
                .entry(owner.clone())
                .or_default(),
        );
        let _serialised = lock.lock().await;

        let Some(deployment) = self.registry.get(owner, id).await else {
            debug!("nothing to remove");
            self.notify(
                owner,
                Notice::Terminated {
                    deployment_id: id,
                    removed: false,
                },
            );
            return Ok(Removal { removed: false });
        };

        let handle = deployment.process;
        let grace = self.config.terminate_grace;
        let killed = blocking(move || launcher::terminate(handle, grace)).await??;
        if !killed {
            debug!(pid = handle.pid, "process was already gone");
        }

        let directory = deployment.directory.clone();
        let cleanup_dir = directory.clone();
        if let Err(source) = blocking(move || remove_tree(&cleanup_dir)).await? {
            // Keep the record so the directory is not lost track of.
            if let Err(e) = self
                .registry
                .set_status_if(owner, id, DeploymentStatus::Exited, |d| {
                    d.is_same_launch(&deployment)
                })
                .await
            {
                warn!(error = %e, "could not mark deployment exited");
            }
            return Err(SupervisorError::Cleanup {
                path: directory,
                source,
            });
        }

        let removed = self
            .registry
            .delete_if(owner, id, |d| d.is_same_launch(&deployment))
            .await?;
        info!(removed, "deployment terminated");
        self.notify(
            owner,
            Notice::Terminated {
                deployment_id: id,
                removed,
            },
        );
        Ok(Removal { removed })
    }

    /// Last `max_bytes` of a deployment's captured output.
    pub async fn read_output(
        &self,
        owner: &OwnerId,
        id: DeploymentId,
        max_bytes: u64,
    ) -> Result<Vec<u8>, SupervisorError> {
        let deployment = self
            .registry
            .get(owner, id)
            .await
            .ok_or(SupervisorError::NotFound(id))?;
        let directory = deployment.directory;
        Ok(blocking(move || launcher::read_output_tail(&directory, max_bytes)).await??)
    }

    /// Mark running deployments whose process has disappeared as exited.
    ///
    /// Records and directories are left in place; only the status changes.
    pub async fn reconcile(&self) -> Vec<(OwnerId, DeploymentId)> {
        let running = self.registry.running().await;
        let gone = match blocking(move || {
            running
                .into_iter()
                .filter(|(_, d)| match launcher::probe(d.process) {
                    Liveness::Alive => false,
                    Liveness::Zombie => {
                        launcher::reap(d.process.pid);
                        true
                    }
                    Liveness::Gone | Liveness::Reused => true,
                })
                .collect::<Vec<_>>()
        })
        .await
        {
            Ok(gone) => gone,
            Err(e) => {
                error!(error = %e, "reconcile probe failed");
                return Vec::new();
            }
        };

        let mut marked = Vec::with_capacity(gone.len());
        for (owner, deployment) in gone {
            let id = deployment.id;
            match self
                .registry
                .set_status_if(&owner, id, DeploymentStatus::Exited, |d| {
                    d.is_same_launch(&deployment)
                })
                .await
            {
                Ok(true) => {
                    info!(%owner, deployment_id = %id, "process exited on its own");
                    marked.push((owner, id));
                }
                Ok(false) => {}
                Err(e) => warn!(%owner, deployment_id = %id, error = %e, "could not mark exited"),
            }
        }
        marked
    }

    /// Run [`Supervisor::reconcile`] periodically if an interval is configured.
    pub fn spawn_reconciler(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let period = self.config.reconcile_interval?;
        let supervisor = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                supervisor.reconcile().await;
            }
        }))
    }

    fn notify(&self, owner: &OwnerId, notice: Notice) {
        self.notifier.notify(StatusNotification {
            owner: owner.clone(),
            notice,
        });
    }
}

async fn blocking<T, F>(f: F) -> Result<T, SupervisorError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SupervisorError::Internal(e.to_string()))
}

async fn discard(directory: &Path) {
    let dir = directory.to_path_buf();
    match tokio::task::spawn_blocking(move || remove_tree(&dir)).await {
        Ok(Ok(_)) => debug!(dir = %directory.display(), "removed deployment directory"),
        Ok(Err(e)) => error!(dir = %directory.display(), error = %e, "failed to remove deployment directory"),
        Err(e) => error!(dir = %directory.display(), error = %e, "cleanup task failed"),
    }
}

/// Extract into the first free `<owner_dir>/<stem>[_N]`.
fn stage_archive(
    archive: &[u8],
    owner_dir: &Path,
    stem: &str,
    limits: crate::config::ExtractLimits,
) -> Result<(PathBuf, Vec<String>), ExtractError> {
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let candidate = if attempt == 0 {
            owner_dir.join(stem)
        } else {
            owner_dir.join(format!("{stem}_{attempt}"))
        };
        if candidate.exists() {
            continue;
        }
        match archive::extract(archive, &candidate, limits) {
            Ok(top_level) => return Ok((candidate, top_level)),
            // Lost a race with a concurrent deploy; try the next name.
            Err(ExtractError::TargetExists(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(ExtractError::Io(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free directory name for {stem:?}"),
    )))
}

/// Directory name derived from the uploaded file name.
fn directory_stem(archive_name: Option<&str>) -> String {
    let base = archive_name
        .map(|n| n.rsplit(['/', '\\']).next().unwrap_or(n))
        .map(|n| n.strip_suffix(".zip").unwrap_or(n))
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_STEM_LEN)
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "script".to_owned()
    } else {
        cleaned.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::build_zip;
    use crate::config::{LauncherConfig, ProvisionerConfig};
    use crate::notify::ChannelNotifier;
    use crate::store::Snapshot;
    use std::time::Duration;

    struct RejectingStore;

    impl RegistryStore for RejectingStore {
        fn load(&self) -> Result<Snapshot, RegistryError> {
            Ok(Snapshot::new())
        }

        fn save(&self, _snapshot: &Snapshot) -> Result<(), RegistryError> {
            Err(RegistryError::Persist("read-only filesystem".to_owned()))
        }
    }

    fn config(root: &Path) -> SupervisorConfig {
        SupervisorConfig {
            root: root.to_path_buf(),
            launcher: LauncherConfig {
                interpreter: "sh".to_owned(),
                capture_output: true,
            },
            provisioner: ProvisionerConfig {
                program: "true".to_owned(),
                args: Vec::new(),
                timeout: Duration::from_secs(5),
            },
            terminate_grace: Duration::from_secs(5),
            ..SupervisorConfig::default()
        }
    }

    #[test]
    fn stems_are_sanitised() {
        assert_eq!(directory_stem(Some("my bot.zip")), "my_bot");
        assert_eq!(directory_stem(Some("../../etc/passwd")), "passwd");
        assert_eq!(directory_stem(Some("C:\\Users\\me\\bot.zip")), "bot");
        assert_eq!(directory_stem(Some("...")), "script");
        assert_eq!(directory_stem(Some(".hidden.zip")), "hidden");
        assert_eq!(directory_stem(None), "script");
    }

    #[test]
    fn staging_picks_next_free_name() {
        let root = tempfile::tempdir().unwrap();
        let zip = build_zip(&[("main.py", "sleep 1")]);
        std::fs::create_dir_all(root.path().join("bot")).unwrap();
        std::fs::create_dir_all(root.path().join("bot_1")).unwrap();

        let (dir, top) =
            stage_archive(&zip, root.path(), "bot", Default::default()).unwrap();

        assert_eq!(dir, root.path().join("bot_2"));
        assert_eq!(top, vec!["main.py"]);
    }

    #[tokio::test]
    async fn failed_registration_kills_process_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::open(Arc::new(RejectingStore)).unwrap());
        let (notifier, mut rx) = ChannelNotifier::new();
        let supervisor = Supervisor::new(config(root.path()), registry, Arc::new(notifier));
        let owner = OwnerId::new("7").unwrap();

        let reason = supervisor
            .deploy(DeployRequest {
                owner: owner.clone(),
                archive: build_zip(&[("main.py", "echo $$ > pid.txt; sleep 30")]),
                archive_name: Some("bot.zip".to_owned()),
                entry_point: EntryPoint::new("main.py").unwrap(),
                secret: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(reason, AbortReason::RegistrationFailed(_)), "{reason:?}");
        assert!(!root.path().join("7").join("bot").exists());
        assert!(supervisor.list(&owner).await.is_empty());
        let notice = rx.recv().await.unwrap();
        assert!(matches!(notice.notice, Notice::Aborted { .. }));
    }

    #[tokio::test]
    async fn reconcile_marks_exited_processes() {
        let root = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(
            config(root.path()),
            Arc::new(Registry::in_memory()),
            Arc::new(LogNotifier),
        );
        let owner = OwnerId::new("7").unwrap();
        let quick = supervisor
            .deploy(DeployRequest {
                owner: owner.clone(),
                archive: build_zip(&[("main.py", "exit 0")]),
                archive_name: None,
                entry_point: EntryPoint::new("main.py").unwrap(),
                secret: None,
            })
            .await
            .unwrap();
        let slow = supervisor
            .deploy(DeployRequest {
                owner: owner.clone(),
                archive: build_zip(&[("main.py", "sleep 30")]),
                archive_name: None,
                entry_point: EntryPoint::new("main.py").unwrap(),
                secret: None,
            })
            .await
            .unwrap();

        let mut marked = Vec::new();
        for _ in 0..100 {
            marked.extend(supervisor.reconcile().await);
            if !marked.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(marked, vec![(owner.clone(), quick.id)]);
        let listed = supervisor.list(&owner).await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].status, DeploymentStatus::Exited);
        assert_eq!(listed[1].status, DeploymentStatus::Running);

        assert!(supervisor.terminate(&owner, quick.id).await.unwrap().removed);
        assert!(supervisor.terminate(&owner, slow.id).await.unwrap().removed);
    }
}
