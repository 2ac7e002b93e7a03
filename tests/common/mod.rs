//! Common test utilities for supervisor integration tests.
#![allow(dead_code)]

use scripthost::config::{LauncherConfig, ProvisionerConfig};
use scripthost::notify::{ChannelNotifier, StatusNotification};
use scripthost::registry::Registry;
use scripthost::store::JsonFileStore;
use scripthost::{
    AbortReason, DeployRequest, Deployed, EntryPoint, OwnerId, Supervisor, SupervisorConfig,
};
use std::future::Future;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use zip::write::SimpleFileOptions;

/// Build an in-memory zip. Names ending in `/` become directories.
pub fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in entries {
        if name.ends_with('/') {
            writer
                .add_directory(*name, SimpleFileOptions::default())
                .unwrap();
        } else {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
    }
    writer.finish().unwrap().into_inner()
}

/// Configuration that runs entry points with `sh` and installs nothing.
pub fn sh_config(root: &Path) -> SupervisorConfig {
    SupervisorConfig {
        root: root.to_path_buf(),
        launcher: LauncherConfig {
            interpreter: "sh".to_string(),
            capture_output: true,
        },
        provisioner: ProvisionerConfig {
            program: "true".to_string(),
            args: Vec::new(),
            timeout: Duration::from_secs(10),
        },
        terminate_grace: Duration::from_secs(5),
        ..SupervisorConfig::default()
    }
}

pub fn owner(raw: &str) -> OwnerId {
    OwnerId::new(raw).unwrap()
}

/// Supervisor over a scratch root, with notices captured on a channel.
pub struct TestHost {
    pub dir: TempDir,
    pub supervisor: Arc<Supervisor>,
    pub notices: UnboundedReceiver<StatusNotification>,
}

impl TestHost {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Creates a host after letting `tweak` adjust the default test config.
    pub fn with_config(tweak: impl FnOnce(&mut SupervisorConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sh_config(&dir.path().join("scripts"));
        tweak(&mut config);

        let registry = match &config.state_file {
            Some(path) => Registry::open(Arc::new(JsonFileStore::new(path))).unwrap(),
            None => Registry::in_memory(),
        };
        let (notifier, notices) = ChannelNotifier::new();
        let supervisor = Arc::new(Supervisor::new(
            config,
            Arc::new(registry),
            Arc::new(notifier),
        ));

        Self {
            dir,
            supervisor,
            notices,
        }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("scripts")
    }

    pub async fn deploy(
        &self,
        owner_id: &str,
        files: &[(&str, &str)],
        entry_point: &str,
        secret: Option<&str>,
    ) -> Result<Deployed, AbortReason> {
        self.supervisor
            .deploy(DeployRequest {
                owner: owner(owner_id),
                archive: build_zip(files),
                archive_name: Some("bot.zip".to_string()),
                entry_point: EntryPoint::new(entry_point).unwrap(),
                secret: secret.map(str::to_string),
            })
            .await
    }

    /// Notices received so far.
    pub fn drain_notices(&mut self) -> Vec<StatusNotification> {
        let mut out = Vec::new();
        while let Ok(n) = self.notices.try_recv() {
            out.push(n);
        }
        out
    }
}

impl Default for TestHost {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `check` until it returns true or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
