//! Supervisor configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Name of the dependency manifest looked for at a deployment's root.
pub const MANIFEST_FILE: &str = "requirements.txt";

/// File inside each deployment directory that receives the script's output.
pub const OUTPUT_LOG_FILE: &str = ".scripthost-output.log";

/// Top-level supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Directory holding `<owner>/<deployment>` trees.
    pub root: PathBuf,
    /// JSON file the registry is persisted to; in-memory only when `None`.
    pub state_file: Option<PathBuf>,
    pub launcher: LauncherConfig,
    pub provisioner: ProvisionerConfig,
    pub extract: ExtractLimits,
    /// How long to wait for a killed process to be reaped.
    pub terminate_grace: Duration,
    /// Period of the liveness reconciliation pass; disabled when `None`.
    pub reconcile_interval: Option<Duration>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("deployed_scripts"),
            state_file: None,
            launcher: LauncherConfig::default(),
            provisioner: ProvisionerConfig::default(),
            extract: ExtractLimits::default(),
            terminate_grace: Duration::from_millis(5000),
            reconcile_interval: None,
        }
    }
}

/// How entry points are started.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Program the entry point is passed to.
    pub interpreter: String,
    /// Append stdout/stderr to [`OUTPUT_LOG_FILE`] instead of discarding it.
    pub capture_output: bool,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_owned(),
            capture_output: true,
        }
    }
}

/// Package installer invocation.
///
/// `{target}` and `{manifest}` in `args` are replaced with the deployment
/// directory and the manifest path.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_owned(),
            args: ["-m", "pip", "install", "--target", "{target}", "-r", "{manifest}"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Bounds applied while unpacking an archive.
#[derive(Debug, Clone, Copy)]
pub struct ExtractLimits {
    pub max_entries: usize,
    pub max_total_bytes: u64,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_total_bytes: 512 * 1024 * 1024,
        }
    }
}
