//! Error types for the script supervisor.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::DeploymentId;

/// Errors from unpacking a submitted archive.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// The bytes are not a usable zip archive.
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    /// An entry would be written outside the target directory.
    #[error("archive entry escapes the deployment directory: {0}")]
    PathEscape(String),

    /// The target directory already exists.
    #[error("target directory already exists: {}", .0.display())]
    TargetExists(PathBuf),

    /// Filesystem failure while writing entries.
    #[error("extraction I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<zip::result::ZipError> for ExtractError {
    fn from(e: zip::result::ZipError) -> Self {
        match e {
            zip::result::ZipError::Io(io) => Self::Io(io),
            other => Self::InvalidArchive(other.to_string()),
        }
    }
}

/// Errors from installing a dependency manifest.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The installer ran but exited unsuccessfully, or could not be started.
    #[error("dependency install failed: {diagnostics}")]
    DependencyInstallFailed {
        /// Exit code, when the installer ran to completion.
        exit_code: Option<i32>,
        /// Captured installer output.
        diagnostics: String,
    },

    /// The installer did not finish within the configured limit.
    #[error("dependency install timed out after {}s", limit.as_secs())]
    Timeout {
        /// The configured limit.
        limit: Duration,
    },
}

/// The entry point could not be started.
#[derive(Debug, thiserror::Error)]
#[error("failed to launch {program}: {source}")]
pub struct LaunchError {
    pub program: String,
    #[source]
    pub source: io::Error,
}

/// Errors while signalling or reaping a tracked process.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("process {pid} still running {}ms after SIGKILL", grace.as_millis())]
    TerminateTimeout { pid: i32, grace: Duration },

    #[error("failed to signal process {pid}: {reason}")]
    Signal { pid: i32, reason: String },
}

/// Errors from the deployment registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The backing store could not persist the change.
    #[error("failed to persist registry: {0}")]
    Persist(String),

    /// Every id in the owner's namespace is taken.
    #[error("no free deployment id for owner {0}")]
    IdsExhausted(String),
}

/// Invalid owner identifier or entry point supplied by a caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("owner id must be 1-64 characters of [A-Za-z0-9_-], got {0:?}")]
    InvalidOwner(String),

    #[error("entry point must be a relative path inside the archive, got {0:?}")]
    InvalidEntryPoint(String),
}

/// Errors from the multi-turn deploy session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no deploy session in progress")]
    NoSession,

    #[error("expected {expected}, got {got}")]
    UnexpectedInput {
        expected: &'static str,
        got: &'static str,
    },

    #[error(transparent)]
    InvalidInput(#[from] InputError),
}

/// Errors surfaced by supervisor operations other than deploy.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("deployment {0} not found")]
    NotFound(DeploymentId),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to remove {}: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read output: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Why a deploy attempt ended without a registered deployment.
///
/// In every case the deployment directory, if it was created, has been
/// removed before the reason is reported.
#[derive(Debug, thiserror::Error)]
pub enum AbortReason {
    #[error(transparent)]
    InvalidInput(#[from] InputError),

    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    #[error("archive entry escapes the deployment directory: {0}")]
    PathEscape(String),

    #[error("entry point {0:?} not found in the archive")]
    EntryPointNotFound(String),

    #[error("launch failed: {0}")]
    LaunchFailed(String),

    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl AbortReason {
    /// Short machine-readable name for the reason.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(InputError::InvalidOwner(_)) => "invalid_owner",
            Self::InvalidInput(InputError::InvalidEntryPoint(_)) => "invalid_entry_point",
            Self::InvalidArchive(_) => "invalid_archive",
            Self::PathEscape(_) => "path_escape",
            Self::EntryPointNotFound(_) => "entry_point_not_found",
            Self::LaunchFailed(_) => "launch_failed",
            Self::RegistrationFailed(_) => "registration_failed",
            Self::Io(_) => "io",
        }
    }
}

impl From<ExtractError> for AbortReason {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::InvalidArchive(msg) => Self::InvalidArchive(msg),
            ExtractError::PathEscape(entry) => Self::PathEscape(entry),
            other => Self::Io(other.to_string()),
        }
    }
}
