//! Deployment records and the identifiers that address them.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::InputError;

const MAX_OWNER_LEN: usize = 64;

/// Identity of the user a deployment belongs to.
///
/// Owner ids name a directory under the deployment root, so only a
/// conservative character set is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(raw: impl Into<String>) -> Result<Self, InputError> {
        let raw = raw.into();
        let valid = !raw.is_empty()
            && raw.len() <= MAX_OWNER_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if valid {
            Ok(Self(raw))
        } else {
            Err(InputError::InvalidOwner(raw))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OwnerId {
    type Error = InputError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<OwnerId> for String {
    fn from(value: OwnerId) -> Self {
        value.0
    }
}

impl FromStr for OwnerId {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-owner deployment number, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(u64);

impl DeploymentId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Script file to execute, relative to the deployment directory.
///
/// Only plain path components are allowed, so joining an entry point onto a
/// directory can never leave that directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntryPoint(String);

impl EntryPoint {
    pub fn new(raw: impl Into<String>) -> Result<Self, InputError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.contains('\\') || trimmed.contains('\0') {
            return Err(InputError::InvalidEntryPoint(raw));
        }
        let only_normal = Path::new(trimmed)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !only_normal {
            return Err(InputError::InvalidEntryPoint(raw));
        }
        Ok(Self(trimmed.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Absolute path of the entry point inside `directory`.
    #[must_use]
    pub fn resolve(&self, directory: &Path) -> PathBuf {
        directory.join(&self.0)
    }
}

impl TryFrom<String> for EntryPoint {
    type Error = InputError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntryPoint> for String {
    fn from(value: EntryPoint) -> Self {
        value.0
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// OS process launched for a deployment.
///
/// `start_time` is the kernel's start time for the pid (clock ticks since
/// boot), used to tell the launched process apart from a later process that
/// reuses the same pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub pid: i32,
    pub start_time: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Believed alive. Nothing watches the process, so this may be stale.
    Running,
    /// The process is known to be gone.
    Exited,
}

/// Everything the registry stores about one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub entry_point: EntryPoint,
    pub directory: PathBuf,
    pub secret_var: String,
    pub process: ProcessHandle,
    pub status: DeploymentStatus,
    pub created_at: u64,
}

impl Deployment {
    /// Whether `other` records the same launch. Ids are reused once freed, so
    /// the id alone does not identify a deployment over time.
    #[must_use]
    pub fn is_same_launch(&self, other: &Deployment) -> bool {
        self.process == other.process && self.directory == other.directory
    }
}

/// A launched deployment waiting for its id.
#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub entry_point: EntryPoint,
    pub directory: PathBuf,
    pub secret_var: String,
    pub process: ProcessHandle,
}

impl NewDeployment {
    pub(crate) fn into_deployment(self, id: DeploymentId) -> Deployment {
        Deployment {
            id,
            entry_point: self.entry_point,
            directory: self.directory,
            secret_var: self.secret_var,
            process: self.process,
            status: DeploymentStatus::Running,
            created_at: unix_now(),
        }
    }
}

/// What a listing shows for each deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentSummary {
    pub id: DeploymentId,
    pub entry_point: String,
    pub pid: i32,
    pub status: DeploymentStatus,
}

impl From<&Deployment> for DeploymentSummary {
    fn from(d: &Deployment) -> Self {
        Self {
            id: d.id,
            entry_point: d.entry_point.to_string(),
            pid: d.process.pid,
            status: d.status,
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
