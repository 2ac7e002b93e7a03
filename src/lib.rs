//! scripthost - run user-submitted script archives as detached, supervised
//! background processes.
//!
//! A deploy unpacks a zip archive into a private directory, installs its
//! `requirements.txt` if there is one, launches the entry point in its own
//! session and records it in a per-owner registry. Terminating a deployment
//! kills the process and removes the directory and the record.

#[cfg(not(target_os = "linux"))]
compile_error!("This program only works on Linux.");

pub mod archive;
pub mod config;
pub mod error;
pub mod http_server;
pub mod launcher;
pub mod notify;
pub mod provision;
pub mod registry;
pub mod secret;
pub mod session;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod types;

pub use config::SupervisorConfig;
pub use error::{AbortReason, SupervisorError};
pub use registry::Registry;
pub use supervisor::{DeployRequest, Deployed, Removal, Supervisor};
pub use types::{Deployment, DeploymentId, DeploymentStatus, DeploymentSummary, EntryPoint, OwnerId};
