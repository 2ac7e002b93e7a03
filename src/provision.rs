//! Dependency installation for a deployment directory.

use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::config::{ProvisionerConfig, MANIFEST_FILE};
use crate::error::ProvisionError;

/// Longest installer output kept for diagnostics.
const MAX_DIAGNOSTICS: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// No manifest at the deployment root.
    Skipped,
    /// The installer exited successfully.
    Installed,
}

/// Install the deployment's manifest, if it has one, into the deployment
/// directory itself.
///
/// Nothing is installed into the host's global environment, and two
/// deployments never share an install target.
#[instrument(skip(config), fields(dir = %directory.display()))]
pub async fn provision(
    directory: &Path,
    config: &ProvisionerConfig,
) -> Result<ProvisionOutcome, ProvisionError> {
    let manifest = directory.join(MANIFEST_FILE);
    if !manifest.is_file() {
        debug!("no manifest, nothing to install");
        return Ok(ProvisionOutcome::Skipped);
    }

    let target = directory.to_string_lossy();
    let manifest_arg = manifest.to_string_lossy();
    let args: Vec<String> = config
        .args
        .iter()
        .map(|a| a.replace("{target}", &target).replace("{manifest}", &manifest_arg))
        .collect();

    info!(program = %config.program, ?args, "installing dependencies");
    let start = Instant::now();

    let child = Command::new(&config.program)
        .args(&args)
        .current_dir(directory)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ProvisionError::DependencyInstallFailed {
            exit_code: None,
            diagnostics: format!("failed to spawn {}: {e}", config.program),
        })?;

    // Dropping the wait future on timeout drops the child, which kills it.
    let output = match timeout(config.timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(ProvisionError::DependencyInstallFailed {
                exit_code: None,
                diagnostics: format!("installer process error: {e}"),
            });
        }
        Err(_) => {
            warn!(limit_secs = config.timeout.as_secs(), "dependency install timed out");
            return Err(ProvisionError::Timeout {
                limit: config.timeout,
            });
        }
    };

    if !output.status.success() {
        let mut diagnostics = String::from_utf8_lossy(&output.stderr).into_owned();
        if diagnostics.trim().is_empty() {
            diagnostics = String::from_utf8_lossy(&output.stdout).into_owned();
        }
        return Err(ProvisionError::DependencyInstallFailed {
            exit_code: output.status.code(),
            diagnostics: tail(&diagnostics, MAX_DIAGNOSTICS),
        });
    }

    info!(
        duration_secs = start.elapsed().as_secs_f32(),
        "dependencies installed"
    );
    Ok(ProvisionOutcome::Installed)
}

fn tail(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.len() <= max {
        return text.to_owned();
    }
    let mut cut = text.len() - max;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text[cut..].to_owned()
}
