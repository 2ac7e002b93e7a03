//! Starting, probing and killing detached script processes.
//!
//! Scripts run in their own session so signals aimed at the supervisor
//! never reach them and vice versa. The supervisor does not wait on them;
//! an exited script stays a zombie until it is terminated or reconciled.

use std::collections::HashMap;
use std::env;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::config::{LauncherConfig, OUTPUT_LOG_FILE};
use crate::error::{LaunchError, ProcessError};
use crate::types::{EntryPoint, ProcessHandle};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// What `/proc` says about a tracked pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// Exited but not yet reaped.
    Zombie,
    Gone,
    /// The pid now belongs to a different process.
    Reused,
}

/// Dependencies are installed into the deployment root, which the
/// interpreter does not search when the entry point sits in a subdirectory.
const IMPORT_PATH_VAR: &str = "PYTHONPATH";

/// `directory` followed by any inherited import path.
fn import_path(directory: &Path) -> OsString {
    let inherited = env::var_os(IMPORT_PATH_VAR);
    let paths = std::iter::once(directory.to_path_buf()).chain(
        inherited
            .iter()
            .flat_map(|raw| env::split_paths(raw))
            .filter(|p| !p.as_os_str().is_empty()),
    );
    env::join_paths(paths).unwrap_or_else(|_| directory.as_os_str().to_owned())
}

struct ProcStat {
    state: char,
    start_time: u64,
}

fn read_stat(pid: i32) -> Option<ProcStat> {
    if pid <= 0 {
        return None;
    }
    let raw = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm may contain spaces and parentheses; fields resume after the last ')'.
    let rest = &raw[raw.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let start_time = fields.nth(18)?.parse().ok()?;
    Some(ProcStat { state, start_time })
}

/// Start `entry_point` inside `directory` as a detached process.
///
/// The child inherits the supervisor's environment with the deployment root
/// prepended to `PYTHONPATH`, and `env` layered on top. Returns as soon as
/// the process exists.
pub fn launch(
    config: &LauncherConfig,
    directory: &Path,
    entry_point: &EntryPoint,
    env: &HashMap<String, String>,
) -> Result<ProcessHandle, LaunchError> {
    let launch_error = |source: io::Error| LaunchError {
        program: config.interpreter.clone(),
        source,
    };

    let (stdout, stderr) = if config.capture_output {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(directory.join(OUTPUT_LOG_FILE))
            .map_err(launch_error)?;
        let log_err = log.try_clone().map_err(launch_error)?;
        (Stdio::from(log), Stdio::from(log_err))
    } else {
        (Stdio::null(), Stdio::null())
    };

    let mut cmd = Command::new(&config.interpreter);
    cmd.arg(entry_point.as_str())
        .current_dir(directory)
        .env(IMPORT_PATH_VAR, import_path(directory))
        .envs(env)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr);

    // SAFETY: setsid is async-signal-safe and touches no shared state.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(launch_error)?;
    let pid = i32::try_from(child.id()).map_err(|_| {
        launch_error(io::Error::new(io::ErrorKind::Other, "pid out of range"))
    })?;
    // std's Child neither kills nor waits on drop.
    drop(child);

    let start_time = read_stat(pid).map(|s| s.start_time);
    info!(pid, entry_point = %entry_point, dir = %directory.display(), "script launched");
    Ok(ProcessHandle { pid, start_time })
}

/// Check the process behind `handle` without signalling it.
#[must_use]
pub fn probe(handle: ProcessHandle) -> Liveness {
    let Some(stat) = read_stat(handle.pid) else {
        return Liveness::Gone;
    };
    if let Some(expected) = handle.start_time {
        if expected != stat.start_time {
            return Liveness::Reused;
        }
    }
    match stat.state {
        'Z' | 'X' => Liveness::Zombie,
        _ => Liveness::Alive,
    }
}

#[must_use]
pub fn is_alive(handle: ProcessHandle) -> bool {
    probe(handle) == Liveness::Alive
}

/// Collect the exit status of `pid` if it is our exited child.
pub fn reap(pid: i32) -> bool {
    matches!(
        waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)),
        Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..))
    )
}

/// SIGKILL the process (and its process group) and wait until it is gone.
///
/// Returns `Ok(false)` when there was nothing to kill: the process already
/// exited, or its pid now belongs to an unrelated process, which is left
/// alone.
pub fn terminate(handle: ProcessHandle, grace: Duration) -> Result<bool, ProcessError> {
    let pid = handle.pid;
    match probe(handle) {
        Liveness::Alive => {}
        Liveness::Reused => {
            warn!(pid, "pid was reused by another process, not signalling");
            return Ok(false);
        }
        Liveness::Zombie | Liveness::Gone => {
            // Reap only after the sweep so the group id stays reserved.
            kill_leftover_group(pid);
            reap(pid);
            debug!(pid, "process already exited");
            return Ok(false);
        }
    }

    let target = Pid::from_raw(pid);
    if killpg(target, Signal::SIGKILL).is_err() {
        match kill(target, Signal::SIGKILL) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                reap(pid);
                return Ok(false);
            }
            Err(e) => {
                return Err(ProcessError::Signal {
                    pid,
                    reason: e.to_string(),
                })
            }
        }
    }

    let deadline = Instant::now() + grace;
    loop {
        match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => {}
            Ok(_) => break,
            // Not our child (for example after a supervisor restart).
            Err(_) => {
                if probe(handle) != Liveness::Alive {
                    break;
                }
            }
        }
        if Instant::now() >= deadline {
            return Err(ProcessError::TerminateTimeout { pid, grace });
        }
        thread::sleep(POLL_INTERVAL);
    }

    info!(pid, "script killed");
    Ok(true)
}

/// SIGKILL whatever is left in the group of an exited session leader.
///
/// Background children of a script share its process group and outlive it.
/// The group id cannot be handed to a new process while any member remains.
fn kill_leftover_group(pid: i32) {
    if pid <= 0 {
        return;
    }
    match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) => debug!(pid, "signalled leftover process group"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "could not signal leftover process group"),
    }
}

/// Last `max_bytes` of the captured output in `directory`.
pub fn read_output_tail(directory: &Path, max_bytes: u64) -> io::Result<Vec<u8>> {
    let mut file = match fs::File::open(directory.join(OUTPUT_LOG_FILE)) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(max_bytes)))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}
