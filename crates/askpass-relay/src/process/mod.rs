//! Process tree isolation and termination.
//!
//! A git command is never a single process: git forks ssh, ssh may fork a
//! proxy command, and credential helpers come and go. Killing only the
//! direct child leaves the rest running with the connection open. The
//! [`GroupControl`] trait captures the two things the spawner needs:
//! start a command so its whole tree is addressable as one
//! [`ProcessGroup`], and reliably end that tree.
//!
//! - Unix ([`unix::UnixGroupControl`]): new session/process group, signals
//!   sent to the group
//! - Windows ([`windows::WindowsGroupControl`]): new process group, tree
//!   enumerated from a toolhelp snapshot and terminated process by process

mod registry;
#[cfg(unix)]
pub mod unix;
#[cfg(windows)]
pub mod windows;

pub use registry::GroupRegistry;

use std::ffi::OsString;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use askpass_relay_core::RelayConfig;
use tokio::process::{Child, Command};

use crate::error::RelayError;

/// Controller for the current platform.
#[cfg(unix)]
pub type PlatformControl = unix::UnixGroupControl;
/// Controller for the current platform.
#[cfg(windows)]
pub type PlatformControl = windows::WindowsGroupControl;

/// Future returned by [`GroupControl::terminate_group`].
pub type TerminateFuture<'a> = Pin<Box<dyn Future<Output = Result<(), RelayError>> + Send + 'a>>;

/// A spawned process tree, identified by its root's pid.
///
/// On Unix the root is the group leader, so this is also the process group
/// id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessGroup(u32);

impl ProcessGroup {
    /// Wrap the pid of a tree's root process.
    pub fn new(root_pid: u32) -> Self {
        Self(root_pid)
    }

    /// Pid of the root process.
    pub fn id(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to run.
#[derive(Debug, Clone, Default)]
pub struct SpawnSpec {
    /// Program name or path, resolved through `PATH`.
    pub program: OsString,
    /// Arguments.
    pub args: Vec<OsString>,
    /// Working directory; inherited when unset.
    pub working_dir: Option<PathBuf>,
    /// Variables set on top of the inherited environment, applied in order.
    pub env: Vec<(OsString, OsString)>,
}

/// Tunables for terminating a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationSettings {
    /// Time between the graceful request and the first forced kill.
    pub grace: Duration,
    /// Interval between liveness checks.
    pub poll: Duration,
    /// Forced kill passes before giving up.
    pub max_passes: u32,
}

impl TerminationSettings {
    /// Read the settings from the configuration.
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            grace: config.grace_period(),
            poll: config.poll_interval(),
            max_passes: config.termination.max_passes,
        }
    }
}

impl Default for TerminationSettings {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

/// Platform capability to isolate and terminate process trees.
pub trait GroupControl: Send + Sync {
    /// Start `spec` as the root of a new, separately addressable tree.
    ///
    /// stdin is closed; stdout and stderr are piped.
    fn spawn_isolated(&self, spec: &SpawnSpec) -> Result<(Child, ProcessGroup), RelayError>;

    /// End every process of the tree.
    ///
    /// Succeeds once nothing of the tree is left alive, fails with
    /// [`RelayError::PartialTermination`] if something survives all passes.
    /// Terminating an already empty tree is a no-op.
    fn terminate_group(&self, group: ProcessGroup) -> TerminateFuture<'_>;

    /// Whether any process of the tree is still alive.
    fn is_alive(&self, group: ProcessGroup) -> bool;
}

/// Build the command for `spec`, optionally run through a trampoline that
/// receives the program and its arguments as its own arguments.
fn build_command(spec: &SpawnSpec, trampoline: Option<&Path>) -> Command {
    let mut command = match trampoline {
        Some(helper) => {
            let mut command = Command::new(helper);
            command.arg(&spec.program);
            command
        }
        None => Command::new(&spec.program),
    };

    command
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &spec.working_dir {
        command.current_dir(dir);
    }
    command
}

/// Map a spawn failure to the error reported for `spec`.
fn spawn_failure(spec: &SpawnSpec, source: std::io::Error) -> RelayError {
    RelayError::ProcessSpawnFailure {
        program: spec.program.to_string_lossy().into_owned(),
        source,
    }
}

/// Pid of a freshly spawned child.
fn root_pid(spec: &SpawnSpec, child: &Child) -> Result<u32, RelayError> {
    child.id().ok_or_else(|| {
        spawn_failure(
            spec,
            std::io::Error::other("child exited before its pid was known"),
        )
    })
}
