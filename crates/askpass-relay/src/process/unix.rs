//! Unix process groups.
//!
//! The child becomes leader of its own session (through the `askpass-setsid`
//! trampoline) or at least of its own process group, so the whole tree can
//! be signalled with `killpg`. Termination is SIGTERM to the group, a grace
//! period, then SIGKILL passes until nothing is left.
//!
//! Liveness on Linux comes from `/proc`: a member is any non-zombie process
//! whose process group is the leader's pid. Zombies don't count, they hold
//! no resources beyond a pid and vanish when their parent reaps them. Other
//! Unixes fall back to probing the group with signal 0.
//!
//! Only the group is ever signalled, never the bare leader pid. Once the
//! leader is reaped its pid may be reused, but not while a group with that
//! id still has members, so `killpg` can't reach an unrelated process. A
//! root that hasn't reached `setsid` yet is outside the group; the caller
//! kills it through its [`Child`] handle.

use std::path::PathBuf;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    build_command, root_pid, spawn_failure, GroupControl, ProcessGroup, SpawnSpec,
    TerminateFuture, TerminationSettings,
};
use crate::error::RelayError;
use askpass_relay_core::RelayConfig;

/// How long each SIGKILL pass waits for the group to disappear.
const KILL_SETTLE: Duration = Duration::from_millis(250);

/// Process group controller for Unix.
#[derive(Debug, Clone)]
pub struct UnixGroupControl {
    setsid: Option<PathBuf>,
    settings: TerminationSettings,
}

impl UnixGroupControl {
    /// Create a controller.
    ///
    /// With `setsid` set, children are started through that trampoline and
    /// become session leaders; otherwise they only get a new process group.
    pub fn new(setsid: Option<PathBuf>, settings: TerminationSettings) -> Self {
        Self { setsid, settings }
    }

    /// Create a controller from the configuration.
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.setsid_path(), TerminationSettings::from_config(config))
    }

    async fn terminate(&self, group: ProcessGroup) -> Result<(), RelayError> {
        if !self.is_alive(group) {
            return Ok(());
        }

        debug!(group = %group, "Sending SIGTERM to process group");
        signal_group(group, Signal::SIGTERM);
        if self.wait_for_exit(group, self.settings.grace).await {
            debug!(group = %group, "Process group exited after SIGTERM");
            return Ok(());
        }

        for pass in 1..=self.settings.max_passes {
            warn!(group = %group, pass, "Process group still alive; sending SIGKILL");
            signal_group(group, Signal::SIGKILL);
            if self.wait_for_exit(group, KILL_SETTLE).await {
                return Ok(());
            }
        }

        let survivors = members(group).len().max(1);
        Err(RelayError::PartialTermination {
            group: group.id(),
            survivors,
        })
    }

    /// Poll until the group is empty or `within` has elapsed.
    async fn wait_for_exit(&self, group: ProcessGroup, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            if !self.is_alive(group) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.settings.poll).await;
        }
    }
}

impl GroupControl for UnixGroupControl {
    fn spawn_isolated(&self, spec: &SpawnSpec) -> Result<(Child, ProcessGroup), RelayError> {
        let mut command = build_command(spec, self.setsid.as_deref());
        if self.setsid.is_none() {
            command.process_group(0);
        }

        let child = command.spawn().map_err(|e| spawn_failure(spec, e))?;
        let pid = root_pid(spec, &child)?;
        debug!(
            pid,
            session = self.setsid.is_some(),
            "Spawned isolated process group"
        );
        Ok((child, ProcessGroup::new(pid)))
    }

    fn terminate_group(&self, group: ProcessGroup) -> TerminateFuture<'_> {
        Box::pin(self.terminate(group))
    }

    fn is_alive(&self, group: ProcessGroup) -> bool {
        !members(group).is_empty()
    }
}

/// Signal every member of the group.
fn signal_group(group: ProcessGroup, signal: Signal) {
    let pgid = Pid::from_raw(group.id() as i32);
    match killpg(pgid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(group = %group, error = %e, "killpg failed"),
    }
}

/// Live members of the group, the leader included.
#[cfg(target_os = "linux")]
fn members(group: ProcessGroup) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return probe_members(group);
    };

    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|&pid| {
            stat(pid).is_some_and(|stat| {
                !stat.is_zombie() && stat.pgrp == group.id()
            })
        })
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn members(group: ProcessGroup) -> Vec<u32> {
    probe_members(group)
}

/// Signal-0 probe. Can't enumerate, only tell whether anything is left.
fn probe_members(group: ProcessGroup) -> Vec<u32> {
    let pgid = Pid::from_raw(group.id() as i32);
    if killpg(pgid, None).is_ok() {
        vec![group.id()]
    } else {
        Vec::new()
    }
}

/// The fields of `/proc/<pid>/stat` liveness depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProcStat {
    pub state: char,
    pub pgrp: u32,
}

impl ProcStat {
    pub fn is_zombie(&self) -> bool {
        matches!(self.state, 'Z' | 'X')
    }

    /// Parse a stat line. The command name is parenthesized and may itself
    /// contain spaces and parentheses, so fields are taken after the last `)`.
    pub fn parse(line: &str) -> Option<Self> {
        let rest = &line[line.rfind(')')? + 1..];
        let mut fields = rest.split_whitespace();
        let state = fields.next()?.chars().next()?;
        let _ppid = fields.next()?;
        let pgrp = fields.next()?.parse().ok()?;
        Some(Self { state, pgrp })
    }
}

#[cfg(target_os = "linux")]
fn stat(pid: u32) -> Option<ProcStat> {
    let line = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    ProcStat::parse(&line)
}

/// Whether `pid` is a live (non-zombie) process.
#[cfg(all(test, target_os = "linux"))]
pub(crate) fn pid_alive(pid: u32) -> bool {
    stat(pid).is_some_and(|stat| !stat.is_zombie())
}

/// Whether `pid` is a live process.
#[cfg(all(test, not(target_os = "linux")))]
pub(crate) fn pid_alive(pid: u32) -> bool {
    nix::sys::signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}
