//! Windows process trees.
//!
//! Windows has no process groups that can be signalled as a whole, and no
//! graceful counterpart to SIGTERM for console-less children. The tree is
//! rebuilt from a toolhelp snapshot by following parent pids from the root,
//! then every member is terminated. Parents are terminated before their
//! children so nothing forks replacements mid-pass; re-scans catch anything
//! started in between.
//!
//! Pids and parent links outlive the processes they name, so every link is
//! checked against creation times: a child is never older than its parent,
//! and a pid that now belongs to a newer process only keeps the children
//! created before that process started.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

use askpass_relay_core::RelayConfig;
use tokio::process::Child;
use tracing::{debug, warn};
use windows::Win32::Foundation::{CloseHandle, BOOL, FILETIME, HANDLE};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
    TH32CS_SNAPPROCESS,
};
use windows::Win32::System::Threading::{
    GetProcessTimes, OpenProcess, TerminateProcess, PROCESS_ACCESS_RIGHTS,
    PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_TERMINATE,
};

use super::{
    build_command, root_pid, spawn_failure, GroupControl, ProcessGroup, SpawnSpec,
    TerminateFuture, TerminationSettings,
};
use crate::error::RelayError;

const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Exit code given to terminated processes.
const TERMINATED_EXIT_CODE: u32 = 1;

/// A tree member: pid and creation time (FILETIME ticks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Member {
    pid: u32,
    created: u64,
}

/// Process tree controller for Windows.
#[derive(Debug)]
pub struct WindowsGroupControl {
    settings: TerminationSettings,
    /// Creation time of every root whose tree may still be alive.
    roots: Mutex<HashMap<u32, u64>>,
}

impl WindowsGroupControl {
    /// Create a controller.
    pub fn new(settings: TerminationSettings) -> Self {
        Self {
            settings,
            roots: Mutex::new(HashMap::new()),
        }
    }

    /// Create a controller from the configuration.
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(TerminationSettings::from_config(config))
    }

    fn roots(&self) -> MutexGuard<'_, HashMap<u32, u64>> {
        self.roots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current members of the tree. An empty tree stays empty, so its root
    /// is forgotten.
    fn tree(&self, group: ProcessGroup) -> Result<Vec<Member>, RelayError> {
        let Some(root_created) = self.roots().get(&group.id()).copied() else {
            return Ok(Vec::new());
        };

        let tree = descendants(
            Member {
                pid: group.id(),
                created: root_created,
            },
            &snapshot()?,
            process_created,
        );
        if tree.is_empty() {
            self.roots().remove(&group.id());
        }
        Ok(tree)
    }

    async fn terminate(&self, group: ProcessGroup) -> Result<(), RelayError> {
        for pass in 1..=self.settings.max_passes {
            let tree = self.tree(group)?;
            if tree.is_empty() {
                return Ok(());
            }

            debug!(group = %group, pass, members = tree.len(), "Terminating process tree");
            for member in tree {
                terminate_member(member);
            }
            tokio::time::sleep(self.settings.poll).await;
        }

        let survivors = self.tree(group)?.len();
        if survivors == 0 {
            return Ok(());
        }
        Err(RelayError::PartialTermination {
            group: group.id(),
            survivors,
        })
    }
}

impl GroupControl for WindowsGroupControl {
    fn spawn_isolated(&self, spec: &SpawnSpec) -> Result<(Child, ProcessGroup), RelayError> {
        let mut command = build_command(spec, None);
        command.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);

        let mut child = command.spawn().map_err(|e| spawn_failure(spec, e))?;
        let pid = root_pid(spec, &child)?;
        // The unreaped child keeps its pid, so this is the root's own time.
        let Some(created) = process_created(pid) else {
            let _ = child.start_kill();
            return Err(spawn_failure(spec, io::Error::last_os_error()));
        };
        self.roots().insert(pid, created);

        debug!(pid, "Spawned isolated process tree");
        Ok((child, ProcessGroup::new(pid)))
    }

    fn terminate_group(&self, group: ProcessGroup) -> TerminateFuture<'_> {
        Box::pin(self.terminate(group))
    }

    fn is_alive(&self, group: ProcessGroup) -> bool {
        self.tree(group).is_ok_and(|tree| !tree.is_empty())
    }
}

/// Root and all descendants of `root`, parents before children.
///
/// `processes` is a `(pid, parent pid)` table; `created` looks up creation
/// times. Descendants are found even after the root itself has exited, as
/// long as they still name it as parent.
fn descendants(
    root: Member,
    processes: &[(u32, u32)],
    created: impl Fn(u32) -> Option<u64>,
) -> Vec<Member> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for &(pid, ppid) in processes {
        // The idle process claims itself as parent.
        if pid != ppid {
            children.entry(ppid).or_default().push(pid);
        }
    }
    let running: HashSet<u32> = processes.iter().map(|&(pid, _)| pid).collect();

    let mut tree = Vec::new();
    if running.contains(&root.pid) && created(root.pid) == Some(root.created) {
        tree.push(root);
    }

    let mut visited = HashSet::from([root.pid]);
    let mut queue = VecDeque::from([root]);
    while let Some(parent) = queue.pop_front() {
        // Set when the parent's pid now belongs to a newer process.
        let reused_at = running
            .contains(&parent.pid)
            .then(|| created(parent.pid))
            .flatten()
            .filter(|&t| t != parent.created);

        for &pid in children.get(&parent.pid).into_iter().flatten() {
            let Some(child_created) = created(pid) else {
                continue;
            };
            if child_created < parent.created || reused_at.is_some_and(|t| child_created >= t) {
                continue;
            }
            if visited.insert(pid) {
                let child = Member {
                    pid,
                    created: child_created,
                };
                tree.push(child);
                queue.push_back(child);
            }
        }
    }
    tree
}

/// `(pid, parent pid)` of every running process.
fn snapshot() -> Result<Vec<(u32, u32)>, RelayError> {
    // SAFETY: the snapshot handle is closed below and the entry struct is
    // sized as the API requires.
    unsafe {
        let handle = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0)
            .map_err(|e| RelayError::Io(io::Error::from(e)))?;

        let mut processes = Vec::new();
        let mut entry = PROCESSENTRY32W {
            dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
            ..Default::default()
        };
        if Process32FirstW(handle, &mut entry).is_ok() {
            loop {
                processes.push((entry.th32ProcessID, entry.th32ParentProcessID));
                if Process32NextW(handle, &mut entry).is_err() {
                    break;
                }
            }
        }

        close(handle);
        Ok(processes)
    }
}

fn open(pid: u32, access: PROCESS_ACCESS_RIGHTS) -> Option<HANDLE> {
    // SAFETY: plain handle acquisition; callers close it.
    match unsafe { OpenProcess(access, BOOL::from(false), pid) } {
        Ok(handle) => Some(handle),
        // Already gone, or not ours.
        Err(e) => {
            debug!(pid, error = %e, "OpenProcess failed");
            None
        }
    }
}

/// Creation time of a process we are allowed to query.
fn process_created(pid: u32) -> Option<u64> {
    let handle = open(pid, PROCESS_QUERY_LIMITED_INFORMATION)?;
    // SAFETY: the handle is valid until closed here.
    unsafe {
        let created = creation_time(handle);
        close(handle);
        created
    }
}

unsafe fn creation_time(handle: HANDLE) -> Option<u64> {
    let mut created = FILETIME::default();
    let mut exited = FILETIME::default();
    let mut kernel = FILETIME::default();
    let mut user = FILETIME::default();
    GetProcessTimes(handle, &mut created, &mut exited, &mut kernel, &mut user).ok()?;
    Some((u64::from(created.dwHighDateTime) << 32) | u64::from(created.dwLowDateTime))
}

fn terminate_member(member: Member) {
    let Some(handle) = open(member.pid, PROCESS_TERMINATE | PROCESS_QUERY_LIMITED_INFORMATION)
    else {
        return;
    };
    // SAFETY: the process handle is closed after use.
    unsafe {
        // The pid may have changed hands since the snapshot.
        if creation_time(handle) == Some(member.created) {
            if let Err(e) = TerminateProcess(handle, TERMINATED_EXIT_CODE) {
                debug!(pid = member.pid, error = %e, "TerminateProcess failed");
            }
        }
        close(handle);
    }
}

unsafe fn close(handle: HANDLE) {
    if let Err(e) = CloseHandle(handle) {
        warn!(error = %e, "CloseHandle failed");
    }
}
