//! Process trees started through the session helper, the way the spawner
//! starts them by default, end as a whole.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use askpass_relay::process::unix::UnixGroupControl;
use askpass_relay::process::{SpawnSpec, TerminationSettings};
use askpass_relay::{DenyAll, GroupControl, LaunchRequest, Spawner};
use askpass_relay_core::RelayConfig;
use nix::unistd::{getsid, Pid};

const SETSID: &str = env!("CARGO_BIN_EXE_askpass-setsid");

/// Every generation records its pid and forks the next one; the last one
/// becomes `sleep`.
const TREE_SCRIPT: &str = r#"echo $$ >> "$2"
if [ "$1" -gt 0 ]; then
  sh "$0" $(($1 - 1)) "$2" &
  wait
else
  exec sleep 30
fi
"#;

fn tree(dir: &Path, generations: u32) -> (Vec<String>, PathBuf) {
    let script = dir.join("tree.sh");
    std::fs::write(&script, TREE_SCRIPT).unwrap();
    let pids = dir.join("pids");
    let args = vec![
        script.display().to_string(),
        generations.to_string(),
        pids.display().to_string(),
    ];
    (args, pids)
}

async fn recorded_pids(path: &Path, count: usize) -> Vec<u32> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let pids: Vec<u32> = std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect();
        if pids.len() >= count {
            return pids;
        }
        assert!(Instant::now() < deadline, "process tree did not start");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Whether `pid` is a live, non-zombie process.
#[cfg(target_os = "linux")]
fn alive(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    let state = stat
        .rfind(')')
        .and_then(|end| stat[end + 1..].split_whitespace().next());
    !matches!(state, None | Some("Z") | Some("X"))
}

#[cfg(not(target_os = "linux"))]
fn alive(pid: u32) -> bool {
    nix::sys::signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

fn settings() -> TerminationSettings {
    TerminationSettings {
        grace: Duration::from_millis(500),
        poll: Duration::from_millis(10),
        max_passes: 3,
    }
}

#[tokio::test]
async fn tree_started_through_helper_is_terminated() {
    let dir = tempfile::tempdir().unwrap();
    let (args, pid_file) = tree(dir.path(), 3);
    let spec = SpawnSpec {
        program: "sh".into(),
        args: args.into_iter().map(Into::into).collect(),
        ..Default::default()
    };
    let control = UnixGroupControl::new(Some(PathBuf::from(SETSID)), settings());

    let (mut child, group) = control.spawn_isolated(&spec).unwrap();
    let pids = recorded_pids(&pid_file, 4).await;

    // The helper execs the command, so the first shell is the root itself,
    // leading its own session.
    assert_eq!(pids[0], group.id());
    let root = Pid::from_raw(group.id() as i32);
    assert_eq!(getsid(Some(root)).unwrap(), root);
    assert!(control.is_alive(group));

    let (result, _) = tokio::join!(control.terminate_group(group), child.wait());
    result.unwrap();

    let survivors: Vec<bool> = pids.iter().map(|&pid| alive(pid)).collect();
    assert_eq!(survivors, [false; 4]);
}

#[tokio::test]
async fn spawner_uses_helper_and_cancels_whole_tree() {
    let dir = tempfile::tempdir().unwrap();
    let (args, pid_file) = tree(dir.path(), 3);
    let mut config = RelayConfig::default();
    config.helpers.askpass = Some(PathBuf::from("/bin/false"));
    config.helpers.setsid = Some(PathBuf::from(SETSID));
    config.timeouts.grace_millis = 500;
    let spawner = Spawner::new(config)
        .unwrap()
        .with_runtime_dir(dir.path().join("run"));
    std::fs::create_dir(dir.path().join("run")).unwrap();

    let handle = spawner
        .launch(LaunchRequest::new("sh").args(args), Arc::new(DenyAll))
        .await
        .unwrap();
    let pids = recorded_pids(&pid_file, 4).await;
    let root = Pid::from_raw(pids[0] as i32);
    assert_eq!(getsid(Some(root)).unwrap(), root);

    handle.cancel();
    let output = handle.wait().await.unwrap();

    assert!(output.cancelled);
    let survivors: Vec<bool> = pids.iter().map(|&pid| alive(pid)).collect();
    assert_eq!(survivors, [false; 4]);
    assert!(spawner.registry().is_empty());
}
