#![cfg(unix)]

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use nix::unistd::{getpgid, getsid, Pid};

const SETSID: &str = env!("CARGO_BIN_EXE_askpass-setsid");

#[test]
fn exit_code_is_passed_through() {
    let status = Command::new(SETSID)
        .args(["sh", "-c", "exit 7"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(7));
}

#[test]
fn arguments_and_environment_are_preserved() {
    let output = Command::new(SETSID)
        .args([
            "sh",
            "-c",
            r#"printf '%s|%s|%s' "$1" "$2" "$MARKER""#,
            "sh",
            "one",
            "two words",
        ])
        .env("MARKER", "kept")
        .output()
        .unwrap();

    assert!(output.status.success());
    assert_eq!(output.stdout, b"one|two words|kept");
}

#[test]
fn command_runs_as_session_and_group_leader() {
    let mut child = Command::new(SETSID)
        .args(["sleep", "30"])
        .stdout(Stdio::null())
        .spawn()
        .unwrap();
    let pid = Pid::from_raw(child.id() as i32);

    // setsid happens right after exec of the trampoline; poll briefly.
    let deadline = Instant::now() + Duration::from_secs(5);
    let leader = loop {
        if getsid(Some(pid)).is_ok_and(|sid| sid == pid) {
            break true;
        }
        if Instant::now() >= deadline {
            break false;
        }
        std::thread::sleep(Duration::from_millis(10));
    };

    let pgid = getpgid(Some(pid));
    child.kill().unwrap();
    child.wait().unwrap();

    assert!(leader, "child did not become session leader");
    assert_eq!(pgid.unwrap(), pid);
}

#[test]
fn missing_command_exits_127() {
    let output = Command::new(SETSID)
        .arg("/nonexistent/askpass-setsid-test-command")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(127));
    assert!(!output.stderr.is_empty());
}

#[test]
fn no_arguments_is_usage_error() {
    let output = Command::new(SETSID).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
}
