//! End-to-end scenarios: a fake git (a shell script execing `$GIT_ASKPASS`)
//! spawned through the relay, with the real helper binary in between.

#![cfg(unix)]

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use askpass_relay::{endpoint, LaunchRequest, MockCallback, RelayServer, Spawner};
use askpass_relay_core::protocol::{ENV_DEADLINE_MS, ENV_ENDPOINT, ENV_INVOCATION_ID};
use askpass_relay_core::{FnCallback, InvocationId, PromptKind, PromptRequest, RelayConfig};
use secrecy::SecretString;
use tempfile::TempDir;

const HELPER: &str = env!("CARGO_BIN_EXE_askpass-client");
const PROMPT: &str = "Password for 'https://example.com':";

/// Prints the endpoint on stderr, then asks for a credential the way git
/// does and prints whatever the helper returned.
const FAKE_GIT: &str = r#"echo "$ASKPASS_RELAY_ENDPOINT" >&2; exec "$GIT_ASKPASS" "$1""#;

fn spawner() -> (TempDir, Spawner) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = RelayConfig::default();
    config.helpers.askpass = Some(PathBuf::from(HELPER));
    let spawner = Spawner::new(config)
        .unwrap()
        .with_runtime_dir(temp_dir.path());
    (temp_dir, spawner)
}

fn fake_git() -> LaunchRequest {
    LaunchRequest::new("sh")
        .arg("-c")
        .arg(FAKE_GIT)
        .arg("fake-git")
        .arg(PROMPT)
}

#[tokio::test]
async fn answer_reaches_git_on_stdout() {
    let (_dir, spawner) = spawner();
    let callback = MockCallback::with_answer("s3cret");

    let output = spawner
        .run(fake_git(), Arc::new(callback.clone()))
        .await
        .unwrap();

    assert!(output.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(output.stdout, b"s3cret");

    let prompts = callback.prompts();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].prompt, PROMPT);
    assert_eq!(prompts[0].kind, PromptKind::Password);
    assert_eq!(prompts[0].invocation_id, output.invocation_id);
}

#[tokio::test]
async fn secret_bytes_are_preserved_exactly() {
    let (_dir, spawner) = spawner();

    let output = spawner
        .run(fake_git(), Arc::new(MockCallback::with_answer("  pa ss\nwörd ")))
        .await
        .unwrap();

    assert!(output.success());
    assert_eq!(output.stdout, "  pa ss\nwörd ".as_bytes());
}

#[tokio::test]
async fn refusal_gives_empty_stdout_and_failure() {
    let (_dir, spawner) = spawner();

    let output = spawner
        .run(fake_git(), Arc::new(MockCallback::refusing()))
        .await
        .unwrap();

    assert!(!output.success());
    assert!(output.stdout.is_empty());
}

#[tokio::test]
async fn unanswered_prompt_times_out_promptly() {
    let (_dir, spawner) = spawner();
    let callback = MockCallback::never_resolves();

    let start = Instant::now();
    let output = spawner
        .run(
            fake_git().prompt_timeout(Duration::from_millis(200)),
            Arc::new(callback.clone()),
        )
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert!(!output.success());
    assert!(output.stdout.is_empty());
    assert!(!output.timed_out);
    assert_eq!(callback.call_count(), 1);
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
}

#[tokio::test]
async fn helper_exits_right_after_prompt_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let id = InvocationId::generate();
    let (relay_endpoint, listener) = endpoint::bind(&id, Some(dir.path())).unwrap();
    let relay = RelayServer::new(
        id.clone(),
        Arc::new(MockCallback::never_resolves()),
        Duration::from_millis(200),
    )
    .spawn(listener);

    let start = Instant::now();
    let output = tokio::process::Command::new(HELPER)
        .arg(PROMPT)
        .env(ENV_ENDPOINT, relay_endpoint.address())
        .env(ENV_INVOCATION_ID, id.as_str())
        .env(ENV_DEADLINE_MS, "700")
        .output()
        .await
        .unwrap();
    let elapsed = start.elapsed();
    relay.shutdown();

    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(500), "helper took {elapsed:?}");
}

#[tokio::test]
async fn concurrent_invocations_are_isolated() {
    let (_dir, spawner) = spawner();

    let answer_with = |secret: &'static str| {
        Arc::new(FnCallback::new(move |request: PromptRequest| async move {
            // Give the other invocation time to ask as well.
            tokio::time::sleep(Duration::from_millis(100)).await;
            Some(SecretString::from(format!("{secret}:{}", request.invocation_id)))
        }))
    };

    let (alpha, bravo) = tokio::join!(
        spawner.run(fake_git(), answer_with("alpha")),
        spawner.run(fake_git(), answer_with("bravo")),
    );
    let alpha = alpha.unwrap();
    let bravo = bravo.unwrap();

    assert_eq!(
        String::from_utf8(alpha.stdout).unwrap(),
        format!("alpha:{}", alpha.invocation_id)
    );
    assert_eq!(
        String::from_utf8(bravo.stdout).unwrap(),
        format!("bravo:{}", bravo.invocation_id)
    );
    assert_ne!(alpha.invocation_id, bravo.invocation_id);
    assert_ne!(alpha.stderr, bravo.stderr, "invocations shared an endpoint");
}

#[test]
fn helper_outside_invocation_fails_with_empty_stdout() {
    let output = Command::new(HELPER)
        .arg(PROMPT)
        .env_remove(ENV_ENDPOINT)
        .env_remove(ENV_INVOCATION_ID)
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn helper_with_dead_relay_fails_fast() {
    let dir = tempfile::tempdir().unwrap();

    let start = Instant::now();
    let output = Command::new(HELPER)
        .arg(PROMPT)
        .env(ENV_ENDPOINT, dir.path().join("socket"))
        .env(ENV_INVOCATION_ID, InvocationId::generate().as_str())
        .env(ENV_DEADLINE_MS, "30000")
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    assert!(start.elapsed() < Duration::from_secs(5));
}
