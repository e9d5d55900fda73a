//! Invocation lifecycle.
//!
//! [`Spawner::launch`] ties everything together for one git command:
//!
//! 1. generate an invocation id and bind its endpoint
//! 2. start the relay before the child exists, so the first prompt can't
//!    race the listener
//! 3. spawn the command isolated, with the askpass environment
//! 4. supervise: child exit, cancellation or timeout, whichever comes first
//! 5. terminate whatever is left of the tree, then tear down relay, endpoint
//!    and registry entry exactly once
//!
//! A supervisor dropped before its tree is gone (runtime shutdown) still
//! tears down relay and endpoint, but leaves the registry entry so
//! [`GroupRegistry::sweep`] can terminate the tree.

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use askpass_relay_core::protocol::{ENV_DEADLINE_MS, ENV_ENDPOINT, ENV_INVOCATION_ID};
use askpass_relay_core::{CredentialCallback, InvocationId, RelayConfig};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::endpoint::{self, RelayEndpoint};
use crate::error::RelayError;
use crate::process::{GroupControl, GroupRegistry, PlatformControl, ProcessGroup, SpawnSpec};
use crate::relay::{RelayHandle, RelayServer};

/// Extra time the helper waits beyond the relay's prompt timeout, so the
/// relay's refusal arrives before the helper gives up on its own.
pub const HELPER_SLACK: Duration = Duration::from_millis(500);

/// How long output is still collected once the tree is gone. Only processes
/// that escaped the tree can hold the pipes open past that.
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

/// A command to run under the relay.
///
/// Builder in the style of `std::process::Command`, limited to what a git
/// invocation needs.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    program: OsString,
    args: Vec<OsString>,
    working_dir: Option<PathBuf>,
    env: Vec<(OsString, OsString)>,
    timeout: Option<Duration>,
    prompt_timeout: Option<Duration>,
}

impl LaunchRequest {
    /// Run `program`.
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            timeout: None,
            prompt_timeout: None,
        }
    }

    /// Run `git` from `PATH`.
    pub fn git() -> Self {
        Self::new("git")
    }

    /// Add an argument.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Add arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Run in `dir` instead of the current directory.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set an environment variable. Applied after the relay's own
    /// variables, so it overrides them.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Override the configured invocation timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the configured prompt timeout.
    pub fn prompt_timeout(mut self, timeout: Duration) -> Self {
        self.prompt_timeout = Some(timeout);
        self
    }

    /// The program to run.
    pub fn program(&self) -> &OsStr {
        &self.program
    }
}

/// Result of a finished invocation.
#[derive(Debug)]
pub struct InvocationOutput {
    /// The invocation's id.
    pub invocation_id: InvocationId,
    /// Exit status of the root process.
    pub status: ExitStatus,
    /// Everything the tree wrote to stdout.
    pub stdout: Vec<u8>,
    /// Everything the tree wrote to stderr.
    pub stderr: Vec<u8>,
    /// Ended by cancellation.
    pub cancelled: bool,
    /// Ended by the invocation timeout.
    pub timed_out: bool,
}

impl InvocationOutput {
    /// Whether the command ran to completion and exited zero.
    pub fn success(&self) -> bool {
        self.status.success() && !self.cancelled && !self.timed_out
    }

    /// Exit code, if the root exited normally.
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// A running invocation.
#[derive(Debug)]
pub struct InvocationHandle {
    invocation_id: InvocationId,
    cancel: Arc<watch::Sender<bool>>,
    task: JoinHandle<Result<InvocationOutput, RelayError>>,
}

impl InvocationHandle {
    /// The invocation's id.
    pub fn id(&self) -> &InvocationId {
        &self.invocation_id
    }

    /// Request cancellation. The whole tree is terminated; [`wait`] then
    /// reports `cancelled`.
    ///
    /// [`wait`]: InvocationHandle::wait
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Wait for the invocation to finish and its resources to be released.
    pub async fn wait(self) -> Result<InvocationOutput, RelayError> {
        self.task
            .await
            .map_err(|e| RelayError::Supervisor(e.to_string()))?
    }
}

/// Launches git commands with the credential relay attached.
pub struct Spawner {
    config: RelayConfig,
    askpass: PathBuf,
    control: Arc<dyn GroupControl>,
    registry: Arc<GroupRegistry>,
    runtime_dir: Option<PathBuf>,
}

impl Spawner {
    /// Create a spawner using the platform's process control.
    ///
    /// Fails if the configuration is invalid or the askpass helper can't be
    /// located.
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        let control: Arc<dyn GroupControl> = Arc::new(PlatformControl::from_config(&config));
        Self::with_control(config, control)
    }

    /// Create a spawner with a custom process controller.
    pub fn with_control(
        config: RelayConfig,
        control: Arc<dyn GroupControl>,
    ) -> Result<Self, RelayError> {
        config.validate()?;
        let askpass = config.askpass_path()?;
        let registry = Arc::new(GroupRegistry::new(Arc::clone(&control)));

        Ok(Self {
            config,
            askpass,
            control,
            registry,
            runtime_dir: None,
        })
    }

    /// Create endpoints under `dir` instead of the runtime directory.
    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = Some(dir.into());
        self
    }

    /// Live invocations of this spawner.
    pub fn registry(&self) -> &Arc<GroupRegistry> {
        &self.registry
    }

    /// Cancel a running invocation by id. Returns `false` if it isn't
    /// running.
    pub fn cancel(&self, id: &InvocationId) -> bool {
        self.registry.cancel(id)
    }

    /// Launch and wait for completion.
    pub async fn run(
        &self,
        request: LaunchRequest,
        callback: Arc<dyn CredentialCallback>,
    ) -> Result<InvocationOutput, RelayError> {
        self.launch(request, callback).await?.wait().await
    }

    /// Start an invocation.
    ///
    /// Fails with [`RelayError::EndpointUnavailable`] or
    /// [`RelayError::ProcessSpawnFailure`]; in both cases nothing is left
    /// behind.
    pub async fn launch(
        &self,
        request: LaunchRequest,
        callback: Arc<dyn CredentialCallback>,
    ) -> Result<InvocationHandle, RelayError> {
        let id = InvocationId::generate();
        let prompt_timeout = request
            .prompt_timeout
            .unwrap_or_else(|| self.config.prompt_timeout());
        let timeout = request
            .timeout
            .unwrap_or_else(|| self.config.invocation_timeout());

        let (mut endpoint, listener) = endpoint::bind(&id, self.runtime_dir.as_deref())?;
        let relay = RelayServer::new(id.clone(), callback, prompt_timeout).spawn(listener);

        let spec = SpawnSpec {
            env: self.environment(&id, &endpoint, prompt_timeout, timeout, request.env),
            program: request.program,
            args: request.args,
            working_dir: request.working_dir,
        };

        let (child, group) = match self.control.spawn_isolated(&spec) {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(invocation = ?id, error = %e, "Failed to spawn invocation");
                relay.shutdown();
                endpoint.release();
                return Err(e);
            }
        };
        info!(
            invocation = ?id,
            group = %group,
            program = %spec.program.to_string_lossy(),
            "Started invocation"
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel = Arc::new(cancel_tx);
        self.registry.insert(id.clone(), group, Arc::clone(&cancel));

        let supervisor = Supervisor {
            invocation_id: id.clone(),
            group,
            timeout,
            control: Arc::clone(&self.control),
            registry: Arc::clone(&self.registry),
            relay,
            endpoint,
            released: false,
            tree_gone: false,
        };

        Ok(InvocationHandle {
            invocation_id: id,
            cancel,
            task: tokio::spawn(supervisor.run(child, cancel_rx)),
        })
    }

    /// Variables pointing git and ssh at the helper and the helper at the
    /// relay. Caller-supplied variables come last and win.
    ///
    /// The helper never waits past the invocation's own deadline.
    fn environment(
        &self,
        id: &InvocationId,
        endpoint: &RelayEndpoint,
        prompt_timeout: Duration,
        timeout: Duration,
        overrides: Vec<(OsString, OsString)>,
    ) -> Vec<(OsString, OsString)> {
        let helper_wait = (prompt_timeout + HELPER_SLACK)
            .min(timeout)
            .as_millis()
            .to_string();
        let mut env: Vec<(OsString, OsString)> = vec![
            ("GIT_ASKPASS".into(), self.askpass.clone().into()),
            ("SSH_ASKPASS".into(), self.askpass.clone().into()),
            ("SSH_ASKPASS_REQUIRE".into(), "force".into()),
            ("GIT_TERMINAL_PROMPT".into(), "0".into()),
            (ENV_ENDPOINT.into(), endpoint.address().into()),
            (ENV_INVOCATION_ID.into(), id.as_str().into()),
            (ENV_DEADLINE_MS.into(), helper_wait.into()),
        ];
        // Older OpenSSH only consults SSH_ASKPASS when DISPLAY is set.
        if std::env::var_os("DISPLAY").is_none() {
            env.push(("DISPLAY".into(), ":".into()));
        }
        env.extend(overrides);
        env
    }
}

impl std::fmt::Debug for Spawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spawner")
            .field("askpass", &self.askpass)
            .field("registry", &self.registry)
            .field("runtime_dir", &self.runtime_dir)
            .finish()
    }
}

/// Owns one invocation's resources until they are released.
struct Supervisor {
    invocation_id: InvocationId,
    group: ProcessGroup,
    timeout: Duration,
    control: Arc<dyn GroupControl>,
    registry: Arc<GroupRegistry>,
    relay: RelayHandle,
    endpoint: RelayEndpoint,
    released: bool,
    /// Nothing of the tree is left for a sweep to terminate.
    tree_gone: bool,
}

impl Supervisor {
    async fn run(
        mut self,
        mut child: Child,
        cancel: watch::Receiver<bool>,
    ) -> Result<InvocationOutput, RelayError> {
        let (stop_tx, stop) = watch::channel(false);
        let stdout = tokio::spawn(read_all(child.stdout.take(), stop.clone()));
        let stderr = tokio::spawn(read_all(child.stderr.take(), stop));

        let mut cancelled = false;
        let mut timed_out = false;
        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancellation(cancel) => {
                cancelled = true;
                None
            }
            _ = tokio::time::sleep(self.timeout) => {
                timed_out = true;
                None
            }
        };

        let (status, termination) = match exited {
            Some(status) => {
                // The root is gone; anything it left running in its group
                // goes with it.
                let termination = if self.control.is_alive(self.group) {
                    debug!(invocation = ?self.invocation_id, "Terminating leftover group members");
                    self.control.terminate_group(self.group).await
                } else {
                    Ok(())
                };
                (status, termination)
            }
            None => {
                info!(
                    invocation = ?self.invocation_id,
                    cancelled,
                    timed_out,
                    "Terminating invocation"
                );
                self.terminate_tree(&mut child).await
            }
        };
        self.tree_gone = termination.is_ok();

        self.release();
        let status = status?;
        termination?;

        let (stdout, stderr) = collect_output(stdout, stderr, stop_tx).await;

        debug!(invocation = ?self.invocation_id, %status, "Invocation finished");
        Ok(InvocationOutput {
            invocation_id: self.invocation_id.clone(),
            status,
            stdout,
            stderr,
            cancelled,
            timed_out,
        })
    }

    /// Terminate the group while reaping the root, so the root doesn't
    /// linger as a zombie that still counts as alive.
    ///
    /// A root started through the session helper is outside its own group
    /// until it has called `setsid`. If the group is gone but the root isn't,
    /// the root is killed through its handle, which can't reach a reused pid.
    async fn terminate_tree(
        &self,
        child: &mut Child,
    ) -> (std::io::Result<ExitStatus>, Result<(), RelayError>) {
        let terminate = self.control.terminate_group(self.group);
        tokio::pin!(terminate);

        let mut termination = None;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                result = &mut terminate, if termination.is_none() => {
                    termination = Some(result);
                    if let Err(e) = child.start_kill() {
                        debug!(invocation = ?self.invocation_id, error = %e, "Failed to kill root");
                    }
                }
            }
        };

        let termination = match termination {
            Some(result) => result,
            None => terminate.await,
        };
        (status, termination)
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.relay.shutdown();
        self.endpoint.release();
        if self.tree_gone {
            self.registry.remove(&self.invocation_id);
        } else {
            warn!(
                invocation = ?self.invocation_id,
                group = %self.group,
                "Supervisor stopped with the process tree still running; left for sweep"
            );
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.release();
    }
}

/// Resolves once cancellation is requested; never if the sender is gone.
async fn cancellation(mut cancel: watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Wait for both readers to reach EOF, at most [`OUTPUT_DRAIN`]; then stop
/// them and keep what they have read.
async fn collect_output(
    stdout: JoinHandle<Vec<u8>>,
    stderr: JoinHandle<Vec<u8>>,
    stop: watch::Sender<bool>,
) -> (Vec<u8>, Vec<u8>) {
    let deadline = Instant::now() + OUTPUT_DRAIN;
    let both = async { tokio::join!(stdout, stderr) };
    tokio::pin!(both);

    let (stdout, stderr) = match tokio::time::timeout_at(deadline, &mut both).await {
        Ok(joined) => joined,
        Err(_) => {
            debug!("Output pipes still open after the tree exited; closing them");
            stop.send_replace(true);
            both.await
        }
    };
    (stdout.unwrap_or_default(), stderr.unwrap_or_default())
}

/// Read `stream` to EOF or until told to stop. A chunk that is ready when
/// the stop arrives is still kept.
async fn read_all<R: AsyncRead + Unpin>(
    stream: Option<R>,
    mut stop: watch::Receiver<bool>,
) -> Vec<u8> {
    let mut buf = Vec::new();
    let Some(mut stream) = stream else {
        return buf;
    };

    let mut chunk = [0u8; 8192];
    loop {
        tokio::select! {
            biased;
            read = stream.read(&mut chunk) => match read {
                Ok(0) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    // A writer that never pauses mustn't outrun the stop.
                    if *stop.borrow() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Failed to read child output");
                    break;
                }
            },
            // A dropped sender stops the reader as well.
            _ = async { let _ = stop.wait_for(|stop| *stop).await; } => break,
        }
    }
    buf
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::callback::{DenyAll, MockCallback};
    use crate::process::unix::tests::{recorded_pids, tree_spec};
    use crate::process::unix::{pid_alive, UnixGroupControl};
    use crate::process::TerminationSettings;
    use tempfile::TempDir;

    fn spawner() -> (TempDir, Spawner) {
        spawner_through(None)
    }

    /// Spawner whose children are started through `trampoline`.
    fn spawner_through(trampoline: Option<PathBuf>) -> (TempDir, Spawner) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = RelayConfig::default();
        // No prompts are answered in these tests.
        config.helpers.askpass = Some(PathBuf::from("/bin/false"));
        let control = Arc::new(UnixGroupControl::new(
            trampoline,
            TerminationSettings {
                grace: Duration::from_millis(500),
                poll: Duration::from_millis(10),
                max_passes: 3,
            },
        ));
        let spawner = Spawner::with_control(config, control)
            .unwrap()
            .with_runtime_dir(temp_dir.path());
        (temp_dir, spawner)
    }

    fn sh(script: &str) -> LaunchRequest {
        LaunchRequest::new("sh").arg("-c").arg(script)
    }

    fn endpoint_dirs(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path()).unwrap().count()
    }

    #[tokio::test]
    async fn run_captures_output_and_status() {
        let (_dir, spawner) = spawner();

        let output = spawner
            .run(sh("echo out; echo err >&2; exit 3"), Arc::new(DenyAll))
            .await
            .unwrap();

        assert_eq!(output.stdout, b"out\n");
        assert_eq!(output.stderr, b"err\n");
        assert_eq!(output.code(), Some(3));
        assert!(!output.success());
        assert!(!output.cancelled && !output.timed_out);
    }

    #[tokio::test]
    async fn child_sees_relay_environment() {
        let (_dir, spawner) = spawner();

        let handle = spawner
            .launch(
                sh(r#"printf '%s|%s|%s|%s|%s' "$GIT_ASKPASS" "$SSH_ASKPASS_REQUIRE" "$GIT_TERMINAL_PROMPT" "$ASKPASS_RELAY_INVOCATION" "$ASKPASS_RELAY_DEADLINE_MS""#)
                    .prompt_timeout(Duration::from_secs(2)),
                Arc::new(DenyAll),
            )
            .await
            .unwrap();
        let id = handle.id().clone();
        let output = handle.wait().await.unwrap();

        let stdout = String::from_utf8(output.stdout).unwrap();
        assert_eq!(stdout, format!("/bin/false|force|0|{}|2500", id.as_str()));
        assert_eq!(output.invocation_id, id);
    }

    #[tokio::test]
    async fn caller_environment_overrides_defaults() {
        let (_dir, spawner) = spawner();

        let output = spawner
            .run(
                sh(r#"printf '%s' "$GIT_TERMINAL_PROMPT""#).env("GIT_TERMINAL_PROMPT", "1"),
                Arc::new(DenyAll),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, b"1");
    }

    #[tokio::test]
    async fn working_directory_is_applied() {
        let (dir, spawner) = spawner();
        let work = dir.path().join("work");
        std::fs::create_dir(&work).unwrap();

        let output = spawner
            .run(sh("pwd -P").current_dir(&work), Arc::new(DenyAll))
            .await
            .unwrap();
        let expected = format!("{}\n", work.canonicalize().unwrap().display());
        assert_eq!(String::from_utf8(output.stdout).unwrap(), expected);
    }

    #[tokio::test]
    async fn resources_are_released_after_exit() {
        let (dir, spawner) = spawner();

        spawner.run(sh("exit 0"), Arc::new(DenyAll)).await.unwrap();

        assert!(spawner.registry().is_empty());
        assert_eq!(endpoint_dirs(&dir), 0);
    }

    #[tokio::test]
    async fn spawn_failure_leaves_nothing_behind() {
        let (dir, spawner) = spawner();

        let result = spawner
            .launch(
                LaunchRequest::new("/nonexistent/askpass-relay-test-git"),
                Arc::new(DenyAll),
            )
            .await;

        assert!(matches!(
            result,
            Err(RelayError::ProcessSpawnFailure { .. })
        ));
        assert!(spawner.registry().is_empty());
        assert_eq!(endpoint_dirs(&dir), 0);
    }

    #[tokio::test]
    async fn cancel_terminates_whole_tree() {
        let (dir, spawner) = spawner();
        let (spec, pid_file) = tree_spec(dir.path(), 3);
        let request = LaunchRequest::new(&spec.program).args(&spec.args);

        let handle = spawner.launch(request, Arc::new(DenyAll)).await.unwrap();
        let pids = recorded_pids(&pid_file, 4).await;

        let start = std::time::Instant::now();
        assert!(spawner.cancel(handle.id()));
        let output = handle.wait().await.unwrap();

        assert!(output.cancelled);
        assert!(!output.success());
        assert!(start.elapsed() < Duration::from_secs(5));
        for pid in pids {
            assert!(!pid_alive(pid), "pid {pid} survived cancellation");
        }
        assert!(spawner.registry().is_empty());
    }

    #[tokio::test]
    async fn handle_cancel_works_like_spawner_cancel() {
        let (_dir, spawner) = spawner();

        let handle = spawner
            .launch(sh("sleep 30"), Arc::new(DenyAll))
            .await
            .unwrap();
        handle.cancel();
        handle.cancel();

        let output = handle.wait().await.unwrap();
        assert!(output.cancelled);
    }

    #[tokio::test]
    async fn timeout_terminates_invocation() {
        let (dir, spawner) = spawner();

        let start = std::time::Instant::now();
        let output = spawner
            .run(
                sh("sleep 30").timeout(Duration::from_millis(200)),
                Arc::new(DenyAll),
            )
            .await
            .unwrap();

        assert!(output.timed_out);
        assert!(!output.cancelled);
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(endpoint_dirs(&dir), 0);
    }

    #[tokio::test]
    async fn leftover_background_processes_are_reaped_after_exit() {
        let (dir, spawner) = spawner();
        let pid_file = dir.path().join("bg.pid");
        let script = format!(
            "sleep 30 > /dev/null 2>&1 & echo $! > '{}'",
            pid_file.display()
        );

        let output = spawner.run(sh(&script), Arc::new(DenyAll)).await.unwrap();
        assert!(output.success());

        let pid: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(!pid_alive(pid), "background process outlived its invocation");
    }

    #[tokio::test]
    async fn cancel_after_completion_is_noop() {
        let (_dir, spawner) = spawner();

        let handle = spawner
            .launch(sh("exit 0"), Arc::new(MockCallback::default()))
            .await
            .unwrap();
        let id = handle.id().clone();
        handle.wait().await.unwrap();

        assert!(!spawner.cancel(&id));
    }

    #[tokio::test]
    async fn sweep_terminates_running_invocations() {
        let (_dir, spawner) = spawner();

        let handle = spawner
            .launch(sh("sleep 30"), Arc::new(DenyAll))
            .await
            .unwrap();
        let group = spawner.registry().group(handle.id()).unwrap();

        assert_eq!(spawner.registry().sweep().await.unwrap(), 1);
        let output = handle.wait().await.unwrap();
        assert!(!output.success());
        assert!(!pid_alive(group.id()));
    }

    #[tokio::test]
    async fn helper_deadline_is_capped_by_invocation_timeout() {
        let (_dir, spawner) = spawner();

        let output = spawner
            .run(
                sh(r#"printf '%s' "$ASKPASS_RELAY_DEADLINE_MS""#)
                    .prompt_timeout(Duration::from_secs(2))
                    .timeout(Duration::from_secs(1)),
                Arc::new(DenyAll),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, b"1000");
    }

    #[tokio::test]
    async fn root_outside_its_group_is_killed_through_its_handle() {
        // `sh` as trampoline never calls setsid, so the root stays in our
        // process group, like the session helper before it gets to run.
        let (dir, spawner) = spawner_through(Some(PathBuf::from("/bin/sh")));
        let script = dir.path().join("root.sh");
        std::fs::write(&script, "exec sleep 30\n").unwrap();

        let handle = spawner
            .launch(LaunchRequest::new(&script), Arc::new(DenyAll))
            .await
            .unwrap();
        let group = spawner.registry().group(handle.id()).unwrap();

        let start = std::time::Instant::now();
        handle.cancel();
        let output = handle.wait().await.unwrap();

        assert!(output.cancelled);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!pid_alive(group.id()));
        assert!(spawner.registry().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn escaped_process_holding_output_does_not_block_completion() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let (dir, spawner) = spawner();
        let pid_file = dir.path().join("escaped.pid");
        let script = format!(
            "echo before; setsid sleep 6 & echo $! > '{}'; exit 0",
            pid_file.display()
        );

        let start = std::time::Instant::now();
        let output = spawner
            .run(
                sh(&script).timeout(Duration::from_millis(500)),
                Arc::new(DenyAll),
            )
            .await
            .unwrap();
        let elapsed = start.elapsed();

        if let Ok(pid) = std::fs::read_to_string(&pid_file) {
            if let Ok(pid) = pid.trim().parse() {
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
        assert!(output.success());
        assert_eq!(output.stdout, b"before\n");
        assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn tree_outliving_its_runtime_is_left_for_sweep() {
        let (_dir, spawner) = spawner();

        let first = tokio::runtime::Runtime::new().unwrap();
        let (id, group) = first.block_on(async {
            let handle = spawner
                .launch(sh("sleep 30"), Arc::new(DenyAll))
                .await
                .unwrap();
            let id = handle.id().clone();
            let group = spawner.registry().group(&id).unwrap();
            (id, group)
        });
        drop(first);

        assert_eq!(spawner.registry().group(&id), Some(group));
        assert!(pid_alive(group.id()));

        let second = tokio::runtime::Runtime::new().unwrap();
        let swept = second.block_on(spawner.registry().sweep()).unwrap();
        assert_eq!(swept, 1);
        assert!(!pid_alive(group.id()));
    }
}
