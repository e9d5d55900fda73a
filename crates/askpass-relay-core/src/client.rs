//! Blocking relay client.
//!
//! Used by the askpass helper, which runs as a short-lived child of git or
//! ssh and has no use for an async runtime. The exchange runs on a worker
//! thread so the wait budget can be enforced on every platform, including
//! named pipes where read timeouts are unavailable.

use std::io::{Read, Write};
use std::sync::mpsc;
use std::time::Duration;

use tracing::debug;
use zeroize::Zeroizing;

use crate::protocol::{
    ProtocolError, Request, Response, ENV_DEADLINE_MS, ENV_ENDPOINT, ENV_INVOCATION_ID,
    MAX_RESPONSE_BYTES,
};
use crate::types::InvocationId;

/// Wait budget used when the spawner did not export one.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(65);

/// Connection details inherited from the spawned environment.
#[derive(Debug, Clone)]
pub struct RelayClient {
    endpoint: String,
    invocation_id: InvocationId,
    wait: Duration,
}

impl RelayClient {
    /// Create a client for an explicit endpoint.
    pub fn new(endpoint: impl Into<String>, invocation_id: InvocationId, wait: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            invocation_id,
            wait,
        }
    }

    /// Read endpoint, invocation id and wait budget from the environment.
    pub fn from_env() -> Result<Self, ProtocolError> {
        let endpoint = std::env::var(ENV_ENDPOINT)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or(ProtocolError::MissingEnvironment(ENV_ENDPOINT))?;
        let invocation_id = std::env::var(ENV_INVOCATION_ID)
            .ok()
            .and_then(|v| v.parse().ok())
            .ok_or(ProtocolError::MissingEnvironment(ENV_INVOCATION_ID))?;
        let wait = std::env::var(ENV_DEADLINE_MS)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_WAIT);

        Ok(Self::new(endpoint, invocation_id, wait))
    }

    /// The endpoint address.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The wait budget for one exchange.
    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Send one prompt and wait for the relay's decision.
    ///
    /// Fails immediately if nothing is listening on the endpoint, and with
    /// [`ProtocolError::Timeout`] if no answer arrives within the wait budget.
    pub fn request(&self, prompt: &str) -> Result<Response, ProtocolError> {
        let mut request = Request::new(&self.invocation_id, prompt);
        request.deadline_millis = Some(self.wait.as_millis() as u64);
        request.caller_pid = caller_pid();
        let line = request.to_json_line()?;

        let stream = connect(&self.endpoint)?;
        debug!(endpoint = %self.endpoint, kind = %request.kind, "Connected to relay");

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(exchange(stream, &line));
        });

        match rx.recv_timeout(self.wait) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                Err(ProtocolError::Timeout(self.wait.as_millis() as u64))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ProtocolError::ConnectionClosed),
        }
    }
}

/// Write the request line and read the full response.
fn exchange<S: Read + Write>(mut stream: S, line: &str) -> Result<Response, ProtocolError> {
    stream.write_all(line.as_bytes())?;
    stream.flush()?;

    let mut buf = Zeroizing::new(Vec::new());
    (&mut stream)
        .take(MAX_RESPONSE_BYTES)
        .read_to_end(&mut buf)?;

    Response::decode(&buf)
}

#[cfg(unix)]
fn connect(endpoint: &str) -> Result<std::os::unix::net::UnixStream, ProtocolError> {
    Ok(std::os::unix::net::UnixStream::connect(endpoint)?)
}

#[cfg(windows)]
fn connect(endpoint: &str) -> Result<std::fs::File, ProtocolError> {
    // ERROR_PIPE_BUSY: the server is between accepting one client and
    // creating the next pipe instance.
    const ERROR_PIPE_BUSY: i32 = 231;

    let mut attempts = 0;
    loop {
        match std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(endpoint)
        {
            Ok(file) => return Ok(file),
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) && attempts < 20 => {
                attempts += 1;
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn caller_pid() -> Option<u32> {
    Some(std::os::unix::process::parent_id())
}

#[cfg(not(unix))]
fn caller_pid() -> Option<u32> {
    None
}
