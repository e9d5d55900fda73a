//! Per-invocation relay server.
//!
//! Accepts helper connections on one endpoint, checks that each request
//! carries this invocation's id, and hands the prompt to the credential
//! callback. Every connection gets its own task so a stuck or malicious
//! client can't block the accept loop; prompts themselves are serviced one
//! at a time since git and ssh ask sequentially anyway.

use std::sync::Arc;
use std::time::Duration;

use askpass_relay_core::protocol::MAX_REQUEST_BYTES;
use askpass_relay_core::{
    CredentialCallback, InvocationId, PromptRequest, ProtocolError, Request, Response,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::endpoint::{Connection, EndpointListener};

/// How long a connected helper may take to send its request line.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed accept so a persistent error (EMFILE) doesn't spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// The relay for a single invocation.
pub struct RelayServer {
    invocation_id: InvocationId,
    callback: Arc<dyn CredentialCallback>,
    prompt_timeout: Duration,
    /// Serializes prompts within the invocation.
    in_flight: Mutex<()>,
}

impl RelayServer {
    /// Create a relay for `invocation_id`.
    pub fn new(
        invocation_id: InvocationId,
        callback: Arc<dyn CredentialCallback>,
        prompt_timeout: Duration,
    ) -> Self {
        Self {
            invocation_id,
            callback,
            prompt_timeout,
            in_flight: Mutex::new(()),
        }
    }

    /// The invocation this relay serves.
    pub fn invocation_id(&self) -> &InvocationId {
        &self.invocation_id
    }

    /// Run the accept loop on a background task.
    pub fn spawn(self, listener: EndpointListener) -> RelayHandle {
        let invocation_id = self.invocation_id.clone();
        RelayHandle {
            invocation_id,
            task: tokio::spawn(self.run(listener)),
        }
    }

    /// Accept and service connections until the task is aborted.
    pub async fn run(self, mut listener: EndpointListener) {
        let server = Arc::new(self);
        let mut connections = JoinSet::new();
        info!(invocation = ?server.invocation_id, "Relay listening for helper connections");

        loop {
            match listener.accept().await {
                Ok(connection) => {
                    debug!(invocation = ?server.invocation_id, "Accepted helper connection");
                    let server = Arc::clone(&server);
                    connections.spawn(async move { server.handle_connection(connection).await });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept helper connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }

            // Reap finished connection tasks
            while connections.try_join_next().is_some() {}
        }
    }

    /// Handle a single helper connection.
    async fn handle_connection(&self, connection: Connection) {
        let mut reader = BufReader::new(connection);
        let mut line = String::new();

        // Read request
        let read = tokio::time::timeout(
            REQUEST_READ_TIMEOUT,
            (&mut reader).take(MAX_REQUEST_BYTES).read_line(&mut line),
        )
        .await;
        match read {
            Err(_) => {
                warn!("Helper sent no request in time; dropping connection");
                return;
            }
            Ok(Ok(0)) => {
                debug!("Helper disconnected without sending request");
                return;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to read request");
                return;
            }
        }

        if !line.ends_with('\n') {
            warn!(
                bytes = line.len(),
                "Protocol violation: request unterminated or over size limit; dropping connection"
            );
            return;
        }

        // Parse request
        let request = match Request::parse(line.trim_end()) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "Protocol violation: malformed request; dropping connection");
                return;
            }
        };

        // Handle request
        let response = match self.handle_request(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    invocation = ?self.invocation_id,
                    error = %e,
                    "Protocol violation: rejecting request; dropping connection"
                );
                return;
            }
        };

        // Send response
        let mut connection = reader.into_inner();
        if let Err(e) = send_response(&mut connection, &response).await {
            error!(error = %e, "Failed to send response");
        }
    }

    /// Decide the response to a parsed request.
    ///
    /// Fails only for requests that carry another invocation's id; the
    /// caller drops those without a reply. A callback that refuses, or
    /// doesn't answer within the prompt timeout, yields [`Response::Deny`].
    pub async fn handle_request(&self, request: Request) -> Result<Response, ProtocolError> {
        if !self.invocation_id.verify(&request.invocation_id) {
            return Err(ProtocolError::InvocationMismatch);
        }

        debug!(
            invocation = ?self.invocation_id,
            kind = %request.kind,
            caller_pid = ?request.caller_pid,
            helper_deadline_ms = ?request.deadline_millis,
            "Forwarding prompt to credential callback"
        );

        let prompt = PromptRequest {
            invocation_id: self.invocation_id.clone(),
            prompt: request.prompt,
            kind: request.kind,
            caller_pid: request.caller_pid,
        };

        // The timeout covers waiting for earlier prompts too: the helper's
        // own budget started when it connected.
        let answer = tokio::time::timeout(self.prompt_timeout, async {
            let _guard = self.in_flight.lock().await;
            self.callback.respond(prompt).await
        })
        .await;

        match answer {
            Ok(Some(secret)) => {
                debug!(invocation = ?self.invocation_id, "Prompt answered");
                Ok(Response::answer(secret))
            }
            Ok(None) => {
                info!(invocation = ?self.invocation_id, "Prompt refused by callback");
                Ok(Response::Deny)
            }
            Err(_) => {
                warn!(
                    invocation = ?self.invocation_id,
                    timeout_ms = self.prompt_timeout.as_millis() as u64,
                    "Prompt timed out; refusing"
                );
                Ok(Response::Deny)
            }
        }
    }
}

/// Send a response and close the write side.
async fn send_response(
    connection: &mut Connection,
    response: &Response,
) -> Result<(), std::io::Error> {
    let encoded = response.encode();
    connection.write_all(&encoded).await?;
    connection.shutdown().await
}

/// Handle to a running relay. Dropping it stops the relay.
#[derive(Debug)]
pub struct RelayHandle {
    invocation_id: InvocationId,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Stop accepting connections and abort in-flight exchanges.
    ///
    /// Helpers still waiting see their connection close and exit non-zero.
    pub fn shutdown(&self) {
        if !self.task.is_finished() {
            debug!(invocation = ?self.invocation_id, "Shutting down relay");
        }
        self.task.abort();
    }

    /// Whether the relay task has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
