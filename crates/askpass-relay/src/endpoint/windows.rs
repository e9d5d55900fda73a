use std::io;
use std::path::{Path, PathBuf};

use askpass_relay_core::InvocationId;
use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};
use tracing::debug;

use super::ENDPOINT_PREFIX;
use crate::error::EndpointError;

/// A single accepted helper connection.
pub type Connection = NamedPipeServer;

/// Named pipes live in their own namespace; kept for API parity with Unix.
pub fn default_base_dir() -> PathBuf {
    std::env::temp_dir()
}

/// Name of an invocation's pipe.
///
/// The pipe disappears with its last server handle, so releasing only
/// marks the endpoint as gone.
#[derive(Debug)]
pub struct RelayEndpoint {
    address: String,
    released: bool,
}

impl RelayEndpoint {
    /// Address exported to the helper through the environment.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Mark the endpoint released. Safe to call more than once.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            debug!(pipe = %self.address, "Released relay endpoint");
        }
    }
}

impl Drop for RelayEndpoint {
    fn drop(&mut self) {
        self.release();
    }
}

/// Accepts helper connections for one invocation.
///
/// A named pipe instance serves exactly one client, so a fresh instance is
/// created as soon as the pending one is connected.
#[derive(Debug)]
pub struct EndpointListener {
    name: String,
    next: NamedPipeServer,
}

impl EndpointListener {
    /// Wait for the next helper connection.
    pub async fn accept(&mut self) -> io::Result<Connection> {
        self.next.connect().await?;
        let fresh = ServerOptions::new()
            .reject_remote_clients(true)
            .create(&self.name)?;
        Ok(std::mem::replace(&mut self.next, fresh))
    }
}

/// Create the pipe for `id`.
///
/// `first_pipe_instance` makes creation fail if a pipe with that name
/// already exists.
pub fn bind(
    id: &InvocationId,
    _base: Option<&Path>,
) -> Result<(RelayEndpoint, EndpointListener), EndpointError> {
    let name = format!(r"\\.\pipe\{ENDPOINT_PREFIX}{id}");
    let first = ServerOptions::new()
        .first_pipe_instance(true)
        .reject_remote_clients(true)
        .create(&name)
        .map_err(EndpointError::BindFailed)?;

    debug!(pipe = %name, "Relay endpoint bound");
    Ok((
        RelayEndpoint {
            address: name.clone(),
            released: false,
        },
        EndpointListener { name, next: first },
    ))
}
