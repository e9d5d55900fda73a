//! Error types for the relay side.
//!
//! IPC failures inside a running relay never surface here: a malformed or
//! foreign request is logged and dropped, a slow callback turns into a
//! refusal. What does surface are failures of the invocation lifecycle
//! itself.

use askpass_relay_core::ConfigError;
use thiserror::Error;

/// Error type for endpoint creation.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// Failed to create the private endpoint directory.
    #[error("failed to create endpoint directory: {0}")]
    DirectoryCreationFailed(#[source] std::io::Error),

    /// Failed to bind the socket or create the pipe.
    #[error("failed to bind endpoint: {0}")]
    BindFailed(#[source] std::io::Error),

    /// The endpoint address can't be passed through the environment.
    #[error("invalid endpoint path: {0}")]
    InvalidPath(String),
}

/// Errors surfaced to the caller of the spawner.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The relay endpoint could not be set up.
    #[error("relay endpoint unavailable: {0}")]
    EndpointUnavailable(#[from] EndpointError),

    /// The command could not be started.
    #[error("failed to spawn {program}: {source}")]
    ProcessSpawnFailure {
        /// The program that failed to start.
        program: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Processes of the group survived every kill pass.
    #[error("{survivors} process(es) in group {group} survived termination")]
    PartialTermination {
        /// Leader pid of the group.
        group: u32,
        /// Number of live processes left.
        survivors: usize,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error while supervising the process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The supervising task panicked or was aborted.
    #[error("invocation supervisor failed: {0}")]
    Supervisor(String),
}
