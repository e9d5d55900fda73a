//! Credential relay and process tree control for git subprocesses.
//!
//! This crate runs inside the application. For every git command it:
//!
//! - binds a private relay endpoint named after a fresh invocation id
//! - starts a [`RelayServer`] on it that forwards askpass prompts to the
//!   application's [`CredentialCallback`](askpass_relay_core::CredentialCallback)
//! - spawns the command in its own process group/session with git and ssh
//!   pointed at the `askpass-client` helper
//! - supervises the process tree, terminating all of it on cancel or timeout
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use askpass_relay::{LaunchRequest, Spawner};
//! use askpass_relay_core::{FnCallback, PromptRequest, RelayConfig};
//! use secrecy::SecretString;
//!
//! # async fn example() -> Result<(), askpass_relay::RelayError> {
//! let spawner = Spawner::new(RelayConfig::load()?)?;
//! let callback = Arc::new(FnCallback::new(|_prompt: PromptRequest| async move {
//!     Some(SecretString::from("token"))
//! }));
//!
//! let output = spawner
//!     .run(LaunchRequest::git().args(["fetch", "origin"]), callback)
//!     .await?;
//! println!("exit status: {}", output.status);
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod endpoint;
pub mod error;
pub mod process;
pub mod relay;
pub mod spawner;

// Re-export main components
pub use callback::{DenyAll, MockCallback, TtyCallback};
pub use error::{EndpointError, RelayError};
pub use process::{GroupControl, GroupRegistry, PlatformControl, ProcessGroup};
pub use relay::{RelayHandle, RelayServer};
pub use spawner::{InvocationHandle, InvocationOutput, LaunchRequest, Spawner};
