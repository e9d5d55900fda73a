//! Core types and utilities for askpass-relay.
//!
//! This crate holds everything both sides of the relay agree on: the
//! askpass helper that git/ssh exec, and the per-invocation relay server
//! living inside the application. It has no async runtime dependency so the
//! helper binary stays small.
//!
//! # Modules
//!
//! - [`types`]: Invocation identity and prompt data (`InvocationId`, `PromptKind`, `PromptRequest`)
//! - [`protocol`]: Wire format (`Request`, `Response`) and environment variable names
//! - [`prompt_kind`]: Best-effort classification of git/ssh prompt wording
//! - [`traits`]: The application-facing `CredentialCallback` seam
//! - [`config`]: TOML configuration for timeouts and helper paths
//! - [`client`]: Blocking relay client used by the askpass helper
//!
//! # Example
//!
//! ```
//! use askpass_relay_core::protocol::Request;
//! use askpass_relay_core::types::{InvocationId, PromptKind};
//!
//! let id = InvocationId::generate();
//! let request = Request::new(&id, "Password for 'https://example.com':");
//! assert_eq!(request.kind, PromptKind::Password);
//!
//! let line = request.to_json_line().unwrap();
//! assert!(line.ends_with('\n'));
//! ```

pub mod client;
pub mod config;
pub mod prompt_kind;
pub mod protocol;
pub mod traits;
pub mod types;

pub use client::RelayClient;
pub use config::{ConfigError, RelayConfig};
pub use prompt_kind::{classify, Classification, Confidence};
pub use protocol::{ProtocolError, Request, Response};
pub use traits::{CallbackFuture, CredentialCallback, FnCallback};
pub use types::{InvocationId, PromptKind, PromptRequest};
