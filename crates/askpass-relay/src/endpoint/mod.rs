//! Per-invocation relay endpoints.
//!
//! Every invocation gets its own endpoint whose name embeds the invocation
//! id, so concurrent invocations never share a listener:
//!
//! - Unix: `<runtime dir>/askpass-relay-<id>/socket`, directory mode 0700,
//!   socket mode 0600
//! - Windows: `\\.\pipe\askpass-relay-<id>`, remote clients rejected
//!
//! [`bind`] returns the [`RelayEndpoint`] (the address exported to the child
//! and the owner of the filesystem entries) and the [`EndpointListener`]
//! the relay server accepts connections from. Releasing the endpoint is
//! idempotent and also happens on drop.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::{bind, default_base_dir, Connection, EndpointListener, RelayEndpoint};
#[cfg(windows)]
pub use windows::{bind, default_base_dir, Connection, EndpointListener, RelayEndpoint};

/// Prefix shared by all endpoint names.
pub const ENDPOINT_PREFIX: &str = "askpass-relay-";
