//! Ready-made credential callbacks.
//!
//! Applications usually supply their own [`CredentialCallback`] (a dialog,
//! a token store). These cover the remaining cases:
//!
//! - [`TtyCallback`]: asks on the controlling terminal, used by the CLI
//! - [`DenyAll`]: refuses every prompt, for non-interactive runs
//! - [`MockCallback`]: scripted answers for tests

mod mock;
mod tty;

pub use mock::MockCallback;
pub use tty::TtyCallback;

use askpass_relay_core::{CallbackFuture, CredentialCallback, PromptRequest};
use tracing::debug;

/// Callback that refuses every prompt.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAll;

impl CredentialCallback for DenyAll {
    fn respond(&self, request: PromptRequest) -> CallbackFuture<'_> {
        debug!(kind = %request.kind, "Refusing prompt");
        Box::pin(async { None })
    }
}
