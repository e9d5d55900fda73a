//! Trait definitions for pluggable components.
//!
//! The relay server knows nothing about how credentials are obtained; it
//! hands each [`PromptRequest`] to a [`CredentialCallback`] supplied by the
//! application and waits for the answer. This keeps UI concerns out of the
//! relay and lets tests substitute scripted callbacks.

use std::future::Future;
use std::pin::Pin;

use secrecy::SecretString;

use crate::types::PromptRequest;

/// Future returned by [`CredentialCallback::respond`].
///
/// Resolves to `Some(secret)` to answer the prompt or `None` to refuse it.
pub type CallbackFuture<'a> = Pin<Box<dyn Future<Output = Option<SecretString>> + Send + 'a>>;

/// Application-supplied source of credentials.
///
/// Implementations may take as long as they like (e.g. while a dialog is
/// open); the relay enforces the prompt timeout and discards answers that
/// arrive too late.
///
/// # Example
///
/// ```
/// use askpass_relay_core::{CallbackFuture, CredentialCallback, PromptRequest};
/// use secrecy::SecretString;
///
/// struct Fixed(&'static str);
///
/// impl CredentialCallback for Fixed {
///     fn respond(&self, _request: PromptRequest) -> CallbackFuture<'_> {
///         let secret = self.0;
///         Box::pin(async move { Some(SecretString::from(secret)) })
///     }
/// }
/// ```
pub trait CredentialCallback: Send + Sync {
    /// Answer one prompt.
    fn respond(&self, request: PromptRequest) -> CallbackFuture<'_>;
}

/// Adapter turning an async closure into a [`CredentialCallback`].
///
/// ```
/// use askpass_relay_core::{FnCallback, PromptRequest};
/// use secrecy::SecretString;
///
/// let callback = FnCallback::new(|request: PromptRequest| async move {
///     request
///         .prompt
///         .starts_with("Password")
///         .then(|| SecretString::from("hunter2"))
/// });
/// # let _ = callback;
/// ```
pub struct FnCallback<F>(F);

impl<F> FnCallback<F> {
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F, Fut> CredentialCallback for FnCallback<F>
where
    F: Fn(PromptRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Option<SecretString>> + Send + 'static,
{
    fn respond(&self, request: PromptRequest) -> CallbackFuture<'_> {
        Box::pin((self.0)(request))
    }
}
