//! Scripted credential callback for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use askpass_relay_core::{CallbackFuture, CredentialCallback, PromptRequest};
use secrecy::SecretString;

/// A credential callback with a predetermined outcome.
///
/// Records every prompt it receives so tests can assert on what git or
/// ssh actually asked.
///
/// # Example
///
/// ```
/// use askpass_relay::MockCallback;
///
/// // Answers every prompt with the same secret
/// let mock = MockCallback::with_answer("s3cret");
///
/// // Refuses every prompt
/// let refusing = MockCallback::refusing();
/// # let _ = (mock, refusing);
/// ```
#[derive(Debug, Clone)]
pub struct MockCallback {
    answer: Option<SecretString>,
    never_resolves: bool,
    delay: Option<Duration>,
    call_count: Arc<AtomicUsize>,
    prompts: Arc<Mutex<Vec<PromptRequest>>>,
}

impl MockCallback {
    fn new(answer: Option<SecretString>, never_resolves: bool) -> Self {
        Self {
            answer,
            never_resolves,
            delay: None,
            call_count: Arc::new(AtomicUsize::new(0)),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that answers with `secret`.
    pub fn with_answer(secret: impl Into<String>) -> Self {
        Self::new(Some(SecretString::from(secret.into())), false)
    }

    /// Create a mock that refuses every prompt.
    pub fn refusing() -> Self {
        Self::new(None, false)
    }

    /// Create a mock whose answer never arrives.
    pub fn never_resolves() -> Self {
        Self::new(None, true)
    }

    /// Add a delay before responding (useful for timeout testing).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Get the number of times the callback was invoked.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Get a clone of the call counter for external tracking.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.call_count)
    }

    /// Prompts received so far, in order.
    pub fn prompts(&self) -> Vec<PromptRequest> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for MockCallback {
    fn default() -> Self {
        Self::with_answer("mock-secret")
    }
}

impl CredentialCallback for MockCallback {
    fn respond(&self, request: PromptRequest) -> CallbackFuture<'_> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        let answer = self.answer.clone();
        let never_resolves = self.never_resolves;
        let delay = self.delay;

        Box::pin(async move {
            if never_resolves {
                std::future::pending::<()>().await;
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            answer
        })
    }
}
