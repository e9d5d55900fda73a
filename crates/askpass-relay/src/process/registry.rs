//! Registry of live invocations.
//!
//! Maps every running invocation to its process group and cancellation
//! signal, so the application can cancel by id and terminate whatever is
//! still running when it shuts down. Owned by the spawner and shared by
//! `Arc`; there is no process-wide instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use askpass_relay_core::InvocationId;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{GroupControl, ProcessGroup};
use crate::error::RelayError;

struct LiveInvocation {
    group: ProcessGroup,
    cancel: Arc<watch::Sender<bool>>,
}

/// Live invocations of one spawner.
pub struct GroupRegistry {
    control: Arc<dyn GroupControl>,
    live: Mutex<HashMap<InvocationId, LiveInvocation>>,
}

impl GroupRegistry {
    /// Create an empty registry terminating groups through `control`.
    pub fn new(control: Arc<dyn GroupControl>) -> Self {
        Self {
            control,
            live: Mutex::new(HashMap::new()),
        }
    }

    fn live(&self) -> MutexGuard<'_, HashMap<InvocationId, LiveInvocation>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(
        &self,
        id: InvocationId,
        group: ProcessGroup,
        cancel: Arc<watch::Sender<bool>>,
    ) {
        debug!(invocation = ?id, group = %group, "Registered invocation");
        self.live().insert(id, LiveInvocation { group, cancel });
    }

    /// Forget an invocation. Returns whether it was registered.
    pub(crate) fn remove(&self, id: &InvocationId) -> bool {
        let removed = self.live().remove(id).is_some();
        if removed {
            debug!(invocation = ?id, "Unregistered invocation");
        }
        removed
    }

    /// Request cancellation of a running invocation.
    ///
    /// Returns `false` if no invocation with that id is running.
    pub fn cancel(&self, id: &InvocationId) -> bool {
        match self.live().get(id) {
            Some(live) => {
                info!(invocation = ?id, "Cancelling invocation");
                live.cancel.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Process group of a running invocation.
    pub fn group(&self, id: &InvocationId) -> Option<ProcessGroup> {
        self.live().get(id).map(|live| live.group)
    }

    /// Number of running invocations.
    pub fn len(&self) -> usize {
        self.live().len()
    }

    /// Whether no invocation is running.
    pub fn is_empty(&self) -> bool {
        self.live().is_empty()
    }

    /// Cancel and terminate everything still registered.
    ///
    /// Meant for application shutdown. Returns the number of groups swept;
    /// fails with the first termination error after attempting all of them.
    pub async fn sweep(&self) -> Result<usize, RelayError> {
        let leftovers: Vec<(InvocationId, LiveInvocation)> = self.live().drain().collect();
        if leftovers.is_empty() {
            return Ok(0);
        }

        info!(count = leftovers.len(), "Sweeping leftover process groups");
        let mut first_error = None;
        for (id, live) in &leftovers {
            live.cancel.send_replace(true);
            if let Err(e) = self.control.terminate_group(live.group).await {
                warn!(invocation = ?id, error = %e, "Failed to terminate leftover group");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(leftovers.len()),
        }
    }
}

impl std::fmt::Debug for GroupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupRegistry")
            .field("live", &self.len())
            .finish()
    }
}
