/// External cancellation registry handed to a task by the pipeline driver.
///
/// Actions registered before `cancel()` run once when it is called; actions
/// registered afterwards run immediately. Cancelling twice is a no-op.
use std::sync::{Arc, Mutex, PoisonError};

/// A cancellation action. Must be safe to invoke more than once and must not
/// block for long.
pub type CancelAction = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Registry {
    cancelled: bool,
    actions: Vec<CancelAction>,
}

#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Mutex<Registry>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action to run on cancellation.
    pub fn register(&self, action: CancelAction) {
        let mut registry = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if registry.cancelled {
            drop(registry);
            tracing::debug!("token already cancelled, running action immediately");
            action();
            return;
        }
        registry.actions.push(action);
    }

    /// Run every registered action. Only the first call has an effect.
    pub fn cancel(&self) {
        let actions = {
            let mut registry = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if registry.cancelled {
                return;
            }
            registry.cancelled = true;
            std::mem::take(&mut registry.actions)
        };
        tracing::info!(actions = actions.len(), "cancelling task");
        // Actions run outside the lock so they may register or cancel again.
        for action in actions {
            action();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancelled
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
