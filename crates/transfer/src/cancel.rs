//! One-shot transfer cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::TransferError;

/// Side effect run by an aborting cancel.
pub type CancelAction = Box<dyn FnOnce() + Send>;

/// Cancels one transfer, pausing it or aborting it.
///
/// Cloning shares the hook. The first call to [`CancelHook::cancel`] wins:
/// with `is_abort` it runs the cleaner (local artifacts) and then the
/// aborter (remote multipart upload) before waking waiters. Every later
/// call is a no-op.
#[derive(Clone, Default)]
pub struct CancelHook {
    inner: Arc<HookInner>,
}

#[derive(Default)]
struct HookInner {
    fired: AtomicBool,
    token: CancellationToken,
    effects: Mutex<Effects>,
}

#[derive(Default)]
struct Effects {
    aborted: bool,
    cleaner: Option<CancelAction>,
    aborter: Option<CancelAction>,
}

impl CancelHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Returns `true` if this call fired the hook.
    pub fn cancel(&self, is_abort: bool) -> bool {
        if self
            .inner
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        if is_abort {
            let (cleaner, aborter) = {
                let mut effects = self.effects();
                effects.aborted = true;
                (effects.cleaner.take(), effects.aborter.take())
            };
            debug!(
                has_cleaner = cleaner.is_some(),
                has_aborter = aborter.is_some(),
                "transfer abort requested"
            );
            if let Some(clean) = cleaner {
                clean();
            }
            if let Some(abort) = aborter {
                abort();
            }
        } else {
            debug!("transfer cancel requested");
        }

        self.inner.token.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Returns `true` if the hook fired with `is_abort`.
    pub fn is_aborted(&self) -> bool {
        self.effects().aborted
    }

    /// Token cancelled once the hook's effects have run.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Resolves once the hook has fired and its effects have run.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// Registers the local cleanup. Runs at once if the hook already aborted.
    pub(crate) fn set_cleaner(&self, action: impl FnOnce() + Send + 'static) {
        self.register(Box::new(action), |e| &mut e.cleaner);
    }

    /// Registers the remote abort. Runs at once if the hook already aborted.
    pub(crate) fn set_aborter(&self, action: impl FnOnce() + Send + 'static) {
        self.register(Box::new(action), |e| &mut e.aborter);
    }

    /// Error reported by a transfer stopped by this hook.
    pub(crate) fn stop_error(&self) -> TransferError {
        if self.is_aborted() {
            TransferError::Aborted
        } else {
            TransferError::Cancelled
        }
    }

    fn register(&self, action: CancelAction, slot: fn(&mut Effects) -> &mut Option<CancelAction>) {
        let late = {
            let mut effects = self.effects();
            if effects.aborted {
                Some(action)
            } else {
                *slot(&mut effects) = Some(action);
                None
            }
        };
        if let Some(run) = late {
            run();
        }
    }

    fn effects(&self) -> std::sync::MutexGuard<'_, Effects> {
        self.inner
            .effects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CancelHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHook")
            .field("cancelled", &self.is_cancelled())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}
