//! One-shot broadcast signal backing every [`Barrier`](crate::Barrier).
//!
//! A [`Signal`] starts pending and is released exactly once. Tasks await the underlying
//! [`CancellationToken`]; blocked threads park on a condvar that is notified under the same
//! lock the token is cancelled under.

use std::{
    future::IntoFuture,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

#[derive(Debug, Default)]
pub(crate) struct Signal {
    token: CancellationToken,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl Signal {
    pub(crate) fn is_ready(&self) -> bool {
        self.token.is_cancelled()
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the signal ready and wakes everyone waiting on it.
    pub(crate) fn release(&self) {
        let guard = self.lock();
        if self.token.is_cancelled() {
            return;
        }
        self.token.cancel();
        drop(guard);

        log::trace!("release: signal released");
        self.condvar.notify_all();
    }

    pub(crate) fn wait(&self) {
        if self.is_ready() {
            return;
        }

        let guard = self.lock();
        let guard = self
            .condvar
            .wait_while(guard, |()| !self.token.is_cancelled())
            .unwrap_or_else(PoisonError::into_inner);
        drop(guard);
    }

    fn cancelled(&self) -> WaitForCancellationFutureOwned {
        self.token.clone().cancelled_owned()
    }
}

/// Observation handle returned by [`Barrier::fallen`](crate::Barrier::fallen).
///
/// A `Fallen` can be checked without blocking ([`Fallen::is_fallen`]), waited on from a thread
/// ([`Fallen::wait`]) or awaited from a task. None of these consume anything: the same handle,
/// or any clone of it, may be checked or awaited again and resolves immediately once the
/// barrier has fallen.
///
/// The handle only keeps the signal alive, not the barrier's forward graph.
///
/// # Examples
///
/// ```rust
/// use switchy_barrier::Barrier;
///
/// let barrier = Barrier::new();
/// let fallen = barrier.fallen();
/// assert!(!fallen.is_fallen());
///
/// barrier.fall();
/// assert!(fallen.is_fallen());
/// fallen.wait();
/// ```
#[derive(Debug, Clone)]
pub struct Fallen {
    signal: Arc<Signal>,
}

impl Fallen {
    pub(crate) const fn new(signal: Arc<Signal>) -> Self {
        Self { signal }
    }

    /// Returns `true` once the owning barrier has fallen.
    #[must_use]
    pub fn is_fallen(&self) -> bool {
        self.signal.is_ready()
    }

    /// Blocks the current thread until the owning barrier has fallen.
    ///
    /// Returns immediately if it already has. Only the calling thread is blocked; the thread
    /// calling [`Barrier::fall`](crate::Barrier::fall) never waits on observers.
    pub fn wait(&self) {
        self.signal.wait();
    }

    #[cfg(test)]
    pub(crate) fn shares_signal_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.signal, &other.signal)
    }
}

impl IntoFuture for Fallen {
    type Output = ();
    type IntoFuture = WaitForCancellationFutureOwned;

    fn into_future(self) -> Self::IntoFuture {
        self.signal.cancelled()
    }
}
