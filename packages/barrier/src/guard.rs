//! Fall-on-drop guard.

use crate::Barrier;

/// Fires a [`Barrier`] when dropped.
///
/// Hand one to each worker so that whichever worker exits first, normally or by panicking,
/// brings every other worker down with it.
///
/// # Examples
///
/// ```rust
/// use std::thread;
///
/// use switchy_barrier::Barrier;
///
/// let shutdown = Barrier::new();
///
/// let worker = {
///     let _guard = shutdown.fall_on_drop();
///     let shutdown = shutdown.clone();
///     thread::spawn(move || shutdown.wait())
/// };
///
/// worker.join().unwrap();
/// assert!(shutdown.is_fallen());
/// ```
#[derive(Debug)]
#[must_use = "the barrier falls as soon as the guard is dropped"]
pub struct FallGuard {
    barrier: Barrier,
    armed: bool,
}

impl FallGuard {
    pub(crate) const fn new(barrier: Barrier) -> Self {
        Self {
            barrier,
            armed: true,
        }
    }

    /// The barrier this guard will fire.
    #[must_use]
    pub const fn barrier(&self) -> &Barrier {
        &self.barrier
    }

    /// Consumes the guard without firing the barrier.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for FallGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if std::thread::panicking() {
            log::debug!("FallGuard: firing {:?} while unwinding", self.barrier);
        }
        self.barrier.fall();
    }
}
