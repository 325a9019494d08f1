#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! One-shot broadcast barrier.
//!
//! A [`Barrier`] signals a permanent state change, for example that shutdown has been
//! requested. It starts pending, falls exactly once, and stays fallen. Any number of threads
//! or tasks can check it, block on it or await it through the handle returned by
//! [`Barrier::fallen`].
//!
//! Barriers can also be linked: after `a.forward(&b)`, `b` falls whenever `a` does. Links are
//! dropped as soon as they have been used, so a fallen barrier does not keep anything alive
//! and nothing keeps a fallen barrier alive on its behalf.
//!
//! # Example
//!
//! ```rust
//! use std::thread;
//!
//! use switchy_barrier::Barrier;
//!
//! let shutdown = Barrier::new();
//!
//! let waiter = {
//!     let shutdown = shutdown.clone();
//!     thread::spawn(move || {
//!         let _guard = shutdown.fall_on_drop();
//!         // Many threads can wait on the barrier
//!         shutdown.wait();
//!     })
//! };
//!
//! let finisher = {
//!     let shutdown = shutdown.clone();
//!     thread::spawn(move || {
//!         let _guard = shutdown.fall_on_drop();
//!         // When this thread returns, every wait on the barrier is released
//!     })
//! };
//!
//! waiter.join().unwrap();
//! finisher.join().unwrap();
//! assert!(shutdown.is_fallen());
//! ```

mod assert;
mod guard;
mod signal;

use std::{
    any::Any,
    collections::BTreeMap,
    fmt,
    hash::{Hash, Hasher},
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, ThreadId},
};

use crate::{assert::barrier_assert, signal::Signal};

pub use guard::FallGuard;
pub use signal::Fallen;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

type OnFall = Box<dyn FnOnce() + Send + 'static>;

/// A one-shot broadcast signal that can forward its fall to other barriers.
///
/// `Barrier` is a handle: clones refer to the same barrier, and equality compares identity.
/// A default-constructed barrier is ready to use; its internal state is created on first use.
///
/// All operations may be called from any number of threads at once.
#[derive(Clone)]
pub struct Barrier {
    node: Arc<Node>,
}

struct Node {
    id: u64,
    claimed: AtomicBool,
    firer: OnceLock<ThreadId>,
    on_fall: Mutex<Option<OnFall>>,
    state: OnceLock<State>,
}

#[derive(Default)]
struct State {
    signal: Arc<Signal>,
    edges: Mutex<Edges>,
}

/// Both maps are empty once `fallen` is set.
#[derive(Default)]
struct Edges {
    fallen: bool,
    forwards: BTreeMap<u64, Barrier>,
    // Back-references are only used to retract the matching forward edges on fall.
    backwards: BTreeMap<u64, Weak<Node>>,
}

impl Node {
    fn state(&self) -> &State {
        self.state.get_or_init(|| {
            log::trace!("state: initializing barrier id={}", self.id);
            State::default()
        })
    }
}

impl State {
    fn lock_edges(&self) -> MutexGuard<'_, Edges> {
        self.edges.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Barrier {
    /// Creates a new pending barrier.
    #[must_use]
    pub fn new() -> Self {
        Self {
            node: Arc::new(Node {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                claimed: AtomicBool::new(false),
                firer: OnceLock::new(),
                on_fall: Mutex::new(None),
                state: OnceLock::new(),
            }),
        }
    }

    /// Sets the hook invoked when this barrier falls. See [`Barrier::set_on_fall`].
    #[must_use]
    pub fn with_on_fall(self, on_fall: impl FnOnce() + Send + 'static) -> Self {
        self.set_on_fall(on_fall);
        self
    }

    /// Sets the hook invoked when this barrier falls, replacing any previous hook.
    ///
    /// The hook runs exactly once, synchronously on the thread that makes the barrier fall,
    /// before the barrier is observably fallen and before any forwarded barrier falls. A slow
    /// hook therefore delays every observer and every forward.
    ///
    /// The hook should be set before the barrier can fall. Setting it while a fall is already
    /// in progress may or may not run it.
    pub fn set_on_fall(&self, on_fall: impl FnOnce() + Send + 'static) {
        *self
            .node
            .on_fall
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(on_fall));
    }

    /// Returns a handle that becomes ready once this barrier has fallen.
    ///
    /// The handle can be polled with [`Fallen::is_fallen`], blocked on with [`Fallen::wait`] or
    /// awaited.
    #[must_use]
    pub fn fallen(&self) -> Fallen {
        Fallen::new(self.node.state().signal.clone())
    }

    /// Returns `true` once this barrier has fallen.
    #[must_use]
    pub fn is_fallen(&self) -> bool {
        self.node
            .state
            .get()
            .is_some_and(|state| state.signal.is_ready())
    }

    /// Blocks the current thread until this barrier has fallen.
    pub fn wait(&self) {
        self.node.state().signal.wait();
    }

    /// Returns a guard that makes this barrier fall when dropped.
    pub fn fall_on_drop(&self) -> FallGuard {
        FallGuard::new(self.clone())
    }

    /// Makes this barrier fall.
    ///
    /// Only the first call has any effect, no matter how many threads call it. That call runs
    /// the [`on_fall`](Barrier::set_on_fall) hook, releases every observer, makes every
    /// forwarded barrier fall and then retracts the forward edges other barriers hold to this
    /// one. A concurrent call from another thread blocks until the barrier is fallen, so the
    /// barrier is always fallen once `fall` returns. A call made from the thread already
    /// running the fall (from the hook, or through a forward cycle) returns immediately.
    ///
    /// Two hooks that each make the other's barrier fall from different threads at the same
    /// time will wait on each other forever.
    ///
    /// Forwarding happens recursively on the calling thread, so very long forward chains use a
    /// correspondingly deep stack.
    ///
    /// # Panics
    ///
    /// * If the `on_fall` hook of this barrier or of a forwarded barrier panics. The panic is
    ///   resumed only after this barrier has completely fallen.
    pub fn fall(&self) {
        let state = self.node.state();

        if self.node.claimed.swap(true, Ordering::AcqRel) {
            if self.node.firer.get() == Some(&thread::current().id()) {
                log::trace!("fall: {self:?} already falling on this thread");
            } else {
                log::trace!("fall: {self:?} already falling, waiting");
                state.signal.wait();
            }
            return;
        }
        let _ = self.node.firer.set(thread::current().id());

        log::trace!("fall: {self:?}");

        let on_fall = self
            .node
            .on_fall
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let mut first_panic = on_fall.and_then(catch);

        let (forwards, backwards) = {
            let mut edges = state.lock_edges();
            edges.fallen = true;
            (
                std::mem::take(&mut edges.forwards),
                std::mem::take(&mut edges.backwards),
            )
        };

        state.signal.release();

        log::trace!(
            "fall: {self:?} forwarding to {} barrier(s), retracting {} back-reference(s)",
            forwards.len(),
            backwards.len(),
        );

        for target in forwards.into_values() {
            if let Some(payload) = catch(|| target.fall()) {
                first_panic.get_or_insert(payload);
            }
        }

        for predecessor in backwards.into_values().filter_map(|node| node.upgrade()) {
            let retracted = predecessor.state().lock_edges().forwards.remove(&self.node.id);
            log::debug!(
                "fall: retracted edge id={} -> {self:?} (present={})",
                predecessor.id,
                retracted.is_some(),
            );
        }

        {
            let edges = state.lock_edges();
            barrier_assert!(
                edges.forwards.is_empty() && edges.backwards.is_empty(),
                "fallen barrier id={} still has {} forward(s) and {} back-reference(s)",
                self.node.id,
                edges.forwards.len(),
                edges.backwards.len(),
            );
        }

        if let Some(payload) = first_panic {
            log::debug!("fall: {self:?} resuming on_fall panic");
            panic::resume_unwind(payload);
        }
    }

    /// Makes `target` fall whenever this barrier falls.
    ///
    /// If this barrier has already fallen, `target` falls immediately on the calling thread and
    /// no edge is kept. If `target` has already fallen there is nothing to do. Forwarding to the
    /// same target twice has the same effect as forwarding once, and forwarding a barrier to
    /// itself is a no-op.
    ///
    /// Cycles are allowed: every barrier in a cycle falls exactly once.
    ///
    /// # Panics
    ///
    /// * If this barrier has already fallen and `target`'s `on_fall` hook panics
    pub fn forward(&self, target: &Self) {
        if self == target {
            log::trace!("forward: ignoring self-forward of {self:?}");
            return;
        }

        let source_state = self.node.state();
        let target_state = target.node.state();

        let source_fallen = {
            // Lock in id order so concurrent forwards between the same pair cannot deadlock.
            let (mut source_edges, mut target_edges) = if self.node.id < target.node.id {
                let source_edges = source_state.lock_edges();
                (source_edges, target_state.lock_edges())
            } else {
                let target_edges = target_state.lock_edges();
                (source_state.lock_edges(), target_edges)
            };

            if source_edges.fallen {
                true
            } else {
                if !target_edges.fallen {
                    source_edges
                        .forwards
                        .insert(target.node.id, target.clone());
                    target_edges
                        .backwards
                        .retain(|_, predecessor| predecessor.strong_count() > 0);
                    target_edges
                        .backwards
                        .insert(self.node.id, Arc::downgrade(&self.node));
                }
                false
            }
        };

        if source_fallen {
            log::trace!("forward: {self:?} already fallen, falling {target:?} now");
            target.fall();
        } else {
            log::trace!("forward: {self:?} -> {target:?}");
        }
    }

    /// Number of barriers this barrier will make fall.
    #[must_use]
    pub fn forward_count(&self) -> usize {
        self.node
            .state
            .get()
            .map_or(0, |state| state.lock_edges().forwards.len())
    }

    /// Number of live barriers that currently forward to this barrier.
    #[must_use]
    pub fn backward_count(&self) -> usize {
        self.node.state.get().map_or(0, |state| {
            state
                .lock_edges()
                .backwards
                .values()
                .filter(|predecessor| predecessor.strong_count() > 0)
                .count()
        })
    }

    /// Returns `true` if this barrier currently holds a forward edge to `target`.
    #[must_use]
    pub fn forwards_to(&self, target: &Self) -> bool {
        self.node.state.get().is_some_and(|state| {
            state
                .lock_edges()
                .forwards
                .contains_key(&target.node.id)
        })
    }

    /// Returns `true` if `source` currently holds a forward edge to this barrier.
    #[must_use]
    pub fn forwarded_from(&self, source: &Self) -> bool {
        self.node.state.get().is_some_and(|state| {
            state
                .lock_edges()
                .backwards
                .get(&source.node.id)
                .is_some_and(|predecessor| predecessor.strong_count() > 0)
        })
    }
}

fn catch(f: impl FnOnce()) -> Option<Box<dyn Any + Send>> {
    panic::catch_unwind(AssertUnwindSafe(f)).err()
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier")
            .field("id", &self.node.id)
            .field("fallen", &self.is_fallen())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Barrier {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

impl Eq for Barrier {}

impl Hash for Barrier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use pretty_assertions::assert_eq;

    use super::*;

    fn counting_barrier() -> (Barrier, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let barrier = Barrier::new().with_on_fall({
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        (barrier, count)
    }

    #[test_log::test]
    fn default_barrier_is_pending_and_uninitialized() {
        let barrier = Barrier::default();
        assert!(!barrier.is_fallen());
        assert!(barrier.node.state.get().is_none());
        assert_eq!(barrier.forward_count(), 0);
        assert_eq!(barrier.backward_count(), 0);
    }

    #[test_log::test]
    fn fall_initializes_state() {
        let barrier = Barrier::default();
        barrier.fall();
        assert!(barrier.node.state.get().is_some());
        assert!(barrier.is_fallen());
    }

    #[test_log::test]
    fn fall_runs_hook_once() {
        let (barrier, count) = counting_barrier();
        barrier.fall();
        barrier.fall();
        barrier.fall();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn hook_runs_before_barrier_is_observably_fallen() {
        let barrier = Barrier::new();
        let seen = Arc::new(Mutex::new(None));
        barrier.set_on_fall({
            let barrier = barrier.clone();
            let seen = seen.clone();
            move || {
                *seen.lock().unwrap() = Some(barrier.is_fallen());
            }
        });

        barrier.fall();

        assert_eq!(*seen.lock().unwrap(), Some(false));
        assert!(barrier.is_fallen());
    }

    #[test_log::test]
    fn hook_runs_before_forwarded_barrier_falls() {
        let target = Barrier::new();
        let seen = Arc::new(Mutex::new(None));
        let source = Barrier::new().with_on_fall({
            let target = target.clone();
            let seen = seen.clone();
            move || {
                *seen.lock().unwrap() = Some(target.is_fallen());
            }
        });
        source.forward(&target);

        source.fall();

        assert_eq!(*seen.lock().unwrap(), Some(false));
        assert!(target.is_fallen());
    }

    #[test_log::test]
    fn set_on_fall_replaces_previous_hook() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let barrier = Barrier::new();
        barrier.set_on_fall({
            let calls = calls.clone();
            move || calls.lock().unwrap().push("first")
        });
        barrier.set_on_fall({
            let calls = calls.clone();
            move || calls.lock().unwrap().push("second")
        });

        barrier.fall();

        assert_eq!(*calls.lock().unwrap(), vec!["second"]);
    }

    #[test_log::test]
    fn forward_records_both_directions() {
        let source = Barrier::new();
        let target = Barrier::new();

        source.forward(&target);

        assert!(source.forwards_to(&target));
        assert!(target.forwarded_from(&source));
        assert_eq!(source.forward_count(), 1);
        assert_eq!(target.backward_count(), 1);
        assert!(!target.forwards_to(&source));
    }

    #[test_log::test]
    fn forward_is_idempotent() {
        let source = Barrier::new();
        let (target, count) = counting_barrier();

        source.forward(&target);
        source.forward(&target);

        assert_eq!(source.forward_count(), 1);
        assert_eq!(target.backward_count(), 1);

        source.fall();

        assert!(target.is_fallen());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn forward_to_self_is_ignored() {
        let barrier = Barrier::new();
        barrier.forward(&barrier);
        assert_eq!(barrier.forward_count(), 0);
        assert_eq!(barrier.backward_count(), 0);
        assert!(!barrier.is_fallen());
    }

    #[test_log::test]
    fn forward_from_fallen_fires_target_without_edge() {
        let source = Barrier::new();
        let target = Barrier::new();
        source.fall();

        source.forward(&target);

        assert!(target.is_fallen());
        assert_eq!(source.forward_count(), 0);
        assert_eq!(target.backward_count(), 0);
    }

    #[test_log::test]
    fn forward_to_fallen_target_keeps_no_edge() {
        let source = Barrier::new();
        let target = Barrier::new();
        target.fall();

        source.forward(&target);

        assert!(!source.is_fallen());
        assert_eq!(source.forward_count(), 0);
        assert_eq!(target.backward_count(), 0);
    }

    #[test_log::test]
    fn target_falling_does_not_fire_source() {
        let source = Barrier::new();
        let target = Barrier::new();
        source.forward(&target);

        target.fall();

        assert!(!source.is_fallen());
        assert_eq!(source.forward_count(), 0);
    }

    #[test_log::test]
    fn fall_clears_edges_on_both_sides() {
        let upstream = Barrier::new();
        let barrier = Barrier::new();
        let downstream = Barrier::new();
        upstream.forward(&barrier);
        barrier.forward(&downstream);

        barrier.fall();

        assert_eq!(barrier.forward_count(), 0);
        assert_eq!(barrier.backward_count(), 0);
        assert!(!upstream.forwards_to(&barrier));
        assert_eq!(upstream.forward_count(), 0);
        assert!(!downstream.forwarded_from(&barrier));
        assert!(downstream.is_fallen());
        assert!(!upstream.is_fallen());
    }

    #[test_log::test]
    fn dropped_predecessor_is_not_counted() {
        let target = Barrier::new();
        {
            let source = Barrier::new();
            source.forward(&target);
            assert_eq!(target.backward_count(), 1);
        }
        assert_eq!(target.backward_count(), 0);

        let other = Barrier::new();
        other.forward(&target);
        assert_eq!(target.backward_count(), 1);
        assert_eq!(target.node.state().lock_edges().backwards.len(), 1);
    }

    #[test_log::test]
    fn cycle_falls_each_barrier_once() {
        let (a, a_count) = counting_barrier();
        let (b, b_count) = counting_barrier();
        a.forward(&b);
        b.forward(&a);

        a.fall();

        assert!(a.is_fallen());
        assert!(b.is_fallen());
        assert_eq!(a_count.load(Ordering::SeqCst), 1);
        assert_eq!(b_count.load(Ordering::SeqCst), 1);
        assert_eq!(a.forward_count(), 0);
        assert_eq!(b.forward_count(), 0);
    }

    #[test_log::test]
    fn panicking_hook_still_completes_fall() {
        let barrier = Barrier::new().with_on_fall(|| panic!("hook failed"));
        let target = Barrier::new();
        barrier.forward(&target);

        let result = panic::catch_unwind(AssertUnwindSafe(|| barrier.fall()));

        assert!(result.is_err());
        assert!(barrier.is_fallen());
        assert!(target.is_fallen());
        assert_eq!(target.backward_count(), 0);
    }

    #[test_log::test]
    fn panicking_forwarded_hook_does_not_stop_other_forwards() {
        let source = Barrier::new();
        let failing = Barrier::new().with_on_fall(|| panic!("hook failed"));
        let (healthy, count) = counting_barrier();
        source.forward(&failing);
        source.forward(&healthy);

        let result = panic::catch_unwind(AssertUnwindSafe(|| source.fall()));

        assert!(result.is_err());
        assert!(source.is_fallen());
        assert!(failing.is_fallen());
        assert!(healthy.is_fallen());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn hook_reentering_fall_returns() {
        let count = Arc::new(AtomicUsize::new(0));
        let barrier = Barrier::new();
        barrier.set_on_fall({
            let barrier = barrier.clone();
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
                barrier.fall();
                assert!(!barrier.is_fallen());
            }
        });

        barrier.fall();

        assert!(barrier.is_fallen());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn concurrent_first_use_shares_one_signal() {
        for _ in 0..50 {
            let barrier = Barrier::new();
            let start = Arc::new(std::sync::Barrier::new(8));

            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let barrier = barrier.clone();
                    let start = start.clone();
                    std::thread::spawn(move || {
                        start.wait();
                        barrier.fallen()
                    })
                })
                .collect();

            let observers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            let first = barrier.fallen();
            assert!(observers.iter().all(|o| o.shares_signal_with(&first)));

            barrier.fall();
            assert!(observers.iter().all(Fallen::is_fallen));
        }
    }

    #[test_log::test]
    fn equality_is_identity() {
        let a = Barrier::new();
        let b = Barrier::new();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
