//! Execution and batching controller.
//!
//! The controller owns three pieces of transient state per registry:
//!
//! - the **active-listener stack**: the top entry is the listener whose
//!   tracked run is in progress; reads through a proxy record a dependency on
//!   it, writes are rejected while it is non-empty.
//! - the **batch depth**: while > 0, notified listeners are queued instead of
//!   run. The outermost scope drains the queue on exit.
//! - the **pending queue**: insertion-ordered and duplicate-free, so a
//!   listener reached through several changed properties (or several states)
//!   runs once per flush.
//!
//! Every piece is restored by an RAII guard, so a panicking listener or
//! trigger never leaves the registry wedged in tracking or batch mode.

use std::cell::{Cell, RefCell};

use crate::config::FlushMode;
use crate::error::{Result, StateError};
use crate::hash::ListenerSet;
use crate::key::PropertyKey;
use crate::listener::Listener;

pub(crate) struct Executor {
    mode: FlushMode,
    name: Option<String>,
    active: RefCell<Vec<Listener>>,
    batch_depth: Cell<usize>,
    pending: RefCell<ListenerSet>,
    flushing: Cell<bool>,
    flush_scheduled: Cell<bool>,
}

/// Pops the active-listener stack on drop (also during unwinding).
struct ActiveListenerGuard<'a> {
    executor: &'a Executor,
}

impl<'a> ActiveListenerGuard<'a> {
    fn push(executor: &'a Executor, listener: &Listener) -> Self {
        executor.active.borrow_mut().push(listener.clone());
        Self { executor }
    }
}

impl Drop for ActiveListenerGuard<'_> {
    fn drop(&mut self) {
        let popped = self.executor.active.borrow_mut().pop();
        drop(popped);
    }
}

/// Leaves a batch scope on drop. The outermost scope also discards whatever
/// is still queued, which is only non-empty when the trigger panicked. A
/// batch opened by a listener during a flush leaves the queue to the flush.
struct BatchGuard<'a> {
    executor: &'a Executor,
}

impl<'a> BatchGuard<'a> {
    fn enter(executor: &'a Executor) -> Self {
        executor.batch_depth.set(executor.batch_depth.get() + 1);
        Self { executor }
    }

    /// Outermost scope that is not itself running inside a flush.
    fn should_drain(&self) -> bool {
        self.executor.batch_depth.get() == 1 && !self.executor.flushing.get()
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let depth = self.executor.batch_depth.get().saturating_sub(1);
        self.executor.batch_depth.set(depth);
        if depth == 0 && !self.executor.flushing.get() {
            let discarded = std::mem::take(&mut *self.executor.pending.borrow_mut());
            drop(discarded);
        }
    }
}

/// Clears the queue once a drain finishes or unwinds.
struct DrainGuard<'a> {
    executor: &'a Executor,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        let drained = std::mem::take(&mut *self.executor.pending.borrow_mut());
        self.executor.flushing.set(false);
        self.executor.flush_scheduled.set(false);
        drop(drained);
    }
}

impl Executor {
    pub(crate) fn new(mode: FlushMode, name: Option<String>) -> Self {
        Self {
            mode,
            name,
            active: RefCell::new(Vec::new()),
            batch_depth: Cell::new(0),
            pending: RefCell::new(ListenerSet::default()),
            flushing: Cell::new(false),
            flush_scheduled: Cell::new(false),
        }
    }

    pub(crate) fn mode(&self) -> FlushMode {
        self.mode
    }

    /// The listener whose tracked run is innermost, if any.
    pub(crate) fn active_listener(&self) -> Option<Listener> {
        self.active.borrow().last().cloned()
    }

    pub(crate) fn is_tracking(&self) -> bool {
        !self.active.borrow().is_empty()
    }

    pub(crate) fn is_batching(&self) -> bool {
        self.batch_depth.get() > 0
    }

    pub(crate) fn is_flush_scheduled(&self) -> bool {
        self.flush_scheduled.get()
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Run `body` with `listener` as the active listener.
    ///
    /// Reads performed by `body` are recorded as dependencies of `listener`.
    /// Nested calls compose: the previous listener becomes active again when
    /// `body` returns or unwinds.
    pub(crate) fn track<R>(&self, listener: &Listener, body: impl FnOnce() -> R) -> R {
        let _guard = ActiveListenerGuard::push(self, listener);
        body()
    }

    /// Run a listener's own body under tracking.
    pub(crate) fn execute(&self, listener: &Listener) {
        self.track(listener, || listener.call());
    }

    /// Fail if a tracked run is in progress.
    pub(crate) fn ensure_writable(&self, key: &PropertyKey) -> Result<()> {
        match self.active_listener() {
            Some(listener) => {
                cov_mark::hit!(write_rejected_during_tracking);
                tracing::debug!(
                    registry = ?self.name,
                    %key,
                    listener = ?listener.id(),
                    "rejected write during tracked read"
                );
                Err(StateError::IllegalWriteDuringTracking {
                    key: key.clone(),
                    listener: listener.id(),
                })
            }
            None => Ok(()),
        }
    }

    /// Run `trigger` as a bulk update.
    ///
    /// Listeners notified by writes inside `trigger` are queued; when the
    /// outermost scope returns, each queued listener runs exactly once in
    /// the order it was first queued.
    pub(crate) fn run_bulk_update<R>(&self, trigger: impl FnOnce() -> R) -> R {
        let guard = BatchGuard::enter(self);
        let result = trigger();
        if guard.should_drain() {
            self.drain_pending();
        }
        drop(guard);
        result
    }

    /// Deliver a write notification to `listeners`.
    ///
    /// Invalidators run first and synchronously, batch or not, so a listener
    /// that reads a computed value never sees it cached across the write.
    pub(crate) fn dispatch(&self, listeners: Vec<Listener>) {
        let (invalidators, listeners): (Vec<_>, Vec<_>) = listeners.into_iter().partition(Listener::is_invalidator);
        for invalidator in &invalidators {
            cov_mark::hit!(invalidator_ran_at_write);
            invalidator.call();
        }
        if listeners.is_empty() {
            return;
        }

        let defer = self.is_batching() || self.flushing.get() || self.mode == FlushMode::Deferred;
        if defer {
            for listener in listeners {
                self.enqueue(listener);
            }
            if !self.is_batching() && !self.flushing.get() {
                self.flush_scheduled.set(true);
            }
        } else {
            for listener in &listeners {
                self.execute(listener);
            }
        }
    }

    fn enqueue(&self, listener: Listener) {
        if !self.pending.borrow_mut().insert(listener) {
            cov_mark::hit!(pending_listener_deduplicated);
        }
    }

    /// Run everything queued outside of a batch. Returns how many listeners
    /// ran; 0 when called from inside a batch or an ongoing flush.
    pub(crate) fn flush(&self) -> usize {
        if self.is_batching() || self.flushing.get() {
            return 0;
        }
        self.drain_pending()
    }

    fn drain_pending(&self) -> usize {
        let _reset = DrainGuard { executor: self };
        self.flushing.set(true);

        let mut ran = 0;
        loop {
            // Listeners queued while draining land at the end and are picked
            // up by the same pass.
            let next = self.pending.borrow().get_index(ran).cloned();
            let Some(listener) = next else {
                break;
            };
            self.execute(&listener);
            ran += 1;
        }

        if ran > 0 {
            tracing::debug!(registry = ?self.name, listeners = ran, "flushed pending listeners");
        }
        ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::rc::Rc;

    fn executor() -> Executor {
        Executor::new(FlushMode::Immediate, None)
    }

    #[test]
    fn track_sets_and_restores_active_listener() {
        let exec = executor();
        let outer = Listener::new(|| {});
        let inner = Listener::new(|| {});

        assert!(exec.active_listener().is_none());
        exec.track(&outer, || {
            assert_eq!(exec.active_listener(), Some(outer.clone()));
            exec.track(&inner, || {
                assert_eq!(exec.active_listener(), Some(inner.clone()));
            });
            assert_eq!(exec.active_listener(), Some(outer.clone()));
        });
        assert!(exec.active_listener().is_none());
    }

    #[test]
    fn track_returns_body_result() {
        let exec = executor();
        let listener = Listener::new(|| {});

        assert_eq!(exec.track(&listener, || 42), 42);
    }

    #[test]
    fn active_listener_cleared_after_panic() {
        let exec = executor();
        let listener = Listener::new(|| panic!("listener failed"));

        let result = catch_unwind(AssertUnwindSafe(|| exec.execute(&listener)));

        assert!(result.is_err());
        assert!(!exec.is_tracking());
    }

    #[test]
    fn writes_rejected_only_while_tracking() {
        cov_mark::check!(write_rejected_during_tracking);

        let exec = executor();
        let key = PropertyKey::from("apples");
        let listener = Listener::new(|| {});

        assert!(exec.ensure_writable(&key).is_ok());
        let err = exec.track(&listener, || exec.ensure_writable(&key)).unwrap_err();
        assert!(err.is_illegal_write());
        assert!(exec.ensure_writable(&key).is_ok());
    }

    #[test]
    fn bulk_update_runs_queued_listeners_once_in_order() {
        cov_mark::check!(pending_listener_deduplicated);

        let exec = executor();
        let log = Rc::new(RefCell::new(Vec::new()));

        let log_a = log.clone();
        let a = Listener::new(move || log_a.borrow_mut().push("a"));
        let log_b = log.clone();
        let b = Listener::new(move || log_b.borrow_mut().push("b"));

        exec.run_bulk_update(|| {
            exec.dispatch(vec![b.clone(), a.clone()]);
            exec.dispatch(vec![a.clone(), b.clone()]);
            assert!(log.borrow().is_empty());
        });

        assert_eq!(*log.borrow(), vec!["b", "a"]);
        assert!(!exec.is_batching());
        assert_eq!(exec.pending_len(), 0);
    }

    #[test]
    fn nested_bulk_updates_flush_at_outermost_exit() {
        let exec = executor();
        let runs = Rc::new(Cell::new(0));
        let runs_clone = runs.clone();
        let listener = Listener::new(move || runs_clone.set(runs_clone.get() + 1));

        exec.run_bulk_update(|| {
            exec.run_bulk_update(|| exec.dispatch(vec![listener.clone()]));
            assert_eq!(runs.get(), 0);
            exec.dispatch(vec![listener.clone()]);
        });

        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn bulk_update_resets_after_trigger_panic() {
        let exec = executor();
        let runs = Rc::new(Cell::new(0));
        let runs_clone = runs.clone();
        let listener = Listener::new(move || runs_clone.set(runs_clone.get() + 1));

        let result = catch_unwind(AssertUnwindSafe(|| {
            exec.run_bulk_update(|| {
                exec.dispatch(vec![listener.clone()]);
                panic!("trigger failed");
            })
        }));

        assert!(result.is_err());
        assert!(!exec.is_batching());
        assert_eq!(exec.pending_len(), 0);
        assert_eq!(runs.get(), 0);

        // Not wedged: the next batch behaves normally.
        exec.run_bulk_update(|| exec.dispatch(vec![listener.clone()]));
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn bulk_update_resets_after_listener_panic() {
        let exec = executor();
        let failing = Listener::new(|| panic!("listener failed"));

        let result = catch_unwind(AssertUnwindSafe(|| {
            exec.run_bulk_update(|| exec.dispatch(vec![failing.clone()]))
        }));

        assert!(result.is_err());
        assert!(!exec.is_batching());
        assert!(!exec.is_tracking());
        assert_eq!(exec.pending_len(), 0);
    }

    #[test]
    fn invalidators_run_at_write_time_inside_batch() {
        cov_mark::check!(invalidator_ran_at_write);

        let exec = executor();
        let log = Rc::new(RefCell::new(Vec::new()));

        let log_reader = log.clone();
        let reader = Listener::new(move || log_reader.borrow_mut().push("reader"));
        let log_invalidator = log.clone();
        let invalidator = Listener::invalidator(move || log_invalidator.borrow_mut().push("invalidator"));

        exec.run_bulk_update(|| {
            exec.dispatch(vec![reader.clone(), invalidator.clone()]);
            assert_eq!(*log.borrow(), vec!["invalidator"]);
            assert_eq!(exec.pending_len(), 1);
        });

        assert_eq!(*log.borrow(), vec!["invalidator", "reader"]);
    }

    #[test]
    fn deferred_mode_waits_for_flush() {
        let exec = Executor::new(FlushMode::Deferred, Some("deferred".into()));
        let runs = Rc::new(Cell::new(0));
        let runs_clone = runs.clone();
        let listener = Listener::new(move || runs_clone.set(runs_clone.get() + 1));

        exec.dispatch(vec![listener.clone()]);
        exec.dispatch(vec![listener.clone()]);
        assert_eq!(runs.get(), 0);
        assert!(exec.is_flush_scheduled());

        assert_eq!(exec.flush(), 1);
        assert_eq!(runs.get(), 1);
        assert!(!exec.is_flush_scheduled());
        assert_eq!(exec.flush(), 0);
    }
}
