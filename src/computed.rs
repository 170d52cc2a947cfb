use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::listener::Listener;
use crate::registry::{Registry, Source};

/// Memoized value derived from state reads.
///
/// The computation runs once on creation, tracked like a listener. When one
/// of the properties it read is written, the cached value is marked stale
/// right away, even inside a batch; the next [`get`](Self::get) recomputes.
///
/// A listener that reads a computed depends on the properties the
/// computation read, as if it had read them itself. It is notified by writes
/// to them, and [`State::unsubscribe`](crate::State::unsubscribe) on their
/// state detaches it.
///
/// ```ignore
/// let cart = State::new([("apples", 2.0), ("price", 1.5)]);
/// let view = cart.get_state();
/// let total = Computed::new(move || {
///     view.get("apples").unwrap_or(0.0) * view.get("price").unwrap_or(0.0)
/// });
///
/// assert_eq!(total.get(), 3.0);
/// cart.set_state([("apples", 4.0)])?;
/// assert!(total.is_stale());
/// assert_eq!(total.get(), 6.0);
/// ```
///
/// Values are not compared: any write to a dependency invalidates.
pub struct Computed<T> {
    inner: Rc<ComputedInner<T>>,
}

struct ComputedInner<T> {
    registry: Registry,
    compute: RefCell<Box<dyn FnMut() -> T>>,
    value: RefCell<T>,
    stale: Cell<bool>,
    /// Tracked on behalf of the computation; registered on every property
    /// it reads.
    invalidate: Listener,
    /// Every property read by any run of the computation.
    sources: RefCell<Vec<Source>>,
}

impl<T: Clone + 'static> Computed<T> {
    /// Create a computed value in this thread's default registry.
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut() -> T + 'static,
    {
        Self::new_in(&Registry::current(), f)
    }

    /// Create a computed value in `registry`.
    pub fn new_in<F>(registry: &Registry, mut f: F) -> Self
    where
        F: FnMut() -> T + 'static,
    {
        let inner = Rc::new_cyclic(|weak: &Weak<ComputedInner<T>>| {
            let weak = weak.clone();
            let invalidate = Listener::invalidator(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.mark_stale();
                }
            });
            let (value, sources) = registry.record_reads(|| registry.track(&invalidate, &mut f));
            ComputedInner {
                registry: registry.clone(),
                compute: RefCell::new(Box::new(f)),
                value: RefCell::new(value),
                stale: Cell::new(false),
                invalidate,
                sources: RefCell::new(sources),
            }
        });
        Self { inner }
    }

    /// The current value, recomputing it first if stale.
    ///
    /// Called from a listener's tracked run, the listener is recorded on
    /// every property the computation read.
    pub fn get(&self) -> T {
        let inner = &self.inner;
        if inner.stale.get() {
            inner.recompute();
        } else {
            cov_mark::hit!(computed_cache_hit);
        }
        if inner.registry.is_tracking() {
            inner.replay_sources();
        }
        inner.value.borrow().clone()
    }
}

impl<T> Computed<T> {
    /// Whether a dependency changed since the last computation.
    pub fn is_stale(&self) -> bool {
        self.inner.stale.get()
    }

    /// The listener the computation is tracked under.
    ///
    /// Pass it to [`State::unsubscribe`](crate::State::unsubscribe) to stop
    /// a state from invalidating this computed.
    pub fn listener(&self) -> &Listener {
        &self.inner.invalidate
    }
}

impl<T> ComputedInner<T> {
    fn recompute(&self) {
        let (value, reads) = self.registry.record_reads(|| {
            self.registry.track(&self.invalidate, || {
                let mut compute = self.compute.borrow_mut();
                (*compute)()
            })
        });
        self.stale.set(false);
        self.merge_sources(reads);
        // Replaced value drops after the borrow.
        let previous = std::mem::replace(&mut *self.value.borrow_mut(), value);
        drop(previous);
    }

    fn merge_sources(&self, reads: Vec<Source>) {
        let mut sources = self.sources.borrow_mut();
        sources.retain(|(slot, _)| slot.strong_count() > 0);
        for read in reads {
            let known = sources
                .iter()
                .any(|(slot, key)| Weak::ptr_eq(slot, &read.0) && *key == read.1);
            if !known {
                sources.push(read);
            }
        }
    }

    /// Read every source again on behalf of the active listener.
    fn replay_sources(&self) {
        let sources = self.sources.borrow().clone();
        for (slot, key) in &sources {
            if let Some(slot) = slot.upgrade() {
                self.registry.track_read(&slot, key);
            }
        }
    }

    fn mark_stale(&self) {
        if !self.stale.replace(true) {
            tracing::trace!(sources = self.sources.borrow().len(), "computed invalidated");
        }
    }
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("value", &*self.inner.value.borrow())
            .field("stale", &self.inner.stale.get())
            .finish()
    }
}
