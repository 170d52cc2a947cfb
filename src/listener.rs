use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Opaque identity of a [`Listener`], stable for the listener's lifetime.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ListenerId(usize);

/// A callback run under dependency tracking.
///
/// Cloning a `Listener` yields the *same* listener: identity is the shared
/// allocation, never the closure body. Subscribing two clones registers one
/// dependent, and unsubscribing either removes it.
///
/// Any `FnMut() + 'static` converts into a fresh listener, so
/// `state.subscribe(|| ...)` works directly. Keep a `Listener` around when
/// the same callback needs to be subscribed again later.
#[derive(Clone)]
pub struct Listener {
    callback: Rc<RefCell<dyn FnMut()>>,
    /// Invalidators only flag cached values as stale. They run at write
    /// time, ahead of any queued listener.
    invalidates: bool,
}

impl Listener {
    /// Wrap a callback into a new listener identity.
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut() + 'static,
    {
        Self {
            callback: Rc::new(RefCell::new(f)),
            invalidates: false,
        }
    }

    /// Listener that marks a cached value stale when a dependency is written.
    ///
    /// It must not read state: it is called untracked, even inside a batch.
    pub(crate) fn invalidator<F>(f: F) -> Self
    where
        F: FnMut() + 'static,
    {
        Self {
            callback: Rc::new(RefCell::new(f)),
            invalidates: true,
        }
    }

    pub(crate) fn is_invalidator(&self) -> bool {
        self.invalidates
    }

    /// Listener that forwards `args` to `f` on every invocation.
    pub fn with_args<A, F>(mut f: F, args: A) -> Self
    where
        A: 'static,
        F: FnMut(&A) + 'static,
    {
        Self::new(move || f(&args))
    }

    /// Identity of this listener.
    pub fn id(&self) -> ListenerId {
        ListenerId(Rc::as_ptr(&self.callback) as *const () as usize)
    }

    /// Whether `self` and `other` are the same listener.
    pub fn ptr_eq(&self, other: &Listener) -> bool {
        self.id() == other.id()
    }

    /// Run the callback body. Does not touch the tracking marker.
    ///
    /// A listener that is already on the call stack is not re-entered; the
    /// nested invocation is skipped.
    pub(crate) fn call(&self) {
        match self.callback.try_borrow_mut() {
            Ok(mut callback) => (*callback)(),
            Err(_) => {
                cov_mark::hit!(listener_reentry_skipped);
                tracing::debug!(listener = ?self.id(), "listener already running, skipping nested call");
            }
        }
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Listener {}

impl Hash for Listener {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Listener").field(&self.id().0).finish()
    }
}

impl<F> From<F> for Listener
where
    F: FnMut() + 'static,
{
    fn from(f: F) -> Self {
        Listener::new(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn clones_share_identity() {
        let a = Listener::new(|| {});
        let b = a.clone();
        let c = Listener::new(|| {});

        assert_eq!(a, b);
        assert_eq!(a.id(), b.id());
        assert_ne!(a, c);
    }

    #[test]
    fn with_args_forwards_on_every_call() {
        let seen = Rc::new(Cell::new(0));
        let seen_clone = seen.clone();
        let listener = Listener::with_args(move |step: &usize| seen_clone.set(seen_clone.get() + step), 5);

        listener.call();
        listener.call();

        assert_eq!(seen.get(), 10);
    }

    #[test]
    fn nested_self_call_is_skipped() {
        cov_mark::check!(listener_reentry_skipped);

        let runs = Rc::new(Cell::new(0));
        let slot: Rc<RefCell<Option<Listener>>> = Rc::new(RefCell::new(None));

        let runs_clone = runs.clone();
        let slot_clone = slot.clone();
        let listener = Listener::new(move || {
            runs_clone.set(runs_clone.get() + 1);
            let me = slot_clone.borrow().clone();
            if let Some(me) = me {
                me.call();
            }
        });
        *slot.borrow_mut() = Some(listener.clone());

        listener.call();
        assert_eq!(runs.get(), 1);

        slot.borrow_mut().take();
    }
}
