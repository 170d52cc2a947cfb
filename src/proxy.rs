use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::Result;
use crate::hash::ObjectMap;
use crate::key::PropertyKey;
use crate::registry::{Registry, Slot};

/// Backing object of a state instance.
///
/// Shared by the instance's `State` and `StateProxy` handles. The registry
/// slot is only referenced weakly: it belongs to the `State` handles.
pub(crate) struct Target<V> {
    slot: Weak<Slot>,
    registry: Registry,
    object: RefCell<ObjectMap<V>>,
}

impl<V> Target<V> {
    pub(crate) fn new(slot: &Rc<Slot>, object: ObjectMap<V>) -> Self {
        Self {
            slot: Rc::downgrade(slot),
            registry: slot.registry().clone(),
            object: RefCell::new(object),
        }
    }
}

/// Live, tracked view of a state's object.
///
/// Reading a property with [`get`](Self::get) while a listener is running
/// records that listener as a dependent of the property. Writing with
/// [`set`](Self::set) notifies the property's dependents.
///
/// Only the top level is reactive: a stored value is returned as-is, and
/// changes inside it are invisible until the property itself is assigned.
///
/// A proxy does not keep its state's subscriptions alive. Listeners can
/// capture one freely; once every [`State`](crate::State) handle is dropped,
/// the proxy still reaches the object but tracks and notifies nothing.
pub struct StateProxy<V> {
    target: Rc<Target<V>>,
}

impl<V> Clone for StateProxy<V> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
        }
    }
}

impl<V> StateProxy<V> {
    pub(crate) fn new(target: Rc<Target<V>>) -> Self {
        Self { target }
    }

    pub(crate) fn target(&self) -> &Rc<Target<V>> {
        &self.target
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.target.registry
    }

    /// The registry slot, while a `State` handle still owns it.
    pub(crate) fn slot(&self) -> Option<Rc<Slot>> {
        self.target.slot.upgrade()
    }

    /// Whether the property exists. Does not record a dependency.
    pub fn contains_key(&self, key: impl Into<PropertyKey>) -> bool {
        self.target.object.borrow().contains_key(&key.into())
    }

    /// Current keys in insertion order. Does not record a dependency.
    pub fn keys(&self) -> Vec<PropertyKey> {
        self.target.object.borrow().keys().cloned().collect()
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        self.target.object.borrow().len()
    }

    /// Whether the object has no properties.
    pub fn is_empty(&self) -> bool {
        self.target.object.borrow().is_empty()
    }

    /// Remove a property.
    ///
    /// Removal never notifies dependents. Like writes, it is rejected while
    /// a listener's tracked run is in progress.
    pub fn remove(&self, key: impl Into<PropertyKey>) -> Result<Option<V>> {
        let key = key.into();
        self.registry().executor().ensure_writable(&key)?;
        let removed = self.target.object.borrow_mut().shift_remove(&key);
        Ok(removed)
    }
}

impl<V: Clone> StateProxy<V> {
    /// Read a property, recording a dependency for the running listener.
    ///
    /// The property's listener set is created here on first read, even if
    /// no listener is running or the property does not exist.
    pub fn get(&self, key: impl Into<PropertyKey>) -> Option<V> {
        let key = key.into();
        match self.slot() {
            Some(slot) => self.registry().track_read(&slot, &key),
            None => cov_mark::hit!(read_after_release_untracked),
        }
        self.target.object.borrow().get(&key).cloned()
    }

    /// Read a property without recording a dependency.
    pub fn peek(&self, key: impl Into<PropertyKey>) -> Option<V> {
        self.target.object.borrow().get(&key.into()).cloned()
    }

    /// Assign a property and notify its dependents.
    ///
    /// Outside a batch (and in [`FlushMode::Immediate`](crate::FlushMode))
    /// every dependent runs before this returns. Inside a batch they are
    /// queued. Writing a property nobody has read notifies nobody. Values are
    /// not compared: assigning an equal value still notifies.
    ///
    /// # Errors
    ///
    /// [`StateError::IllegalWriteDuringTracking`](crate::StateError) if called
    /// from inside a listener's tracked run. The value is not stored.
    pub fn set(&self, key: impl Into<PropertyKey>, value: V) -> Result<()> {
        let key = key.into();
        let registry = self.registry();
        registry.executor().ensure_writable(&key)?;

        let previous = self.target.object.borrow_mut().insert(key.clone(), value);
        let dependents = self
            .slot()
            .map(|slot| registry.dependents(slot.id(), &key))
            .unwrap_or_default();
        registry.executor().dispatch(dependents);
        drop(previous);
        Ok(())
    }

    /// Untracked copy of the whole object.
    pub(crate) fn snapshot(&self) -> ObjectMap<V> {
        self.target.object.borrow().clone()
    }
}

impl<V: fmt::Debug> fmt::Debug for StateProxy<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateProxy")
            .field("id", &self.slot().map(|slot| slot.id()))
            .field("object", &*self.target.object.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::Listener;
    use std::cell::Cell;

    fn proxy(registry: &Registry) -> (Rc<Slot>, StateProxy<i32>) {
        let slot = Slot::new(registry);
        let mut object = ObjectMap::default();
        object.insert(PropertyKey::from("name"), 1);
        let proxy = StateProxy::new(Rc::new(Target::new(&slot, object)));
        (slot, proxy)
    }

    #[test]
    fn get_returns_stored_value() {
        let registry = Registry::new();
        let (_slot, proxy) = proxy(&registry);

        assert_eq!(proxy.get("name"), Some(1));
        assert_eq!(proxy.get("missing"), None);
    }

    #[test]
    fn read_creates_listener_set_write_does_not() {
        let registry = Registry::new();
        let (slot, proxy) = proxy(&registry);

        proxy.set("age", 25).unwrap();
        assert_eq!(registry.listener_count(slot.id(), &"age".into()), None);

        assert_eq!(proxy.get("age"), Some(25));
        assert_eq!(registry.listener_count(slot.id(), &"age".into()), Some(0));
    }

    #[test]
    fn peek_records_nothing() {
        let registry = Registry::new();
        let (slot, proxy) = proxy(&registry);
        let listener = Listener::new(|| {});

        registry.track(&listener, || proxy.peek("name"));

        assert!(registry.tracked_properties(slot.id()).is_empty());
    }

    #[test]
    fn write_outside_batch_runs_dependents_immediately() {
        let registry = Registry::new();
        let (_slot, proxy) = proxy(&registry);
        let runs = Rc::new(Cell::new(0));

        let runs_clone = runs.clone();
        let reader = proxy.clone();
        let listener = Listener::new(move || {
            reader.get("name");
            runs_clone.set(runs_clone.get() + 1);
        });
        registry.execute(&listener);
        assert_eq!(runs.get(), 1);

        proxy.set("name", 2).unwrap();
        assert_eq!(runs.get(), 2);
        proxy.set("other", 2).unwrap();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn write_and_remove_rejected_while_tracking() {
        let registry = Registry::new();
        let (_slot, proxy) = proxy(&registry);
        let listener = Listener::new(|| {});

        let (write, remove) = registry.track(&listener, || (proxy.set("name", 9), proxy.remove("name")));

        assert!(write.unwrap_err().is_illegal_write());
        assert!(remove.unwrap_err().is_illegal_write());
        assert_eq!(proxy.peek("name"), Some(1));
    }

    #[test]
    fn remove_does_not_notify() {
        let registry = Registry::new();
        let (_slot, proxy) = proxy(&registry);
        let runs = Rc::new(Cell::new(0));

        let runs_clone = runs.clone();
        let reader = proxy.clone();
        registry.execute(&Listener::new(move || {
            reader.get("name");
            runs_clone.set(runs_clone.get() + 1);
        }));

        assert_eq!(proxy.remove("name").unwrap(), Some(1));
        assert_eq!(runs.get(), 1);
        assert!(!proxy.contains_key("name"));
        assert!(proxy.is_empty());
    }

    #[test]
    fn proxy_does_not_own_the_slot() {
        let registry = Registry::new();
        let (slot, proxy) = proxy(&registry);
        let other = proxy.clone();
        assert_eq!(registry.live_states(), 1);

        drop(slot);
        assert_eq!(registry.live_states(), 0);
        assert!(other.slot().is_none());
        assert_eq!(proxy.peek("name"), Some(1));
    }

    #[test]
    fn released_proxy_stays_out_of_reused_slot() {
        cov_mark::check!(read_after_release_untracked);

        let registry = Registry::new();
        let (slot, stale) = proxy(&registry);
        drop(slot);
        let (fresh_slot, fresh) = proxy(&registry);

        let runs = Rc::new(Cell::new(0));
        let runs_clone = runs.clone();
        let reader = fresh.clone();
        registry.execute(&Listener::new(move || {
            reader.get("name");
            runs_clone.set(runs_clone.get() + 1);
        }));

        let listener = Listener::new(|| {});
        registry.track(&listener, || stale.get("name"));
        stale.set("name", 5).unwrap();

        assert_eq!(runs.get(), 1);
        assert_eq!(registry.listener_count(fresh_slot.id(), &"name".into()), Some(1));
        assert_eq!(fresh.peek("name"), Some(1));
    }
}
