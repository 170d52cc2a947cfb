use std::fmt;
use std::rc::{Rc, Weak};

use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, StateError};
use crate::hash::ObjectMap;
use crate::key::PropertyKey;
use crate::listener::Listener;
use crate::proxy::{StateProxy, Target};
use crate::registry::{Registry, Slot, StateId};

/// Reactive object with per-property dependency tracking.
///
/// A `State` wraps a private copy of an object (a map from [`PropertyKey`]
/// to `V`). Listeners subscribed to it re-run only when a property they read
/// during their last run is written.
///
/// ```ignore
/// let state = State::new([("apples", 0), ("price", 100)]);
/// let view = state.get_state();
///
/// let unsubscribe = state.subscribe(move || {
///     println!("apples: {:?}", view.get("apples"));
/// });
///
/// state.set_state([("apples", 1)])?;  // listener runs
/// state.set_state([("price", 120)])?; // listener did not read `price`
/// unsubscribe.unsubscribe();
/// ```
///
/// Cloning a `State` yields another handle to the same instance. The
/// instance's subscriptions live as long as its `State` handles: dropping the
/// last one releases every listener still registered on it.
pub struct State<V = Value> {
    slot: Rc<Slot>,
    proxy: StateProxy<V>,
}

impl<V> Clone for State<V> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            proxy: self.proxy.clone(),
        }
    }
}

impl<V: Clone + 'static> State<V> {
    /// Create a state in this thread's default registry.
    pub fn new<K, I>(initial: I) -> Self
    where
        K: Into<PropertyKey>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::new_in(&Registry::current(), initial)
    }

    /// Create a state in `registry`.
    pub fn new_in<K, I>(registry: &Registry, initial: I) -> Self
    where
        K: Into<PropertyKey>,
        I: IntoIterator<Item = (K, V)>,
    {
        let object: ObjectMap<V> = initial.into_iter().map(|(key, value)| (key.into(), value)).collect();
        let slot = Slot::new(registry);
        let target = Rc::new(Target::new(&slot, object));
        Self {
            slot,
            proxy: StateProxy::new(target),
        }
    }

    /// The live proxy. Reads through it are tracked; there is no snapshot.
    pub fn get_state(&self) -> StateProxy<V> {
        self.proxy.clone()
    }

    /// Assign every pair of `partial` in one batch.
    ///
    /// A listener depending on several of the assigned keys runs once, after
    /// all of them are stored.
    ///
    /// # Errors
    ///
    /// [`StateError::IllegalWriteDuringTracking`] when called from inside a
    /// listener's tracked run; nothing is assigned.
    pub fn set_state<K, I>(&self, partial: I) -> Result<()>
    where
        K: Into<PropertyKey>,
        I: IntoIterator<Item = (K, V)>,
    {
        let registry = self.registry();
        if registry.is_tracking() {
            // Reject before touching anything, so no key of `partial` lands.
            let key = partial
                .into_iter()
                .next()
                .map(|(key, _)| key.into())
                .unwrap_or_else(|| PropertyKey::from(""));
            return registry.executor().ensure_writable(&key);
        }

        registry.batch(|| {
            partial
                .into_iter()
                .try_for_each(|(key, value)| self.proxy.set(key, value))
        })
    }

    /// Run `listener` once under tracking and keep it subscribed to what it
    /// read.
    ///
    /// The returned handle removes the listener from every property of this
    /// state. Subscribing the same [`Listener`] twice does not duplicate it.
    pub fn subscribe(&self, listener: impl Into<Listener>) -> Unsubscribe {
        let listener = listener.into();
        tracing::debug!(state = ?self.id(), listener = ?listener.id(), "subscribing listener");
        self.registry().execute(&listener);
        Unsubscribe::new(self, listener)
    }

    /// Subscribe `f`, passing `args` to every invocation.
    pub fn subscribe_with<A, F>(&self, f: F, args: A) -> Unsubscribe
    where
        A: 'static,
        F: FnMut(&A) + 'static,
    {
        self.subscribe(Listener::with_args(f, args))
    }

    /// Remove `listener` from every property of this state.
    ///
    /// Returns whether it was registered anywhere. Useful for listeners that
    /// were never subscribed through [`subscribe`](Self::subscribe), such as
    /// the ones behind [`Computed`](crate::Computed) and
    /// [`observe`](crate::observe).
    pub fn unsubscribe(&self, listener: &Listener) -> bool {
        self.registry().unsubscribe(listener, self.id())
    }

    /// Deferred [`set_state`](Self::set_state), for
    /// [`Registry::batch_setters`].
    pub fn setter<K, I>(&self, partial: I) -> Setter
    where
        K: Into<PropertyKey>,
        I: IntoIterator<Item = (K, V)>,
    {
        let state = self.clone();
        let pairs: Vec<(PropertyKey, V)> = partial.into_iter().map(|(key, value)| (key.into(), value)).collect();
        Setter::new(move || state.set_state(pairs))
    }

    /// Read a property without recording a dependency.
    pub fn peek(&self, key: impl Into<PropertyKey>) -> Option<V> {
        self.proxy.peek(key)
    }
}

impl<V> State<V> {
    /// The registry this state belongs to.
    pub fn registry(&self) -> &Registry {
        self.slot.registry()
    }

    /// Slot of this instance in its registry.
    pub fn id(&self) -> StateId {
        self.slot.id()
    }

    /// Whether both handles refer to the same instance.
    pub fn ptr_eq(&self, other: &State<V>) -> bool {
        Rc::ptr_eq(&self.slot, &other.slot)
    }

    /// Handle that does not keep the instance alive.
    ///
    /// A listener that needs the `State` itself, rather than its proxy,
    /// should capture one of these: a strong handle inside a listener
    /// registered on the same instance keeps both alive for good.
    pub fn downgrade(&self) -> WeakState<V> {
        WeakState {
            slot: Rc::downgrade(&self.slot),
            target: Rc::downgrade(self.proxy.target()),
        }
    }

    /// Properties that have been read at least once, in first-read order.
    pub fn tracked_properties(&self) -> Vec<PropertyKey> {
        self.registry().tracked_properties(self.id())
    }

    /// Number of listeners depending on `key`, or `None` if it was never
    /// read.
    pub fn listener_count(&self, key: impl Into<PropertyKey>) -> Option<usize> {
        self.registry().listener_count(self.id(), &key.into())
    }
}

impl State<Value> {
    /// Create a state from a JSON object in this thread's default registry.
    ///
    /// # Errors
    ///
    /// [`StateError::Construction`] unless `value` is an object.
    pub fn from_value(value: Value) -> Result<Self> {
        Self::from_value_in(&Registry::current(), value)
    }

    /// Create a state from a JSON object in `registry`.
    pub fn from_value_in(registry: &Registry, value: Value) -> Result<Self> {
        match value {
            Value::Object(object) => Ok(Self::new_in(registry, object)),
            other => Err(StateError::Construction {
                found: json_kind(&other),
            }),
        }
    }

    /// Create a state from anything that serializes to a JSON object.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Self::from_value(serde_json::to_value(value)?)
    }

    /// Untracked JSON copy of the object. Symbol-keyed properties are
    /// skipped.
    pub fn to_value(&self) -> Value {
        let object = self
            .proxy
            .snapshot()
            .into_iter()
            .filter_map(|(key, value)| key.as_name().map(|name| (name.to_owned(), value)))
            .collect();
        Value::Object(object)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl<V: fmt::Debug> fmt::Debug for State<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("State").field(&self.proxy).finish()
    }
}

/// Non-owning handle to a [`State`].
pub struct WeakState<V = Value> {
    slot: Weak<Slot>,
    target: Weak<Target<V>>,
}

impl<V> Clone for WeakState<V> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            target: self.target.clone(),
        }
    }
}

impl<V> WeakState<V> {
    /// The state, if a `State` handle to it is still alive.
    pub fn upgrade(&self) -> Option<State<V>> {
        Some(State {
            slot: self.slot.upgrade()?,
            proxy: StateProxy::new(self.target.upgrade()?),
        })
    }
}

/// Handle returned by [`State::subscribe`].
///
/// Dropping it does nothing; call [`unsubscribe`](Self::unsubscribe), or
/// convert it with [`into_guard`](Self::into_guard) to unsubscribe on drop.
#[must_use = "the listener stays subscribed; call `unsubscribe` or keep the handle"]
pub struct Unsubscribe {
    slot: Weak<Slot>,
    listener: Listener,
}

impl Unsubscribe {
    fn new<V>(state: &State<V>, listener: Listener) -> Self {
        Self {
            slot: Rc::downgrade(&state.slot),
            listener,
        }
    }

    /// Remove the listener from every property of the state.
    ///
    /// Calling this again, or after the state was dropped, does nothing.
    pub fn unsubscribe(&self) {
        if let Some(slot) = self.slot.upgrade() {
            slot.registry().unsubscribe(&self.listener, slot.id());
        }
    }

    /// The subscribed listener, e.g. to subscribe it again later.
    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    /// Unsubscribe automatically when the returned guard drops.
    pub fn into_guard(self) -> SubscriptionGuard {
        SubscriptionGuard { handle: self }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("listener", &self.listener)
            .field("alive", &(self.slot.strong_count() > 0))
            .finish()
    }
}

/// RAII subscription: unsubscribes when dropped.
#[derive(Debug)]
#[must_use = "dropping the guard unsubscribes immediately"]
pub struct SubscriptionGuard {
    handle: Unsubscribe,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}

/// A deferred state mutation, applied by [`Registry::batch_setters`].
pub struct Setter {
    apply: Box<dyn FnOnce() -> Result<()>>,
}

impl Setter {
    /// Wrap an arbitrary mutation.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        Self { apply: Box::new(f) }
    }

    /// Run the mutation now.
    pub fn apply(self) -> Result<()> {
        (self.apply)()
    }
}

impl fmt::Debug for Setter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Setter").finish_non_exhaustive()
    }
}
