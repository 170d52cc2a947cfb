//! Read/write handle pair over a [`State`].
//!
//! ```ignore
//! let (apples, set_apples) = signal([("apples", 100)]);
//! assert_eq!(apples.get("apples"), Some(100));
//!
//! set_apples.set([("apples", 200)])?;
//! assert_eq!(apples.get("apples"), Some(200));
//! ```

use std::fmt;

use crate::error::Result;
use crate::key::PropertyKey;
use crate::listener::Listener;
use crate::proxy::StateProxy;
use crate::registry::Registry;
use crate::state::{State, Unsubscribe};

/// Create a state in this thread's default registry and split it into a
/// reader and a writer.
pub fn signal<K, V, I>(initial: I) -> (ReadSignal<V>, WriteSignal<V>)
where
    K: Into<PropertyKey>,
    V: Clone + 'static,
    I: IntoIterator<Item = (K, V)>,
{
    signal_in(&Registry::current(), initial)
}

/// [`signal`] in an explicit registry.
pub fn signal_in<K, V, I>(registry: &Registry, initial: I) -> (ReadSignal<V>, WriteSignal<V>)
where
    K: Into<PropertyKey>,
    V: Clone + 'static,
    I: IntoIterator<Item = (K, V)>,
{
    let state = State::new_in(registry, initial);
    (
        ReadSignal {
            state: state.clone(),
        },
        WriteSignal { state },
    )
}

/// Read half of a [`signal`].
pub struct ReadSignal<V> {
    state: State<V>,
}

impl<V: Clone + 'static> ReadSignal<V> {
    /// Tracked read of one property.
    pub fn get(&self, key: impl Into<PropertyKey>) -> Option<V> {
        self.state.get_state().get(key)
    }

    /// The live proxy of the underlying state.
    pub fn proxy(&self) -> StateProxy<V> {
        self.state.get_state()
    }

    /// Subscribe to the underlying state. See [`State::subscribe`].
    pub fn subscribe(&self, listener: impl Into<Listener>) -> Unsubscribe {
        self.state.subscribe(listener)
    }
}

impl<V> ReadSignal<V> {
    /// The underlying state.
    pub fn state(&self) -> &State<V> {
        &self.state
    }
}

/// Write half of a [`signal`].
pub struct WriteSignal<V> {
    state: State<V>,
}

impl<V: Clone + 'static> WriteSignal<V> {
    /// Merge `partial` into the state. See [`State::set_state`].
    pub fn set<K, I>(&self, partial: I) -> Result<()>
    where
        K: Into<PropertyKey>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.state.set_state(partial)
    }
}

impl<V> Clone for ReadSignal<V> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<V> Clone for WriteSignal<V> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for ReadSignal<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReadSignal").field(&self.state).finish()
    }
}

impl<V: fmt::Debug> fmt::Debug for WriteSignal<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WriteSignal").field(&self.state).finish()
    }
}
