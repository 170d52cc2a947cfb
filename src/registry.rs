// Listener registry - per-instance dependency storage
//
// Every state instance owns a slot in the registry's slab. The slot starts
// empty and receives its properties map (key -> dependent listeners) on first
// access. Property entries are created on *read* only, so writes to a
// property nobody has read are pure no-ops with respect to notification.
//
// The registry never holds the state instance itself. A slot is owned by
// the instance's `State` handles through `Slot`; proxies and listeners only
// hold it weakly. When the last handle drops, the slot is released and the
// properties map goes with it, together with every listener it kept alive.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use slab::Slab;

use crate::config::{FlushMode, RegistryBuilder, RegistryConfig};
use crate::error::Result;
use crate::executor::Executor;
use crate::hash::{ListenerSet, PropertiesMap};
use crate::key::PropertyKey;
use crate::listener::Listener;
use crate::state::Setter;

thread_local! {
    static CURRENT_REGISTRY: Registry = Registry::new();
}

/// Slot index of a state instance inside its registry.
///
/// Slots are reused after an instance is dropped; an id is only meaningful
/// while the instance that received it is alive.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct StateId(u32);

impl StateId {
    fn new(index: usize) -> Self {
        Self(index as u32)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Ownership of one registry slot. Dropping it releases the slot.
pub(crate) struct Slot {
    id: StateId,
    registry: Registry,
}

impl Slot {
    pub(crate) fn new(registry: &Registry) -> Rc<Self> {
        Rc::new(Self {
            id: registry.allocate(),
            registry: registry.clone(),
        })
    }

    pub(crate) fn id(&self) -> StateId {
        self.id
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

/// A property read, as recorded while computing a derived value.
pub(crate) type Source = (Weak<Slot>, PropertyKey);

struct RegistryInner {
    config: RegistryConfig,
    instances: RefCell<Slab<Option<PropertiesMap>>>,
    executor: Executor,
    /// One log per [`Registry::record_reads`] in progress, innermost last.
    read_logs: RefCell<Vec<Vec<Source>>>,
}

/// Truncates the read-log stack back to its own entry on drop.
struct ReadLog<'a> {
    logs: &'a RefCell<Vec<Vec<Source>>>,
    depth: usize,
}

impl<'a> ReadLog<'a> {
    fn open(logs: &'a RefCell<Vec<Vec<Source>>>) -> Self {
        let mut stack = logs.borrow_mut();
        stack.push(Vec::new());
        let depth = stack.len() - 1;
        drop(stack);
        Self { logs, depth }
    }

    fn close(self) -> Vec<Source> {
        // Borrow ends before `self` drops.
        let reads = self
            .logs
            .borrow_mut()
            .get_mut(self.depth)
            .map(std::mem::take)
            .unwrap_or_default();
        reads
    }
}

impl Drop for ReadLog<'_> {
    fn drop(&mut self) {
        let discarded = self.logs.borrow_mut().split_off(self.depth);
        drop(discarded);
    }
}

/// Dependency registry shared by a group of states.
///
/// States created in the same registry share one active-listener stack and
/// one pending queue, so a batch spanning several of them runs each shared
/// listener once. `Registry` is a cheap handle; clones refer to the same
/// registry.
#[derive(Clone)]
pub struct Registry {
    inner: Rc<RegistryInner>,
}

impl Registry {
    /// Registry with default settings.
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Registry with explicit settings.
    pub fn with_config(config: RegistryConfig) -> Self {
        let executor = Executor::new(config.flush_mode, config.name.clone());
        let instances = Slab::with_capacity(config.initial_capacity);
        Self {
            inner: Rc::new(RegistryInner {
                config,
                instances: RefCell::new(instances),
                executor,
                read_logs: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Start configuring a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// This thread's default registry, used by [`State::new`](crate::State::new).
    pub fn current() -> Registry {
        CURRENT_REGISTRY.with(Registry::clone)
    }

    /// Settings this registry was created with.
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Scheduling of notifications outside batches.
    pub fn flush_mode(&self) -> FlushMode {
        self.inner.executor.mode()
    }

    /// Whether both handles refer to the same registry.
    pub fn ptr_eq(&self, other: &Registry) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    // =========================================================================
    // Instance slots
    // =========================================================================

    fn allocate(&self) -> StateId {
        let id = StateId::new(self.inner.instances.borrow_mut().insert(None));
        tracing::trace!(registry = ?self.inner.config.name, ?id, "allocated state slot");
        id
    }

    fn release(&self, id: StateId) {
        // Dropping the map can drop listeners that own other states, which
        // release their own slots: let go of the borrow first.
        let released = self.inner.instances.borrow_mut().try_remove(id.index());
        if released.is_some() {
            tracing::trace!(registry = ?self.inner.config.name, ?id, "released state slot");
        }
        drop(released);
    }

    /// Number of state instances currently holding a slot.
    pub fn live_states(&self) -> usize {
        self.inner.instances.borrow().len()
    }

    /// Access the properties map of `id`, creating an empty one on first use.
    ///
    /// Returns `None` when the slot has been released.
    pub(crate) fn properties_map<R>(
        &self,
        id: StateId,
        f: impl FnOnce(&mut PropertiesMap) -> R,
    ) -> Option<R> {
        let mut instances = self.inner.instances.borrow_mut();
        let slot = instances.get_mut(id.index())?;
        Some(f(slot.get_or_insert_with(PropertiesMap::default)))
    }

    // =========================================================================
    // Dependency edges
    // =========================================================================

    /// Read hook: make sure `key` has a listener set and record the active
    /// listener (if any) in it.
    pub(crate) fn track_read(&self, slot: &Rc<Slot>, key: &PropertyKey) {
        let id = slot.id();
        self.log_read(slot, key);
        let active = self.inner.executor.active_listener();
        self.properties_map(id, |properties| {
            if !properties.contains_key(key) {
                cov_mark::hit!(property_set_created_on_read);
                properties.insert(key.clone(), ListenerSet::default());
            }
            let (Some(listener), Some(listeners)) = (active, properties.get_mut(key)) else {
                return;
            };
            if listeners.insert(listener.clone()) {
                tracing::trace!(?id, %key, listener = ?listener.id(), "recorded dependency");
            } else {
                cov_mark::hit!(dependency_already_recorded);
            }
        });
    }

    /// Run `body` and also return every property it read, including the
    /// ones read on its behalf by computed values it used.
    pub(crate) fn record_reads<R>(&self, body: impl FnOnce() -> R) -> (R, Vec<Source>) {
        let log = ReadLog::open(&self.inner.read_logs);
        let result = body();
        (result, log.close())
    }

    fn log_read(&self, slot: &Rc<Slot>, key: &PropertyKey) {
        let mut logs = self.inner.read_logs.borrow_mut();
        let Some(log) = logs.last_mut() else {
            return;
        };
        let seen = log
            .iter()
            .any(|(source, read)| std::ptr::eq(source.as_ptr(), Rc::as_ptr(slot)) && read == key);
        if !seen {
            log.push((Rc::downgrade(slot), key.clone()));
        }
    }

    /// Snapshot of the listeners depending on `key`. Empty if the property
    /// was never read.
    pub(crate) fn dependents(&self, id: StateId, key: &PropertyKey) -> Vec<Listener> {
        let instances = self.inner.instances.borrow();
        instances
            .get(id.index())
            .and_then(Option::as_ref)
            .and_then(|properties| properties.get(key))
            .map(|listeners| listeners.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove `listener` from every property set of `id`.
    ///
    /// Returns whether any edge was removed. Unknown listeners and released
    /// slots are ignored.
    pub(crate) fn unsubscribe(&self, listener: &Listener, id: StateId) -> bool {
        let removed = self
            .properties_map(id, |properties| {
                properties
                    .values_mut()
                    .fold(false, |removed, listeners| listeners.shift_remove(listener) || removed)
            })
            .unwrap_or(false);
        if removed {
            tracing::debug!(registry = ?self.inner.config.name, ?id, listener = ?listener.id(), "unsubscribed listener");
        }
        removed
    }

    pub(crate) fn tracked_properties(&self, id: StateId) -> Vec<PropertyKey> {
        let instances = self.inner.instances.borrow();
        instances
            .get(id.index())
            .and_then(Option::as_ref)
            .map(|properties| properties.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn listener_count(&self, id: StateId, key: &PropertyKey) -> Option<usize> {
        let instances = self.inner.instances.borrow();
        instances
            .get(id.index())
            .and_then(Option::as_ref)
            .and_then(|properties| properties.get(key))
            .map(ListenerSet::len)
    }

    // =========================================================================
    // Execution and batching
    // =========================================================================

    /// Run `listener` once under tracking, recording what it reads.
    pub fn execute(&self, listener: &Listener) {
        self.inner.executor.execute(listener);
    }

    /// Run `body` with `listener` as the active listener and return its
    /// result. Reads inside `body` become dependencies of `listener`.
    pub fn track<R>(&self, listener: &Listener, body: impl FnOnce() -> R) -> R {
        self.inner.executor.track(listener, body)
    }

    /// Batch every write made by `f`.
    ///
    /// Listeners notified by any state of this registry run once, after `f`
    /// returns, in the order they were first notified.
    ///
    /// ```ignore
    /// registry.batch(|| {
    ///     apples.set_state([("count", 2)])?;
    ///     bananas.set_state([("count", 4)])
    /// })?;
    /// ```
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.executor.run_bulk_update(f)
    }

    /// Apply deferred setters inside one batch.
    ///
    /// Stops at the first failing setter; notifications for the writes
    /// already applied still run.
    pub fn batch_setters<I>(&self, setters: I) -> Result<()>
    where
        I: IntoIterator<Item = Setter>,
    {
        self.batch(|| setters.into_iter().try_for_each(Setter::apply))
    }

    /// Run listeners queued by writes outside a batch (deferred mode).
    ///
    /// Returns how many listeners ran. Inside a batch or a running flush
    /// this is a no-op.
    pub fn flush(&self) -> usize {
        self.inner.executor.flush()
    }

    /// Whether deferred writes are waiting for [`flush`](Self::flush).
    pub fn is_flush_scheduled(&self) -> bool {
        self.inner.executor.is_flush_scheduled()
    }

    /// Whether a batch is open.
    pub fn is_batching(&self) -> bool {
        self.inner.executor.is_batching()
    }

    /// Whether a listener's tracked run is in progress.
    pub fn is_tracking(&self) -> bool {
        self.inner.executor.is_tracking()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("name", &self.inner.config.name)
            .field("flush_mode", &self.inner.config.flush_mode)
            .field("live_states", &self.live_states())
            .finish()
    }
}

/// Batch writes on this thread's default registry.
///
/// See [`Registry::batch`].
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    Registry::current().batch(f)
}

/// Apply deferred setters in one batch on this thread's default registry.
///
/// See [`Registry::batch_setters`].
pub fn batch_setters<I>(setters: I) -> Result<()>
where
    I: IntoIterator<Item = Setter>,
{
    Registry::current().batch_setters(setters)
}
