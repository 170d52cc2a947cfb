#![deny(missing_docs)]

//! Fine-grained reactive state objects.
//!
//! A [`State`] wraps an object. Listeners subscribed to it run once under
//! dependency tracking, and afterwards re-run only when a property they read
//! is written. Writing a property nobody read notifies nobody.
//!
//! # Quick Start
//!
//! ```ignore
//! use reaktiv_state::State;
//!
//! let cart = State::new([("apples", 0), ("price", 100)]);
//! let view = cart.get_state();
//!
//! // Runs immediately; depends on `apples` only
//! let unsubscribe = cart.subscribe(move || {
//!     println!("apples: {:?}", view.get("apples"));
//! });
//!
//! cart.set_state([("apples", 1)])?;  // prints
//! cart.set_state([("price", 120)])?; // nothing read `price`
//!
//! unsubscribe.unsubscribe();
//! ```
//!
//! # Core Types
//!
//! - [`State`] - Reactive object. [`set_state`](State::set_state) merges a partial update.
//!   Dropping the last handle releases every listener registered on it.
//! - [`StateProxy`] - Live view returned by [`get_state`](State::get_state). Reads are tracked.
//! - [`Listener`] - Callback with identity; the unit of deduplication and unsubscription.
//! - [`Registry`] - Dependency storage and scheduler shared by a group of states.
//!
//! # Batching
//!
//! ```ignore
//! // Listeners shared by both states run once, after both writes
//! batch(|| {
//!     apples.set_state([("count", 2)])?;
//!     bananas.set_state([("count", 4)])
//! })?;
//!
//! // Same, from deferred setters
//! batch_setters([apples.setter([("count", 3)]), bananas.setter([("count", 5)])])?;
//! ```
//!
//! # Side Effects
//!
//! A listener must not write to state while its tracked run is in progress:
//! such writes fail with [`StateError::IllegalWriteDuringTracking`] and
//! change nothing.
//!
//! # Derived Values
//!
//! ```ignore
//! let total = Computed::new(move || view.get("apples").unwrap_or(0) * 2);
//! let label = observe(move |color: &String| format!("{color}: {}", total.get()));
//! let (apples, set_apples) = signal([("apples", 100)]);
//! ```
//!
//! Everything here is single-threaded: each thread has its own default
//! [`Registry`], and no handle is `Send`.

mod computed;
mod config;
mod error;
mod executor;
mod hash;
mod key;
mod listener;
mod observe;
mod proxy;
mod registry;
mod signal;
mod state;

// Core types
pub use listener::{Listener, ListenerId};
pub use proxy::StateProxy;
pub use registry::{Registry, StateId};
pub use state::{Setter, State, SubscriptionGuard, Unsubscribe, WeakState};

// Keys
pub use key::{PropertyKey, Symbol};

// Derived values
pub use computed::Computed;
pub use observe::{Observed, observe, observe_in};
pub use signal::{ReadSignal, WriteSignal, signal, signal_in};

// Key functions
pub use registry::{batch, batch_setters};

// Configuration and errors
pub use config::{FlushMode, RegistryBuilder, RegistryConfig};
pub use error::{Result, StateError};
