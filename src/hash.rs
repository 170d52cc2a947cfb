//! Hashing for the registry's internal collections.
//!
//! Property maps, listener sets and the pending queue are all keyed by values
//! we produce ourselves (property names, symbol ids, listener pointers), so
//! HashDoS resistance buys nothing. They share one zero-sized, fixed-seed
//! foldhash builder.

use std::hash::BuildHasher;

use foldhash::fast::{FixedState, FoldHasher};
use indexmap::{IndexMap, IndexSet};

use crate::key::PropertyKey;
use crate::listener::Listener;

const SEED: u64 = 0x2d35_8dcc_aa6c_78a5;

/// Zero-sized `BuildHasher` backed by foldhash with a constant seed.
#[derive(Clone, Copy, Debug, Default)]
pub struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(SEED).build_hasher()
    }
}

/// Insertion-ordered, duplicate-free set of listeners.
pub(crate) type ListenerSet = IndexSet<Listener, FastHashBuilder>;

/// Per-instance map from property key to its dependents.
pub(crate) type PropertiesMap = IndexMap<PropertyKey, ListenerSet, FastHashBuilder>;

/// Backing storage of a state instance.
pub(crate) type ObjectMap<V> = IndexMap<PropertyKey, V, FastHashBuilder>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_is_zero_sized_and_deterministic() {
        assert_eq!(std::mem::size_of::<FastHashBuilder>(), 0);
        assert_eq!(
            FastHashBuilder.hash_one("apples"),
            FastHashBuilder.hash_one("apples")
        );
    }
}
