use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SYMBOL: AtomicU64 = AtomicU64::new(1);

/// A unique, non-string property key.
///
/// Two symbols are equal only if one was cloned from the other, even when
/// they carry the same description.
///
/// ```ignore
/// let hidden = Symbol::new("hidden");
/// let state = State::new([(PropertyKey::from(hidden.clone()), 1)]);
/// assert_eq!(state.get_state().get(hidden), Some(1));
/// ```
#[derive(Clone)]
pub struct Symbol {
    id: u64,
    description: Cow<'static, str>,
}

impl Symbol {
    /// Allocate a fresh symbol with a human-readable description.
    pub fn new(description: impl Into<Cow<'static, str>>) -> Self {
        Self {
            id: NEXT_SYMBOL.fetch_add(1, Ordering::Relaxed),
            description: description.into(),
        }
    }

    /// The description given at construction (not part of identity).
    pub fn description(&self) -> &str {
        &self.description
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})#{}", self.description, self.id)
    }
}

/// Key of a property on a state object: a string name or a [`Symbol`].
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum PropertyKey {
    /// Ordinary named property.
    Name(Cow<'static, str>),
    /// Identity-keyed property.
    Symbol(Symbol),
}

impl PropertyKey {
    /// The property name, if this is a named key.
    pub fn as_name(&self) -> Option<&str> {
        match self {
            PropertyKey::Name(name) => Some(name),
            PropertyKey::Symbol(_) => None,
        }
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyKey::Name(name) => f.write_str(name),
            PropertyKey::Symbol(symbol) => write!(f, "Symbol({})", symbol.description),
        }
    }
}

impl From<&'static str> for PropertyKey {
    fn from(name: &'static str) -> Self {
        PropertyKey::Name(Cow::Borrowed(name))
    }
}

impl From<String> for PropertyKey {
    fn from(name: String) -> Self {
        PropertyKey::Name(Cow::Owned(name))
    }
}

impl From<Cow<'static, str>> for PropertyKey {
    fn from(name: Cow<'static, str>) -> Self {
        PropertyKey::Name(name)
    }
}

impl From<Symbol> for PropertyKey {
    fn from(symbol: Symbol) -> Self {
        PropertyKey::Symbol(symbol)
    }
}

impl From<&Symbol> for PropertyKey {
    fn from(symbol: &Symbol) -> Self {
        PropertyKey::Symbol(symbol.clone())
    }
}

impl From<&PropertyKey> for PropertyKey {
    fn from(key: &PropertyKey) -> Self {
        key.clone()
    }
}
