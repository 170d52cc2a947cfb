use crate::key::PropertyKey;
use crate::listener::ListenerId;

/// Errors surfaced by state construction and mutation.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The initial value is not an object (arrays and primitives are rejected).
    #[error("state must be created from an object, found {found}")]
    Construction {
        /// JSON kind of the rejected value
        found: &'static str,
    },

    /// A write or delete was attempted while a listener's tracked read was
    /// in progress. The mutation was not applied.
    #[error("write to `{key}` is not permitted while a dependency-tracking read is in progress")]
    IllegalWriteDuringTracking {
        /// Property the rejected write targeted
        key: PropertyKey,
        /// Listener whose tracked run was active
        listener: ListenerId,
    },

    /// `State::from_serialize` could not encode its input.
    #[error("failed to encode initial state: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StateError {
    /// Whether this is the side-effect restriction error.
    pub fn is_illegal_write(&self) -> bool {
        matches!(self, StateError::IllegalWriteDuringTracking { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = StateError> = std::result::Result<T, E>;
