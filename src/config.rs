//! Registry configuration.
//!
//! ```ignore
//! let registry = Registry::builder()
//!     .name("settings")
//!     .flush_mode(FlushMode::Deferred)
//!     .build();
//! ```

use serde::{Deserialize, Serialize};

use crate::registry::Registry;

/// When listeners notified by a write outside a batch run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Dependents run synchronously inside the write.
    #[default]
    Immediate,
    /// Dependents are queued and a flush is marked as scheduled; they run on
    /// the next [`Registry::flush`] (or at the end of the next batch).
    Deferred,
}

/// Settings for a [`Registry`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Scheduling of notifications triggered outside batches.
    pub flush_mode: FlushMode,
    /// Label attached to log events emitted by this registry.
    pub name: Option<String>,
    /// Number of state instances to pre-allocate slots for.
    pub initial_capacity: usize,
}

/// Builder for a configured [`Registry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    config: RegistryConfig,
}

impl RegistryBuilder {
    /// Builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flush mode.
    ///
    /// Default: [`FlushMode::Immediate`]
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.config.flush_mode = mode;
        self
    }

    /// Set the label used in log events.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    /// Pre-allocate slots for `capacity` state instances.
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.config.initial_capacity = capacity;
        self
    }

    /// The configuration built so far.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Create the registry.
    pub fn build(self) -> Registry {
        Registry::with_config(self.config)
    }
}
