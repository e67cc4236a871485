//! Store configuration.
//!
//! A [`StoreConfig`] is fixed when a store is created. It can be built in code
//! or loaded from JSON; missing fields take their defaults.

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::error::{ReactiveError, Result};
use crate::graph::Equality;

/// Passes a single flush may take before it is aborted.
pub const DEFAULT_MAX_FLUSH_PASSES: usize = 64;

/// Settings for one [`Store`](crate::Store).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Equality mode for nodes registered without an explicit one.
    pub default_equality: Equality,

    /// Upper bound on passes in one flush. A pass is needed again only when a
    /// recompute function writes to a node upstream of something already
    /// settled in the current pass.
    pub max_flush_passes: usize,

    /// Treat a panicking recompute function as a recompute failure instead of
    /// unwinding through the caller.
    pub catch_panics: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_equality: Equality::Reference,
            max_flush_passes: DEFAULT_MAX_FLUSH_PASSES,
            catch_panics: true,
        }
    }
}

impl StoreConfig {
    /// Parse a configuration from a JSON string.
    ///
    /// A `max_flush_passes` of zero is rejected: no flush could ever finish.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        if config.max_flush_passes == 0 {
            return Err(ReactiveError::Config(serde_json::Error::custom(
                "max_flush_passes must be at least 1",
            )));
        }
        Ok(config)
    }

    /// Serialize the configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn with_default_equality(mut self, equality: Equality) -> Self {
        self.default_equality = equality;
        self
    }

    pub fn with_max_flush_passes(mut self, passes: usize) -> Self {
        self.max_flush_passes = passes.max(1);
        self
    }

    pub fn with_catch_panics(mut self, catch_panics: bool) -> Self {
        self.catch_panics = catch_panics;
        self
    }
}
