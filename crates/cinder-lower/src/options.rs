//! Lowering configuration

use serde::{Deserialize, Serialize};

/// Knobs for the lowering passes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LowerOptions {
    /// Cache delegates to non-generic static peer methods in a static field
    pub cache_static_delegates: bool,
    /// Rewrite generator bodies into state machines
    pub lower_iterators: bool,
}

impl Default for LowerOptions {
    fn default() -> Self {
        Self {
            cache_static_delegates: false,
            lower_iterators: true,
        }
    }
}
