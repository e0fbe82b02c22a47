//! cinder.toml loading

use anyhow::{Context, Result};
use cinder_lower::LowerOptions;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "cinder.toml";

/// Template written by `cinder init`; parses to the defaults.
pub const DEFAULT_CONFIG: &str = r#"# Cinder configuration

[lower]
# Keep delegates to capture-free anonymous functions in a static field
# and reuse them on later evaluations.
cache_static_delegates = false

# Turn methods containing `yield` into enumerator state machines.
# Disable to leave them for a later stage.
lower_iterators = true
"#;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub lower: LowerOptions,
}

impl Config {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    /// Load `explicit` if given, else a cinder.toml next to `input`, else defaults.
    pub fn resolve(explicit: Option<&Path>, input: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match discover(input) {
            Some(path) => {
                log::debug!("using configuration {}", path.display());
                Self::load(&path)
            }
            None => Ok(Self::default()),
        }
    }
}

fn discover(input: &Path) -> Option<PathBuf> {
    let dir = if input.is_file() {
        input.parent()?
    } else {
        input
    };
    let candidate = dir.join(CONFIG_FILE);
    candidate.is_file().then_some(candidate)
}
