//! Registry settings.
//!
//! Settings are read from the `[registry]` table of a TOML file; every field
//! has a default so an empty file is valid.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::naming::PrefixFilter;
use crate::source::DEFAULT_CHANGE_QUEUE_CAPACITY;

/// What a reload does when a key's content disappears upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionPolicy {
    /// Keep serving the last successfully compiled session.
    #[default]
    RetainLastGood,
    /// Drop the session owned by the deleted key.
    RemoveOnAbsent,
}

/// Namespace and prefix allow-list used to select rule keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterConfig {
    /// Configuration namespace to read and watch.
    pub namespace: String,
    /// Accepted key prefixes; empty accepts everything.
    pub prefixes: PrefixFilter,
}

impl FilterConfig {
    /// Creates a filter from a namespace and a comma-separated prefix list.
    #[must_use]
    pub fn new(namespace: impl Into<String>, start: &str) -> Self {
        Self {
            namespace: namespace.into(),
            prefixes: PrefixFilter::parse(start),
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Configuration namespace holding rule keys.
    pub namespace: String,
    /// Comma-separated accepted key prefixes; blank accepts all keys.
    pub start: String,
    pub deletion_policy: DeletionPolicy,
    /// Per-key compile budget; exceeding it counts as a compile failure.
    pub compile_timeout_ms: u64,
    pub compile_workers: usize,
    pub compile_queue_capacity: usize,
    /// Per-subscriber capacity of the change batch channel.
    pub change_queue_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            namespace: "rules".to_string(),
            start: "rules".to_string(),
            deletion_policy: DeletionPolicy::RetainLastGood,
            compile_timeout_ms: 5_000,
            compile_workers: 2,
            compile_queue_capacity: 256,
            change_queue_capacity: DEFAULT_CHANGE_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    registry: RegistryConfig,
}

impl RegistryConfig {
    /// Parse settings from the `[registry]` table of a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let file: SettingsFile = toml::from_str(s)?;
        file.registry.validate()?;
        Ok(file.registry)
    }

    /// Read and parse a TOML settings file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.trim().is_empty() {
            return Err(invalid("namespace", "must not be empty"));
        }
        if self.compile_timeout_ms == 0 {
            return Err(invalid("compile_timeout_ms", "must be greater than zero"));
        }
        if self.compile_workers == 0 {
            return Err(invalid("compile_workers", "must be greater than zero"));
        }
        if self.compile_queue_capacity == 0 {
            return Err(invalid("compile_queue_capacity", "must be greater than zero"));
        }
        if self.change_queue_capacity == 0 {
            return Err(invalid("change_queue_capacity", "must be greater than zero"));
        }
        Ok(())
    }

    /// The selection filter described by these settings.
    #[must_use]
    pub fn filter(&self) -> FilterConfig {
        FilterConfig::new(self.namespace.trim(), &self.start)
    }

    /// Compile budget as a `Duration`.
    #[must_use]
    pub const fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
