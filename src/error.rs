//! Error types for rulehub.
//!
//! All errors in rulehub are strongly typed using thiserror.
//! Startup-phase failures (`ConfigurationError`) abort the initial load,
//! while steady-state reload failures (`ReloadError`) are contained per key
//! and only surface through logging and `ReloadReport`s.

use thiserror::Error;

use crate::registry::RegistryState;

/// Startup-fatal errors raised while building the initial session set.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Rule '{key}' has no content, check the configuration source")]
    MissingContent {
        key: String,
    },

    #[error("Rule '{key}' failed to compile: {diagnostic}")]
    Compile {
        key: String,
        diagnostic: String,
    },

    #[error("Rule '{key}' did not compile within {timeout_ms}ms")]
    CompileTimeout {
        key: String,
        timeout_ms: u64,
    },

    #[error("Rule keys '{existing_key}' and '{key}' both map to session name '{name}'")]
    NameCollision {
        name: String,
        existing_key: String,
        key: String,
    },

    #[error("Rule compiler unavailable: {reason}")]
    CompilerUnavailable {
        reason: String,
    },
}

/// Per-key failures while applying a change batch.
///
/// These never cross the lookup API; the previous session stays authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReloadError {
    #[error("compile failed: {diagnostic}")]
    Compile {
        diagnostic: String,
    },

    #[error("compile timed out after {timeout_ms}ms")]
    CompileTimeout {
        timeout_ms: u64,
    },

    #[error("session name '{name}' is owned by key '{existing_key}'")]
    NameCollision {
        name: String,
        existing_key: String,
    },

    #[error("rule compiler unavailable: {reason}")]
    Unavailable {
        reason: String,
    },
}

/// The negative result of a session lookup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("No rule session named '{name}' is configured")]
    NotFound {
        name: String,
    },

    #[error("Registry is not serving lookups (state: {state})")]
    NotReady {
        state: RegistryState,
    },
}

/// Errors reported by a `ConfigSource` backend.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Configuration source backend error: {0}")]
    Backend(String),
}

/// Errors while reading registry settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid setting '{field}': {reason}")]
    Invalid {
        field: String,
        reason: String,
    },
}

/// Top-level error type for rulehub.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Settings error: {0}")]
    Settings(#[from] ConfigError),

    #[error("Registry is in state {actual}, expected {expected}")]
    InvalidState {
        expected: RegistryState,
        actual: RegistryState,
    },

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl RegistryError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a startup configuration error.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Configuration(e) => matches!(
                e,
                ConfigurationError::CompileTimeout { .. } | ConfigurationError::CompilerUnavailable { .. }
            ),
            Self::Timeout { .. } => true,
            Self::Source(_)
            | Self::Settings(_)
            | Self::InvalidState { .. }
            | Self::Disconnected { .. }
            | Self::Internal { .. } => false,
        }
    }
}

impl ReloadError {
    /// Promote a contained reload failure to a startup-fatal error for `key`.
    #[must_use]
    pub fn into_configuration(self, key: &str) -> ConfigurationError {
        let key = key.to_string();
        match self {
            Self::Compile { diagnostic } => ConfigurationError::Compile { key, diagnostic },
            Self::CompileTimeout { timeout_ms } => ConfigurationError::CompileTimeout { key, timeout_ms },
            Self::NameCollision { name, existing_key } => ConfigurationError::NameCollision {
                name,
                existing_key,
                key,
            },
            Self::Unavailable { reason } => ConfigurationError::CompilerUnavailable { reason },
        }
    }
}

/// Result type alias for rulehub operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
