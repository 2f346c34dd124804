//! # rulehub - Hot-reloadable rule sessions
//!
//! rulehub keeps a live registry of compiled rule sessions, one per rule key
//! stored in a remote configuration source. When a key's content changes the
//! session is recompiled and swapped in without disturbing lookups for other
//! names, and without ever exposing a half-built session.
//!
//! ## Core Concepts
//!
//! - **ConfigSource**: Enumerable key/value rule text plus a stream of change batches
//! - **RuleCompiler**: Turns rule text into an immutable, executable session
//! - **SessionRegistry**: Canonical name → session map with initial load and hot reload
//! - **ReloadWorker**: Dedicated thread applying change batches to a registry
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rulehub::{InMemoryConfigSource, JsonRuleCompiler, RegistryConfig, SessionRegistry};
//!
//! let source = InMemoryConfigSource::new();
//! source.set("rules", "rules.pricing", r#"{ "rules": [ ... ] }"#)?;
//!
//! let config = RegistryConfig::default();
//! let registry = SessionRegistry::bootstrap(JsonRuleCompiler, &config, &source)?;
//! let _worker = registry.subscribe(&source)?;
//!
//! let session = registry.lookup("rulesPricing")?;
//! let outcome = session.execute(&serde_json::json!({ "total": 120 }));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod compiler;
pub mod config;
pub mod error;
pub mod naming;
pub mod registry;
pub mod ruleset;
pub mod source;

// Re-export primary types at crate root for convenience
pub use compiler::{CompileError, RuleCompiler};
pub use config::{DeletionPolicy, FilterConfig, RegistryConfig};
pub use error::{
	ConfigError, ConfigurationError, LookupError, RegistryError, RegistryResult, ReloadError,
	SourceError,
};
pub use naming::{canonicalize, is_selected, PrefixFilter};
pub use registry::{
	ChangeOutcome, ChangeResult, CompilerPool, EntryInfo, RegistryState, ReloadReport, ReloadWorker,
	SessionRegistry,
};
pub use ruleset::{JsonRuleCompiler, Outcome, RuleDocument, RuleSet};
pub use source::{BatchId, ChangeBatch, ChangeKind, ConfigSource, InMemoryConfigSource, PropertyChange};
