//! Configuration source contract.
//!
//! A configuration source stores raw rule text under dotted keys grouped by
//! namespace, and delivers change notifications as whole batches over a
//! bounded channel. Each change carries the complete new content, never a delta.

use std::fmt;

use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SourceError;

/// Unique identifier for a change batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    /// Create a new random batch id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of change applied to a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Key gained content.
    Added,
    /// Key content was replaced.
    Modified,
    /// Key lost its content.
    Deleted,
}

/// A single changed property with its old and new content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyChange {
    /// Raw dotted key.
    pub key: String,
    /// Content before the change.
    pub old_value: Option<String>,
    /// Content after the change; `None` when the key was deleted.
    pub new_value: Option<String>,
}

impl PropertyChange {
    /// Creates a change record.
    #[must_use]
    pub fn new(key: impl Into<String>, old_value: Option<String>, new_value: Option<String>) -> Self {
        Self {
            key: key.into(),
            old_value,
            new_value,
        }
    }

    /// Classify the change.
    #[must_use]
    pub fn kind(&self) -> ChangeKind {
        match (&self.old_value, &self.new_value) {
            (_, None) => ChangeKind::Deleted,
            (None, Some(_)) => ChangeKind::Added,
            (Some(_), Some(_)) => ChangeKind::Modified,
        }
    }
}

/// One change notification: every key changed in a single upstream publish.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub id: BatchId,
    pub namespace: String,
    pub changes: Vec<PropertyChange>,
    pub created_at: DateTime<Utc>,
}

impl ChangeBatch {
    /// Creates a batch for `namespace`.
    #[must_use]
    pub fn new(namespace: impl Into<String>, changes: Vec<PropertyChange>) -> Self {
        Self {
            id: BatchId::new(),
            namespace: namespace.into(),
            changes,
            created_at: Utc::now(),
        }
    }

    /// Keys changed by this batch.
    pub fn changed_keys(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(|c| c.key.as_str())
    }

    /// The change recorded for `key`, if any.
    #[must_use]
    pub fn change(&self, key: &str) -> Option<&PropertyChange> {
        self.changes.iter().find(|c| c.key == key)
    }

    /// Returns true if the batch carries no changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Read and watch access to a remote configuration store.
///
/// # Safety Considerations
/// - Implementations must tolerate concurrent reads from the registry and
///   arbitrary writers.
/// - Batches for a namespace are delivered one at a time, in publish order
///   as observed by the source.
pub trait ConfigSource: Send + Sync {
    /// All property keys currently known under `namespace`.
    fn property_names(&self, namespace: &str) -> Result<Vec<String>, SourceError>;

    /// Current content for `key`, or `None` when absent.
    fn get_property(&self, namespace: &str, key: &str) -> Result<Option<String>, SourceError>;

    /// Register for change batches on `namespace`.
    ///
    /// The subscription ends when the returned receiver is dropped or the
    /// source shuts down (the channel disconnects).
    fn subscribe(&self, namespace: &str) -> Result<Receiver<ChangeBatch>, SourceError>;
}
