//! In-memory configuration source.
//!
//! Thread-safe implementation of [`ConfigSource`] intended for embedded use,
//! tests and static snapshots loaded from TOML. Every write publishes one
//! [`ChangeBatch`] to the namespace's subscribers.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Deserialize;

use crate::error::{ConfigError, SourceError};
use crate::source::traits::{ChangeBatch, ConfigSource, PropertyChange};

fn lock_err(context: &'static str) -> SourceError {
    SourceError::Backend(format!("poisoned lock: {context}"))
}

/// Default per-subscriber channel capacity.
pub const DEFAULT_CHANGE_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Subscriber {
    namespace: String,
    tx: Sender<ChangeBatch>,
}

/// A key with `None` content is listed by `property_names` but has no value,
/// which is how an upstream key without content is represented.
type Namespace = BTreeMap<String, Option<String>>;

#[derive(Debug, Deserialize)]
struct Snapshot {
    #[serde(default)]
    namespaces: HashMap<String, BTreeMap<String, String>>,
}

/// Thread-safe in-memory configuration source.
#[derive(Debug)]
pub struct InMemoryConfigSource {
    namespaces: RwLock<HashMap<String, Namespace>>,
    subscribers: Mutex<Vec<Subscriber>>,
    channel_capacity: usize,
}

impl Default for InMemoryConfigSource {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CHANGE_QUEUE_CAPACITY)
    }
}

impl InMemoryConfigSource {
    /// Create a new empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a source whose subscriber channels hold at most `capacity` batches.
    ///
    /// Writers block once a subscriber's channel is full.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            channel_capacity: capacity.max(1),
        }
    }

    /// Replace the capacity used for subscriptions made after this call.
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Load a static snapshot:
    ///
    /// ```toml
    /// [namespaces.rules]
    /// "rules.pricing" = '{ "rules": [ ... ] }'
    /// ```
    ///
    /// Tables other than `namespaces` are ignored, so the same file can carry
    /// registry settings.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let snapshot: Snapshot = toml::from_str(s)?;
        let source = Self::new();
        {
            let mut namespaces = source.namespaces.write().map_err(|_| ConfigError::Invalid {
                field: "namespaces".to_string(),
                reason: "poisoned lock".to_string(),
            })?;
            for (ns, props) in snapshot.namespaces {
                let entry = namespaces.entry(ns).or_default();
                for (key, value) in props {
                    entry.insert(key, Some(value));
                }
            }
        }
        Ok(source)
    }

    /// Set the content of `key`, publishing a batch if it changed.
    pub fn set(&self, namespace: &str, key: &str, value: impl Into<String>) -> Result<(), SourceError> {
        self.apply(namespace, vec![(key.to_string(), Some(value.into()))])
    }

    /// Delete `key`, publishing a batch if it had content.
    pub fn remove(&self, namespace: &str, key: &str) -> Result<(), SourceError> {
        self.apply(namespace, vec![(key.to_string(), None)])
    }

    /// List `key` without content.
    ///
    /// No batch is published; this only affects `property_names`/`get_property`.
    pub fn declare_empty(&self, namespace: &str, key: &str) -> Result<(), SourceError> {
        let mut namespaces = self.namespaces.write().map_err(|_| lock_err("source.declare_empty"))?;
        namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), None);
        Ok(())
    }

    /// Apply several writes as one publish; subscribers receive a single batch.
    ///
    /// Writes that leave content unchanged are not reported. Concurrent
    /// writers are serialised, so batches reach subscribers in the order their
    /// writes were stored.
    pub fn apply(&self, namespace: &str, writes: Vec<(String, Option<String>)>) -> Result<(), SourceError> {
        // Held until the batch is delivered; always taken before `namespaces`.
        let mut subscribers = self.subscribers.lock().map_err(|_| lock_err("source.apply"))?;
        let changes = {
            let mut namespaces = self.namespaces.write().map_err(|_| lock_err("source.apply"))?;
            let ns = namespaces.entry(namespace.to_string()).or_default();
            let mut changes = Vec::with_capacity(writes.len());
            for (key, new_value) in writes {
                let old_value = match &new_value {
                    Some(v) => ns.insert(key.clone(), Some(v.clone())).flatten(),
                    None => ns.remove(&key).flatten(),
                };
                if old_value != new_value {
                    changes.push(PropertyChange::new(key, old_value, new_value));
                }
            }
            changes
        };

        if !changes.is_empty() {
            publish(&mut subscribers, &ChangeBatch::new(namespace, changes));
        }
        Ok(())
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

fn publish(subscribers: &mut Vec<Subscriber>, batch: &ChangeBatch) {
    // Blocking send applies backpressure; a disconnected receiver ends its subscription.
    subscribers.retain(|sub| sub.namespace != batch.namespace || sub.tx.send(batch.clone()).is_ok());
}

impl ConfigSource for InMemoryConfigSource {
    fn property_names(&self, namespace: &str) -> Result<Vec<String>, SourceError> {
        let namespaces = self.namespaces.read().map_err(|_| lock_err("source.property_names"))?;
        Ok(namespaces
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn get_property(&self, namespace: &str, key: &str) -> Result<Option<String>, SourceError> {
        let namespaces = self.namespaces.read().map_err(|_| lock_err("source.get_property"))?;
        Ok(namespaces
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned()
            .flatten())
    }

    fn subscribe(&self, namespace: &str) -> Result<Receiver<ChangeBatch>, SourceError> {
        let (tx, rx) = bounded::<ChangeBatch>(self.channel_capacity);
        self.subscribers
            .lock()
            .map_err(|_| lock_err("source.subscribe"))?
            .push(Subscriber {
                namespace: namespace.to_string(),
                tx,
            });
        Ok(rx)
    }
}
