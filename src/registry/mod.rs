//! Session registry: the name → compiled session mapping.
//!
//! The registry is populated once by [`SessionRegistry::initial_load`] and
//! then kept current by applying change batches, usually from a
//! [`ReloadWorker`]. Lookups run concurrently with reloads and only contend on
//! the shard holding the requested name, for the duration of a pointer swap.
//!
//! Lifecycle: `Uninitialized -> Loading -> Ready`, or `Loading -> Failed`
//! when the initial load aborts. Reloads keep the registry in `Ready`.

/// Bounded compile workers.
pub mod compile;
/// Change batch consumer thread.
pub mod reload;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::compiler::RuleCompiler;
use crate::config::{DeletionPolicy, FilterConfig, RegistryConfig};
use crate::error::{ConfigurationError, LookupError, RegistryError, RegistryResult, ReloadError};
use crate::naming;
use crate::source::{ChangeBatch, ConfigSource, PropertyChange};

pub use compile::CompilerPool;
pub use reload::{ChangeOutcome, ChangeResult, ReloadReport, ReloadWorker};

/// Macro state of a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegistryState {
    /// Created, initial load not started.
    Uninitialized = 0,
    /// Initial load in progress.
    Loading = 1,
    /// Serving lookups and accepting reloads.
    Ready = 2,
    /// Initial load aborted; never serves lookups.
    Failed = 3,
}

impl RegistryState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Uninitialized,
            1 => Self::Loading,
            2 => Self::Ready,
            _ => Self::Failed,
        }
    }
}

impl fmt::Display for RegistryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct RegistryEntry<S> {
    raw_key: String,
    session: Arc<S>,
    fingerprint: blake3::Hash,
    revision: u64,
    loaded_at: DateTime<Utc>,
}

impl<S> RegistryEntry<S> {
    fn new(raw_key: String, session: S, fingerprint: blake3::Hash) -> Self {
        Self {
            raw_key,
            session: Arc::new(session),
            fingerprint,
            revision: 1,
            loaded_at: Utc::now(),
        }
    }
}

/// Metadata about a published session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Canonical session name.
    pub name: String,
    /// Raw key the session was compiled from.
    pub key: String,
    /// Starts at 1 and increments on every successful recompilation.
    pub revision: u64,
    /// Hex blake3 digest of the compiled content.
    pub fingerprint: String,
    /// When the current session was published.
    pub loaded_at: DateTime<Utc>,
}

/// Registry of compiled rule sessions keyed by canonical name.
pub struct SessionRegistry<C: RuleCompiler> {
    sessions: DashMap<String, RegistryEntry<C::Session>>,
    state: AtomicU8,
    filter: OnceLock<FilterConfig>,
    deletion_policy: DeletionPolicy,
    pool: CompilerPool<C>,
}

impl<C: RuleCompiler> fmt::Debug for SessionRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("state", &self.state())
            .field("sessions", &self.sessions.len())
            .field("filter", &self.filter.get())
            .field("deletion_policy", &self.deletion_policy)
            .finish_non_exhaustive()
    }
}

impl<C: RuleCompiler> SessionRegistry<C> {
    /// Create an empty registry and start its compile workers.
    pub fn new(compiler: C, config: &RegistryConfig) -> RegistryResult<Self> {
        config.validate()?;
        let pool = CompilerPool::start(
            compiler,
            config.compile_workers,
            config.compile_queue_capacity,
            config.compile_timeout(),
        )?;
        Ok(Self {
            sessions: DashMap::new(),
            state: AtomicU8::new(RegistryState::Uninitialized as u8),
            filter: OnceLock::new(),
            deletion_policy: config.deletion_policy,
            pool,
        })
    }

    /// Create a registry and run the initial load with the configured filter.
    pub fn bootstrap(compiler: C, config: &RegistryConfig, source: &dyn ConfigSource) -> RegistryResult<Arc<Self>> {
        let registry = Self::new(compiler, config)?;
        registry.initial_load(source, config.filter())?;
        Ok(Arc::new(registry))
    }

    /// Current macro state.
    #[must_use]
    pub fn state(&self) -> RegistryState {
        RegistryState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The filter recorded by the initial load.
    #[must_use]
    pub fn filter(&self) -> Option<&FilterConfig> {
        self.filter.get()
    }

    /// Active deletion policy.
    #[must_use]
    pub const fn deletion_policy(&self) -> DeletionPolicy {
        self.deletion_policy
    }

    /// The compiler used for every load and reload.
    #[must_use]
    pub fn compiler(&self) -> &C {
        self.pool.compiler()
    }

    /// Load every selected key from `source` and publish the result.
    ///
    /// Any selected key without content, or whose content fails to compile,
    /// aborts the load and leaves the registry `Failed`. Nothing is visible to
    /// lookups until every key has compiled.
    pub fn initial_load(&self, source: &dyn ConfigSource, filter: FilterConfig) -> RegistryResult<()> {
        self.transition(RegistryState::Uninitialized, RegistryState::Loading)?;

        let staged = match self.load_all(source, &filter) {
            Ok(staged) => staged,
            Err(e) => {
                self.state.store(RegistryState::Failed as u8, Ordering::Release);
                warn!(namespace = %filter.namespace, error = %e, "initial rule load failed");
                return Err(e);
            }
        };

        let namespace = filter.namespace.clone();
        if self.filter.set(filter).is_err() {
            self.state.store(RegistryState::Failed as u8, Ordering::Release);
            return Err(RegistryError::internal("load filter already recorded"));
        }
        let count = staged.len();
        for (name, entry) in staged {
            self.sessions.insert(name, entry);
        }
        self.state.store(RegistryState::Ready as u8, Ordering::Release);
        info!(%namespace, sessions = count, "rule registry ready");
        Ok(())
    }

    fn load_all(
        &self,
        source: &dyn ConfigSource,
        filter: &FilterConfig,
    ) -> RegistryResult<HashMap<String, RegistryEntry<C::Session>>> {
        let mut keys = source.property_names(&filter.namespace)?;
        keys.sort();

        let mut staged: HashMap<String, RegistryEntry<C::Session>> = HashMap::new();
        for key in keys {
            let Some(name) = naming::select(&key, &filter.prefixes) else {
                debug!(%key, "key not selected");
                continue;
            };

            let content = source
                .get_property(&filter.namespace, &key)?
                .ok_or_else(|| ConfigurationError::MissingContent { key: key.clone() })?;

            if let Some(existing) = staged.get(&name) {
                return Err(ConfigurationError::NameCollision {
                    name,
                    existing_key: existing.raw_key.clone(),
                    key,
                }
                .into());
            }

            let session = self
                .pool
                .compile(&content)
                .map_err(|e| e.into_configuration(&key))?;
            let fingerprint = blake3::hash(content.as_bytes());
            info!(%name, %key, "rule session loaded");
            staged.insert(name, RegistryEntry::new(key, session, fingerprint));
        }
        Ok(staged)
    }

    /// Apply one change batch.
    ///
    /// Failures are contained per key: the previous session for a failing
    /// name stays published and the failure is recorded in the report.
    pub fn apply_batch(&self, batch: &ChangeBatch) -> RegistryResult<ReloadReport> {
        let state = self.state();
        if state != RegistryState::Ready {
            return Err(RegistryError::InvalidState {
                expected: RegistryState::Ready,
                actual: state,
            });
        }
        let filter = self
            .filter
            .get()
            .ok_or_else(|| RegistryError::internal("ready registry has no filter"))?;

        let mut report = ReloadReport::new(batch.id);
        if batch.namespace != filter.namespace {
            debug!(namespace = %batch.namespace, "ignoring batch for foreign namespace");
            for change in &batch.changes {
                report.push(change.key.clone(), None, ChangeOutcome::Skipped);
            }
            return Ok(report);
        }

        for change in &batch.changes {
            let Some(name) = naming::select(&change.key, &filter.prefixes) else {
                debug!(key = %change.key, "key not selected");
                report.push(change.key.clone(), None, ChangeOutcome::Skipped);
                continue;
            };

            info!(
                key = %change.key,
                old = ?change.old_value,
                new = ?change.new_value,
                "rule changed"
            );

            let outcome = self.apply_change(&name, change);
            if let ChangeOutcome::Failed(e) = &outcome {
                warn!(%name, key = %change.key, error = %e, "rule reload failed, keeping previous session");
            }
            report.push(change.key.clone(), Some(name), outcome);
        }
        Ok(report)
    }

    fn apply_change(&self, name: &str, change: &PropertyChange) -> ChangeOutcome {
        let Some(content) = change.new_value.as_deref() else {
            return self.apply_deletion(name, &change.key);
        };

        let fingerprint = blake3::hash(content.as_bytes());
        // The shard guard must be released before compiling.
        if let Some(existing) = self.sessions.get(name) {
            if existing.raw_key != change.key {
                return ChangeOutcome::Failed(ReloadError::NameCollision {
                    name: name.to_string(),
                    existing_key: existing.raw_key.clone(),
                });
            }
            if existing.fingerprint == fingerprint {
                debug!(%name, "content unchanged, keeping session");
                return ChangeOutcome::Unchanged;
            }
        }

        let session = match self.pool.compile(content) {
            Ok(session) => session,
            Err(e) => return ChangeOutcome::Failed(e),
        };

        match self.sessions.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.raw_key != change.key {
                    return ChangeOutcome::Failed(ReloadError::NameCollision {
                        name: name.to_string(),
                        existing_key: current.raw_key.clone(),
                    });
                }
                let revision = current.revision + 1;
                let mut entry = RegistryEntry::new(change.key.clone(), session, fingerprint);
                entry.revision = revision;
                occupied.insert(entry);
                info!(%name, revision, "rule session reloaded");
                ChangeOutcome::Updated { revision }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(RegistryEntry::new(change.key.clone(), session, fingerprint));
                info!(%name, "rule session added");
                ChangeOutcome::Updated { revision: 1 }
            }
        }
    }

    fn apply_deletion(&self, name: &str, key: &str) -> ChangeOutcome {
        match self.deletion_policy {
            DeletionPolicy::RetainLastGood => {
                if self.sessions.contains_key(name) {
                    debug!(%name, %key, "content removed upstream, retaining last good session");
                    ChangeOutcome::Retained
                } else {
                    ChangeOutcome::Skipped
                }
            }
            DeletionPolicy::RemoveOnAbsent => {
                if self.sessions.remove_if(name, |_, e| e.raw_key == key).is_some() {
                    warn!(%name, %key, "content removed upstream, session dropped");
                    ChangeOutcome::Removed
                } else {
                    ChangeOutcome::Skipped
                }
            }
        }
    }

    /// Start a worker applying `source`'s change batches to this registry.
    ///
    /// Only valid once the initial load has succeeded; batches are filtered
    /// with the filter that load used.
    pub fn subscribe(self: &Arc<Self>, source: &dyn ConfigSource) -> RegistryResult<ReloadWorker> {
        let state = self.state();
        if state != RegistryState::Ready {
            return Err(RegistryError::InvalidState {
                expected: RegistryState::Ready,
                actual: state,
            });
        }
        let filter = self
            .filter
            .get()
            .ok_or_else(|| RegistryError::internal("ready registry has no filter"))?;
        let batches = source.subscribe(&filter.namespace)?;
        ReloadWorker::spawn(Arc::clone(self), batches)
    }

    /// The current session for `name`.
    ///
    /// The returned `Arc` stays valid after the name is reloaded; callers see
    /// the new session on their next lookup.
    pub fn lookup(&self, name: &str) -> Result<Arc<C::Session>, LookupError> {
        let state = self.state();
        if state != RegistryState::Ready {
            return Err(LookupError::NotReady { state });
        }
        self.sessions
            .get(name)
            .map(|e| Arc::clone(&e.session))
            .ok_or_else(|| LookupError::NotFound { name: name.to_string() })
    }

    /// Like [`lookup`](Self::lookup), discarding the reason for a miss.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<C::Session>> {
        self.lookup(name).ok()
    }

    /// Metadata for `name`'s current session.
    #[must_use]
    pub fn entry_info(&self, name: &str) -> Option<EntryInfo> {
        self.sessions.get(name).map(|e| EntryInfo {
            name: e.key().clone(),
            key: e.raw_key.clone(),
            revision: e.revision,
            fingerprint: e.fingerprint.to_hex().to_string(),
            loaded_at: e.loaded_at,
        })
    }

    /// Published session names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of published sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn transition(&self, from: RegistryState, to: RegistryState) -> RegistryResult<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| RegistryError::InvalidState {
                expected: from,
                actual: RegistryState::from_u8(actual),
            })
    }
}
