//! Change batch consumer.
//!
//! A `ReloadWorker` owns a dedicated thread that receives `ChangeBatch`es from
//! a configuration source and applies them to a registry, one batch at a
//! time. Reports for applied batches are offered on a bounded stream; a slow
//! report consumer never stalls reloads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, warn};

use crate::compiler::RuleCompiler;
use crate::error::{RegistryError, RegistryResult, ReloadError};
use crate::registry::SessionRegistry;
use crate::source::{BatchId, ChangeBatch};

/// Capacity of the report stream.
const REPORT_QUEUE_CAPACITY: usize = 256;

/// What applying one change did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// A new session was published under the name.
    Updated {
        /// Revision of the published session.
        revision: u64,
    },
    /// Content matched the current session; nothing was recompiled.
    Unchanged,
    /// Content was deleted and the session dropped.
    Removed,
    /// Content was deleted and the last good session kept.
    Retained,
    /// Key not selected, or nothing to act on.
    Skipped,
    /// Reload failed; any previous session stays published.
    Failed(ReloadError),
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeResult {
    pub key: String,
    /// Canonical name, when the key was selected.
    pub name: Option<String>,
    pub outcome: ChangeOutcome,
}

/// Per-key results of applying one change batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadReport {
    /// Batch the report describes.
    pub batch_id: BatchId,
    /// One result per change, in batch order.
    pub results: Vec<ChangeResult>,
}

impl ReloadReport {
    pub(crate) const fn new(batch_id: BatchId) -> Self {
        Self {
            batch_id,
            results: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, key: String, name: Option<String>, outcome: ChangeOutcome) {
        self.results.push(ChangeResult { key, name, outcome });
    }

    /// Outcome recorded for `key` (the last one, if the batch repeats a key).
    #[must_use]
    pub fn outcome(&self, key: &str) -> Option<&ChangeOutcome> {
        self.results.iter().rev().find(|r| r.key == key).map(|r| &r.outcome)
    }

    /// Results that published a new session.
    pub fn updated(&self) -> impl Iterator<Item = &ChangeResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, ChangeOutcome::Updated { .. }))
    }

    /// Results that failed.
    pub fn failed(&self) -> impl Iterator<Item = &ChangeResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, ChangeOutcome::Failed(_)))
    }

    /// Returns true if every change succeeded or was skipped.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed().next().is_none()
    }
}

#[derive(Debug, Default)]
struct Counters {
    batches: AtomicU64,
    failures: AtomicU64,
    dropped_reports: AtomicU64,
}

/// Handle to a running reload thread.
///
/// Dropping the handle stops the thread after its current batch and joins it.
#[derive(Debug)]
pub struct ReloadWorker {
    stop_tx: Option<Sender<()>>,
    reports: Receiver<ReloadReport>,
    counters: Arc<Counters>,
    join: Option<JoinHandle<()>>,
}

impl ReloadWorker {
    /// Start applying `batches` to `registry`.
    pub fn spawn<C: RuleCompiler>(
        registry: Arc<SessionRegistry<C>>,
        batches: Receiver<ChangeBatch>,
    ) -> RegistryResult<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (report_tx, reports) = bounded::<ReloadReport>(REPORT_QUEUE_CAPACITY);
        let counters = Arc::new(Counters::default());

        let thread_counters = Arc::clone(&counters);
        let join = thread::Builder::new()
            .name("rulehub-reload".to_string())
            .spawn(move || worker_loop(&registry, &batches, &stop_rx, &report_tx, &thread_counters))
            .map_err(|e| RegistryError::internal(format!("failed to spawn reload worker: {e}")))?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            reports,
            counters,
            join: Some(join),
        })
    }

    /// Reports for applied batches.
    ///
    /// Reports are dropped, not queued, once the stream is full.
    #[must_use]
    pub fn reports(&self) -> &Receiver<ReloadReport> {
        &self.reports
    }

    /// Wait for the next report.
    pub fn next_report(&self, timeout: Duration) -> RegistryResult<ReloadReport> {
        self.reports.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => RegistryError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            },
            RecvTimeoutError::Disconnected => RegistryError::Disconnected {
                path: "reload_reports".to_string(),
            },
        })
    }

    /// Batches applied so far.
    #[must_use]
    pub fn batches_applied(&self) -> u64 {
        self.counters.batches.load(Ordering::Relaxed)
    }

    /// Changes that failed to reload so far.
    #[must_use]
    pub fn changes_failed(&self) -> u64 {
        self.counters.failures.load(Ordering::Relaxed)
    }

    /// Reports dropped because the report stream was full.
    #[must_use]
    pub fn dropped_reports(&self) -> u64 {
        self.counters.dropped_reports.load(Ordering::Relaxed)
    }

    /// Returns true while the reload thread is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // Closing the stop channel wakes the select below.
        drop(self.stop_tx.take());
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReloadWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<C: RuleCompiler>(
    registry: &SessionRegistry<C>,
    batches: &Receiver<ChangeBatch>,
    stop_rx: &Receiver<()>,
    report_tx: &Sender<ReloadReport>,
    counters: &Counters,
) {
    loop {
        select! {
            recv(stop_rx) -> _ => break,
            recv(batches) -> msg => {
                let Ok(batch) = msg else {
                    debug!("change stream closed, reload worker exiting");
                    break;
                };
                match registry.apply_batch(&batch) {
                    Ok(report) => {
                        let failed = report.failed().count() as u64;
                        counters.failures.fetch_add(failed, Ordering::Relaxed);
                        counters.batches.fetch_add(1, Ordering::Relaxed);
                        match report_tx.try_send(report) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                                counters.dropped_reports.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(batch = %batch.id, error = %e, "change batch rejected");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::CompileError;
    use crate::config::RegistryConfig;
    use crate::source::{ConfigSource, InMemoryConfigSource, PropertyChange};

    struct Echo;

    impl RuleCompiler for Echo {
        type Session = String;

        fn compile(&self, source: &str) -> Result<String, CompileError> {
            if source.starts_with('!') {
                return Err(CompileError::new("rejected"));
            }
            Ok(source.to_string())
        }
    }

    fn registry(source: &InMemoryConfigSource) -> Arc<SessionRegistry<Echo>> {
        SessionRegistry::bootstrap(Echo, &RegistryConfig::default(), source).unwrap()
    }

    #[test]
    fn test_report_queries() {
        let mut report = ReloadReport::new(BatchId::new());
        report.push("rules.a".into(), Some("rulesA".into()), ChangeOutcome::Updated { revision: 2 });
        report.push("app.b".into(), None, ChangeOutcome::Skipped);
        assert!(report.is_clean());
        report.push(
            "rules.c".into(),
            Some("rulesC".into()),
            ChangeOutcome::Failed(ReloadError::Compile {
                diagnostic: "x".into(),
            }),
        );
        assert_eq!(report.updated().count(), 1);
        assert_eq!(report.failed().count(), 1);
        assert!(!report.is_clean());
        assert_eq!(report.outcome("app.b"), Some(&ChangeOutcome::Skipped));
        assert_eq!(report.outcome("missing"), None);
    }

    #[test]
    fn test_worker_applies_published_batches() {
        let source = InMemoryConfigSource::new();
        source.set("rules", "rules.a", "a1").unwrap();
        let registry = registry(&source);
        let worker = registry.subscribe(&source).unwrap();
        assert!(worker.is_running());

        source.set("rules", "rules.a", "a2").unwrap();
        let report = worker.next_report(Duration::from_secs(2)).unwrap();
        assert_eq!(report.outcome("rules.a"), Some(&ChangeOutcome::Updated { revision: 2 }));
        assert_eq!(registry.lookup("rulesA").unwrap().as_str(), "a2");

        source.set("rules", "rules.a", "!broken").unwrap();
        let report = worker.next_report(Duration::from_secs(2)).unwrap();
        assert!(!report.is_clean());
        assert_eq!(registry.lookup("rulesA").unwrap().as_str(), "a2");

        assert_eq!(worker.batches_applied(), 2);
        assert_eq!(worker.changes_failed(), 1);
        worker.shutdown();
    }

    #[test]
    fn test_worker_exits_when_stream_closes() {
        let source = InMemoryConfigSource::new();
        source.set("rules", "rules.a", "a1").unwrap();
        let registry = registry(&source);

        let (tx, rx) = bounded::<ChangeBatch>(4);
        let worker = ReloadWorker::spawn(Arc::clone(&registry), rx).unwrap();
        tx.send(ChangeBatch::new(
            "rules",
            vec![PropertyChange::new("rules.b", None, Some("b1".into()))],
        ))
        .unwrap();
        drop(tx);

        let report = worker.next_report(Duration::from_secs(2)).unwrap();
        assert_eq!(report.updated().count(), 1);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while worker.is_running() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!worker.is_running());
        assert_eq!(registry.lookup("rulesB").unwrap().as_str(), "b1");
    }

    #[test]
    fn test_drop_stops_worker_and_ends_subscription() {
        let source = InMemoryConfigSource::new();
        source.set("rules", "rules.a", "a1").unwrap();
        let registry = registry(&source);
        let worker = registry.subscribe(&source).unwrap();
        assert_eq!(source.subscriber_count(), 1);
        drop(worker);

        // The receiver went away with the worker thread.
        source.set("rules", "rules.a", "a2").unwrap();
        assert_eq!(source.subscriber_count(), 0);
        assert_eq!(registry.lookup("rulesA").unwrap().as_str(), "a1");
        assert!(source.property_names("rules").unwrap().contains(&"rules.a".to_string()));
    }
}
