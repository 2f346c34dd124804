use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rulehub::{
    ChangeBatch, CompileError, InMemoryConfigSource, PropertyChange, RegistryConfig, RuleCompiler, SessionRegistry,
};

/// Session whose fields must always agree; a torn read would break `checksum`.
#[derive(Debug)]
struct Versioned {
    version: u64,
    checksum: u64,
}

/// Parses `v<N>` or `v<N>@<delay_ms>`; `bad` fails.
struct SlowVersionCompiler;

impl RuleCompiler for SlowVersionCompiler {
    type Session = Versioned;

    fn compile(&self, source: &str) -> Result<Versioned, CompileError> {
        let (body, delay) = match source.split_once('@') {
            Some((body, ms)) => (body, ms.parse::<u64>().map_err(|e| CompileError::new(e.to_string()))?),
            None => (source, 0),
        };
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
        let version = body
            .strip_prefix('v')
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| CompileError::new(format!("not a version: {body}")))?;
        Ok(Versioned {
            version,
            checksum: version.wrapping_mul(31),
        })
    }
}

fn config() -> RegistryConfig {
    RegistryConfig {
        compile_workers: 4,
        compile_timeout_ms: 2_000,
        ..RegistryConfig::default()
    }
}

#[test]
fn lookups_do_not_wait_for_slow_reloads() {
    let source = InMemoryConfigSource::new();
    source.set("rules", "rules.a", "v1").unwrap();
    source.set("rules", "rules.b", "v1").unwrap();
    let registry = SessionRegistry::bootstrap(SlowVersionCompiler, &config(), &source).unwrap();
    let worker = registry.subscribe(&source).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let mut readers = Vec::new();
    for _ in 0..8 {
        let registry = Arc::clone(&registry);
        let stop = Arc::clone(&stop);
        readers.push(thread::spawn(move || {
            let mut worst = Duration::ZERO;
            while !stop.load(Ordering::Relaxed) {
                let started = Instant::now();
                let session = registry.lookup("rulesB").unwrap();
                worst = worst.max(started.elapsed());
                assert_eq!(session.checksum, session.version.wrapping_mul(31));
            }
            worst
        }));
    }

    // Each reload of rules.a spends 150ms compiling.
    for v in 2..=4 {
        source.set("rules", "rules.a", format!("v{v}@150")).unwrap();
        let report = worker.next_report(Duration::from_secs(5)).unwrap();
        assert!(report.is_clean());
    }

    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        let worst = reader.join().unwrap();
        assert!(worst < Duration::from_millis(100), "lookup blocked for {worst:?}");
    }
    assert_eq!(registry.lookup("rulesA").unwrap().version, 4);
}

#[test]
fn readers_only_ever_see_complete_sessions() {
    let source = InMemoryConfigSource::new();
    source.set("rules", "rules.hot", "v1").unwrap();
    let registry = SessionRegistry::bootstrap(SlowVersionCompiler, &config(), &source).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let registry = Arc::clone(&registry);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut last = 0;
            while !stop.load(Ordering::Relaxed) {
                let session = registry.lookup("rulesHot").unwrap();
                assert_eq!(session.checksum, session.version.wrapping_mul(31));
                // Updates are applied in order here, so versions never go backwards.
                assert!(session.version >= last);
                last = session.version;
            }
        })
    };

    for v in 2..=200u64 {
        let batch = ChangeBatch::new(
            "rules",
            vec![PropertyChange::new("rules.hot", Some(format!("v{}", v - 1)), Some(format!("v{v}")))],
        );
        let report = registry.apply_batch(&batch).unwrap();
        assert!(report.is_clean());
        // Visible as soon as apply returns.
        assert_eq!(registry.lookup("rulesHot").unwrap().version, v);
    }

    stop.store(true, Ordering::Relaxed);
    reader.join().unwrap();
}

#[test]
fn failure_isolation_within_one_batch() {
    let source = InMemoryConfigSource::new();
    source.set("rules", "rules.a", "v1").unwrap();
    source.set("rules", "rules.b", "v1").unwrap();
    let registry = SessionRegistry::bootstrap(SlowVersionCompiler, &config(), &source).unwrap();

    let report = registry
        .apply_batch(&ChangeBatch::new(
            "rules",
            vec![
                PropertyChange::new("rules.a", Some("v1".into()), Some("bad".into())),
                PropertyChange::new("rules.b", Some("v1".into()), Some("v2".into())),
            ],
        ))
        .unwrap();

    assert_eq!(report.failed().count(), 1);
    assert_eq!(registry.lookup("rulesA").unwrap().version, 1);
    assert_eq!(registry.lookup("rulesB").unwrap().version, 2);
}

#[test]
fn reload_timeout_keeps_previous_session() {
    let source = InMemoryConfigSource::new();
    source.set("rules", "rules.a", "v1").unwrap();
    let cfg = RegistryConfig {
        compile_timeout_ms: 50,
        ..config()
    };
    let registry = SessionRegistry::bootstrap(SlowVersionCompiler, &cfg, &source).unwrap();

    let started = Instant::now();
    let report = registry
        .apply_batch(&ChangeBatch::new(
            "rules",
            vec![PropertyChange::new("rules.a", Some("v1".into()), Some("v2@1000".into()))],
        ))
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(
        report.outcome("rules.a"),
        Some(&rulehub::ChangeOutcome::Failed(rulehub::ReloadError::CompileTimeout { timeout_ms: 50 }))
    );
    assert_eq!(registry.lookup("rulesA").unwrap().version, 1);
}

#[test]
fn concurrent_batches_for_different_names_are_independent() {
    let source = InMemoryConfigSource::new();
    for i in 0..8 {
        source.set("rules", &format!("rules.n{i}"), "v1").unwrap();
    }
    let registry = SessionRegistry::bootstrap(SlowVersionCompiler, &config(), &source).unwrap();

    let writers: Vec<_> = (0..8)
        .map(|i| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for v in 2..=20u64 {
                    let batch = ChangeBatch::new(
                        "rules",
                        vec![PropertyChange::new(format!("rules.n{i}"), None, Some(format!("v{v}")))],
                    );
                    registry.apply_batch(&batch).unwrap();
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }

    for i in 0..8 {
        let name = format!("rulesN{i}");
        assert_eq!(registry.lookup(&name).unwrap().version, 20);
        assert_eq!(registry.entry_info(&name).unwrap().revision, 20);
    }
}

#[test]
fn redelivered_batch_is_idempotent() {
    let source = InMemoryConfigSource::new();
    source.set("rules", "rules.a", "v1").unwrap();
    let registry = SessionRegistry::bootstrap(SlowVersionCompiler, &config(), &source).unwrap();

    let batch = ChangeBatch::new(
        "rules",
        vec![PropertyChange::new("rules.a", Some("v1".into()), Some("v2".into()))],
    );
    let first = registry.apply_batch(&batch).unwrap();
    assert_eq!(first.outcome("rules.a"), Some(&rulehub::ChangeOutcome::Updated { revision: 2 }));
    let session = registry.lookup("rulesA").unwrap();

    let again = registry.apply_batch(&batch).unwrap();
    assert_eq!(again.outcome("rules.a"), Some(&rulehub::ChangeOutcome::Unchanged));
    assert!(Arc::ptr_eq(&session, &registry.lookup("rulesA").unwrap()));
    assert_eq!(registry.entry_info("rulesA").unwrap().revision, 2);
}

#[test]
fn hung_compiles_do_not_starve_other_names() {
    let source = InMemoryConfigSource::new();
    for key in ["rules.a", "rules.b", "rules.c", "rules.d"] {
        source.set("rules", key, "v1").unwrap();
    }
    let cfg = RegistryConfig {
        compile_workers: 2,
        compile_timeout_ms: 100,
        ..RegistryConfig::default()
    };
    let registry = SessionRegistry::bootstrap(SlowVersionCompiler, &cfg, &source).unwrap();

    // One more hung key than there are compile workers.
    let report = registry
        .apply_batch(&ChangeBatch::new(
            "rules",
            ["rules.a", "rules.b", "rules.c"]
                .into_iter()
                .map(|key| PropertyChange::new(key, Some("v1".into()), Some("v2@60000".into())))
                .collect(),
        ))
        .unwrap();
    assert_eq!(report.failed().count(), 3);

    let report = registry
        .apply_batch(&ChangeBatch::new(
            "rules",
            vec![PropertyChange::new("rules.d", Some("v1".into()), Some("v2".into()))],
        ))
        .unwrap();
    assert_eq!(report.outcome("rules.d"), Some(&rulehub::ChangeOutcome::Updated { revision: 2 }));
    assert_eq!(registry.lookup("rulesD").unwrap().version, 2);
    assert_eq!(registry.lookup("rulesA").unwrap().version, 1);
}
