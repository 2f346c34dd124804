//! Bounded compile workers.
//!
//! Rule compilation runs on dedicated threads so a caller can bound how long
//! it waits. A compile that outlives its budget is reported as a timeout and
//! its worker is retired: a replacement is started at once, and the stalled
//! thread exits when the compiler finally returns, discarding the result.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::warn;

use crate::compiler::{CompileError, RuleCompiler};
use crate::error::{RegistryError, RegistryResult, ReloadError};

const JOB_PENDING: u8 = 0;
const JOB_DONE: u8 = 1;
const JOB_ABANDONED: u8 = 2;

/// One compile request. `state` decides whether the worker or the waiting
/// caller owns the outcome.
struct Job<S> {
    source: String,
    reply: Sender<Result<S, CompileError>>,
    state: Arc<AtomicU8>,
}

struct Shared<C: RuleCompiler> {
    compiler: C,
    rx: Receiver<Job<C::Session>>,
    next_id: AtomicUsize,
    stalled: AtomicUsize,
}

/// A fixed number of serving compile threads fed by a bounded queue.
pub struct CompilerPool<C: RuleCompiler> {
    shared: Arc<Shared<C>>,
    tx: Option<Sender<Job<C::Session>>>,
    workers: usize,
    queue_capacity: usize,
    timeout: Duration,
}

impl<C: RuleCompiler> CompilerPool<C> {
    /// Start `workers` compile threads.
    pub fn start(compiler: C, workers: usize, queue_capacity: usize, timeout: Duration) -> RegistryResult<Self> {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job<C::Session>>(queue_capacity);
        let shared = Arc::new(Shared {
            compiler,
            rx,
            next_id: AtomicUsize::new(0),
            stalled: AtomicUsize::new(0),
        });

        for _ in 0..workers {
            spawn_worker(&shared)
                .map_err(|e| RegistryError::internal(format!("failed to spawn compile worker: {e}")))?;
        }

        Ok(Self {
            shared,
            tx: Some(tx),
            workers,
            queue_capacity,
            timeout,
        })
    }

    /// Compile `source`, waiting at most the configured budget.
    pub fn compile(&self, source: &str) -> Result<C::Session, ReloadError> {
        let tx = self.tx.as_ref().ok_or_else(|| ReloadError::Unavailable {
            reason: "compile pool is shut down".to_string(),
        })?;

        let (reply, rx) = bounded::<Result<C::Session, CompileError>>(1);
        let state = Arc::new(AtomicU8::new(JOB_PENDING));
        let job = Job {
            source: source.to_string(),
            reply,
            state: Arc::clone(&state),
        };
        match tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                return Err(ReloadError::Unavailable {
                    reason: format!("compile queue full (capacity {})", self.queue_capacity),
                })
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(ReloadError::Unavailable {
                    reason: "compile workers exited".to_string(),
                })
            }
        }

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result.map_err(compile_failed),
            Err(RecvTimeoutError::Timeout) => {
                if state
                    .compare_exchange(JOB_PENDING, JOB_ABANDONED, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // The worker finished just now; its reply is already on its way.
                    return match rx.recv() {
                        Ok(result) => result.map_err(compile_failed),
                        Err(_) => Err(worker_dropped()),
                    };
                }
                self.retire_stalled_worker();
                Err(ReloadError::CompileTimeout {
                    timeout_ms: self.timeout.as_millis().min(u128::from(u64::MAX)) as u64,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(worker_dropped()),
        }
    }

    /// The compiler shared by all workers.
    #[must_use]
    pub fn compiler(&self) -> &C {
        &self.shared.compiler
    }

    /// Per-compile budget.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of threads serving the queue.
    #[must_use]
    pub const fn worker_count(&self) -> usize {
        self.workers
    }

    /// Retired threads still stuck inside a timed-out compile.
    #[must_use]
    pub fn stalled_count(&self) -> usize {
        self.shared.stalled.load(Ordering::Acquire)
    }

    fn retire_stalled_worker(&self) {
        // Count before the replacement starts so the total never dips.
        let stalled = self.shared.stalled.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(stalled, timeout = ?self.timeout, "compile timed out, replacing its worker");
        if let Err(e) = spawn_worker(&self.shared) {
            warn!(error = %e, "failed to spawn replacement compile worker");
        }
    }
}

impl<C: RuleCompiler> Drop for CompilerPool<C> {
    fn drop(&mut self) {
        // Workers are detached; closing the queue lets idle ones exit, and
        // stalled ones exit once their compile returns.
        drop(self.tx.take());
    }
}

fn compile_failed(e: CompileError) -> ReloadError {
    ReloadError::Compile {
        diagnostic: e.to_string(),
    }
}

fn worker_dropped() -> ReloadError {
    ReloadError::Unavailable {
        reason: "compile worker dropped the request".to_string(),
    }
}

fn spawn_worker<C: RuleCompiler>(shared: &Arc<Shared<C>>) -> std::io::Result<()> {
    let idx = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let shared = Arc::clone(shared);
    thread::Builder::new()
        .name(format!("rulehub-compile-{idx}"))
        .spawn(move || worker_loop(&shared))
        .map(|_| ())
}

fn worker_loop<C: RuleCompiler>(shared: &Shared<C>) {
    while let Ok(job) = shared.rx.recv() {
        if job.state.load(Ordering::Acquire) == JOB_ABANDONED {
            // Timed out while queued; this thread has been replaced.
            shared.stalled.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        let result = panic::catch_unwind(AssertUnwindSafe(|| shared.compiler.compile(&job.source)))
            .unwrap_or_else(|_| Err(CompileError::new("rule compiler panicked")));

        if job
            .state
            .compare_exchange(JOB_PENDING, JOB_DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Abandoned after a timeout; a replacement already serves the queue.
            shared.stalled.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        let _ = job.reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    struct SlowCompiler;

    impl RuleCompiler for SlowCompiler {
        type Session = String;

        fn compile(&self, source: &str) -> Result<String, CompileError> {
            if let Some(ms) = source.strip_prefix("sleep:") {
                let ms: u64 = ms.parse().map_err(|_| CompileError::new("bad sleep"))?;
                thread::sleep(Duration::from_millis(ms));
            }
            if source == "panic" {
                panic!("boom");
            }
            if source.starts_with("bad") {
                return Err(CompileError::at_line("bad input", 1));
            }
            Ok(source.to_string())
        }
    }

    fn pool(timeout_ms: u64) -> CompilerPool<SlowCompiler> {
        CompilerPool::start(SlowCompiler, 2, 8, Duration::from_millis(timeout_ms)).unwrap()
    }

    #[test]
    fn compiles_on_worker_threads() {
        let pool = pool(1_000);
        assert_eq!(pool.worker_count(), 2);
        assert_eq!(pool.compile("R1").unwrap(), "R1");
    }

    #[test]
    fn compile_errors_carry_diagnostic() {
        let pool = pool(1_000);
        let err = pool.compile("bad rule").unwrap_err();
        assert_eq!(
            err,
            ReloadError::Compile {
                diagnostic: "line 1: bad input".to_string()
            }
        );
    }

    #[test]
    fn slow_compile_times_out() {
        let pool = pool(20);
        let started = Instant::now();
        let err = pool.compile("sleep:300").unwrap_err();
        assert_eq!(err, ReloadError::CompileTimeout { timeout_ms: 20 });
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(pool.stalled_count(), 1);

        assert_eq!(pool.compile("ok").unwrap(), "ok");
    }

    #[test]
    fn stalled_workers_are_replaced() {
        let pool = pool(50);
        // More hung compiles than workers.
        for _ in 0..3 {
            assert!(matches!(pool.compile("sleep:2000"), Err(ReloadError::CompileTimeout { .. })));
        }
        assert_eq!(pool.stalled_count(), 3);

        let started = Instant::now();
        assert_eq!(pool.compile("fresh").unwrap(), "fresh");
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn stalled_worker_exits_when_compile_returns() {
        let pool = pool(20);
        let _ = pool.compile("sleep:100");
        assert_eq!(pool.stalled_count(), 1);

        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.stalled_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.stalled_count(), 0);
        assert_eq!(pool.compile("after").unwrap(), "after");
    }

    #[test]
    fn panicking_compiler_is_a_compile_error() {
        let pool = pool(1_000);
        let err = pool.compile("panic").unwrap_err();
        assert!(matches!(err, ReloadError::Compile { ref diagnostic } if diagnostic.contains("panicked")));
        // Worker survived the panic.
        assert_eq!(pool.compile("again").unwrap(), "again");
    }

    #[test]
    fn drop_does_not_wait_for_stalled_compile() {
        let pool = pool(10);
        let _ = pool.compile("sleep:500");
        let started = Instant::now();
        drop(pool);
        assert!(started.elapsed() < Duration::from_millis(200));
    }
}
