//! Thread-safe engine for script execution
//!
//! The Engine owns a pool of worker threads, each with its own isolate and
//! context. Jobs are submitted through a cloneable [`EngineHandle`] and
//! answered with JSON.
//!
//! # Example
//!
//! ```no_run
//! use tern_runtime::Engine;
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = Engine::new().unwrap();
//!     let handle = engine.handle();
//!
//!     let result = handle.eval("1 + 1").await.unwrap();
//!     assert_eq!(result, serde_json::json!(2));
//!
//!     engine.shutdown().await;
//! }
//! ```

use crate::config::RuntimeConfig;
use crate::console;
use crate::error::{RuntimeError, RuntimeResult};
use crate::extension::{Extension, ExtensionState};
use crate::watchdog::{self, WorkerSlot};
use crate::worker::{Job, run_worker};
use crossbeam_channel::{Sender, TrySendError, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use tern_core::{Context, HeapLimits, Isolate};
use tokio::sync::oneshot;
use tracing::{debug, info};

const WORKER_STACK_SIZE: usize = 16 * 1024 * 1024;

/// Statistics about engine operation
///
/// All counters are atomic and can be read at any time without locking.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Total number of jobs submitted to the engine
    pub jobs_submitted: AtomicU64,
    /// Total number of jobs completed (successfully or with error)
    pub jobs_completed: AtomicU64,
    /// Number of jobs that failed with an error
    pub jobs_failed: AtomicU64,
    /// Failed jobs that were stopped by the watchdog
    pub jobs_timed_out: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get snapshot of current stats
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_timed_out: self.jobs_timed_out.load(Ordering::Relaxed),
        }
    }

    /// Jobs submitted but not yet answered
    pub fn jobs_in_flight(&self) -> u64 {
        let submitted = self.jobs_submitted.load(Ordering::Relaxed);
        let completed = self.jobs_completed.load(Ordering::Relaxed);
        submitted.saturating_sub(completed)
    }
}

/// A point-in-time snapshot of engine statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_timed_out: u64,
}

impl EngineStatsSnapshot {
    /// Get the success rate as a percentage (0.0 - 100.0)
    pub fn success_rate(&self) -> f64 {
        if self.jobs_completed == 0 {
            100.0
        } else {
            let succeeded = self.jobs_completed - self.jobs_failed;
            (succeeded as f64 / self.jobs_completed as f64) * 100.0
        }
    }
}

/// Builder for creating an Engine with custom configuration
pub struct EngineBuilder {
    config: RuntimeConfig,
    extensions: Vec<Extension>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        tern_core::init();

        Self {
            config: RuntimeConfig::default(),
            extensions: Vec::new(),
        }
    }
}

impl EngineBuilder {
    /// Set the number of worker threads
    ///
    /// Default is the number of CPU cores.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = size.max(1);
        self
    }

    /// Set the job queue capacity (backpressure threshold)
    ///
    /// When the queue is full, `try_eval` returns [`RuntimeError::QueueFull`].
    /// Default is 1024.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity.max(1);
        self
    }

    /// Per-job time limit; `0` disables it
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.timeout_ms = timeout_ms;
        self
    }

    pub fn enable_console(mut self, enable: bool) -> Self {
        self.config.enable_console = enable;
        self
    }

    pub fn heap_limits(mut self, limits: HeapLimits) -> Self {
        self.config.heap = limits;
        self
    }

    /// Replace every setting at once
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an extension to be available in all contexts
    pub fn extension(mut self, ext: Extension) -> Self {
        self.extensions.push(ext);
        self
    }

    /// Build the engine and start worker threads
    pub fn build(self) -> RuntimeResult<Engine> {
        Engine::new_with_config(self)
    }
}

/// Script execution engine with a pool of worker threads
///
/// Use [`Engine::handle`] to get a thread-safe handle for submitting jobs.
pub struct Engine {
    job_tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<EngineStats>,
    watchdog_stop: Option<Sender<()>>,
    watchdog: Option<JoinHandle<()>>,
}

impl Engine {
    /// Create a new engine with default configuration
    pub fn new() -> RuntimeResult<Self> {
        Self::builder().build()
    }

    /// Create a builder for custom configuration
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    fn new_with_config(builder: EngineBuilder) -> RuntimeResult<Self> {
        let EngineBuilder { config, extensions } = builder;
        let (job_tx, job_rx) = bounded::<Job>(config.queue_capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(EngineStats::new());

        // Contexts are prepared here so setup failures surface from build()
        let mut prepared = Vec::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            let context = prepare_context(&config, &extensions)?;
            let slot = Arc::new(WorkerSlot::new(
                context.isolate().clone(),
                config.timeout_ms,
            ));
            prepared.push((context, slot));
        }

        let (watchdog_stop, watchdog) = if config.timeout_ms > 0 {
            let slots = prepared.iter().map(|(_, slot)| slot.clone()).collect();
            let (stop_tx, stop_rx) = bounded(1);
            let handle = watchdog::spawn(slots, stop_rx)
                .map_err(|e| RuntimeError::internal(format!("Failed to spawn watchdog: {}", e)))?;
            (Some(stop_tx), Some(handle))
        } else {
            (None, None)
        };

        let mut workers = Vec::with_capacity(config.pool_size);
        for (i, (context, slot)) in prepared.into_iter().enumerate() {
            let rx = job_rx.clone();
            let worker_stats = stats.clone();

            let handle = std::thread::Builder::new()
                .name(format!("tern-worker-{}", i))
                .stack_size(WORKER_STACK_SIZE)
                .spawn(move || run_worker(rx, context, slot, worker_stats))
                .map_err(|e| RuntimeError::internal(format!("Failed to spawn worker: {}", e)))?;

            workers.push(handle);
        }

        info!(
            pool_size = workers.len(),
            queue_capacity = config.queue_capacity,
            timeout_ms = config.timeout_ms,
            "Engine started"
        );

        Ok(Self {
            job_tx,
            workers,
            shutdown,
            stats,
            watchdog_stop,
            watchdog,
        })
    }

    /// Get a thread-safe handle for submitting jobs
    ///
    /// The handle can be cloned and shared across threads.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            job_tx: self.job_tx.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Get the engine statistics
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Shutdown the engine and wait for all workers to finish
    pub async fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);

        for _ in &self.workers {
            let _ = self.job_tx.send(Job::Shutdown);
        }
        // Dropping the sender stops the watchdog
        self.watchdog_stop.take();

        let workers = std::mem::take(&mut self.workers);
        let watchdog = self.watchdog.take();
        tokio::task::spawn_blocking(move || {
            for worker in workers {
                let _ = worker.join();
            }
            if let Some(watchdog) = watchdog {
                let _ = watchdog.join();
            }
        })
        .await
        .ok();
        debug!("Engine shut down");
    }

    /// Check if the engine is still running
    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst)
    }

    /// Get the number of worker threads
    pub fn pool_size(&self) -> usize {
        self.workers.len()
    }
}

/// Isolate and context for one worker, with console and extensions installed
fn prepare_context(config: &RuntimeConfig, extensions: &[Extension]) -> RuntimeResult<Context> {
    let isolate = Isolate::with_heap_limits(config.heap);
    let context = Context::new(&isolate)?;
    let installed = context.with_scope(|cx| -> RuntimeResult<()> {
        if config.enable_console {
            console::install(cx)?;
        }
        let state = ExtensionState::new();
        for ext in extensions {
            ext.install(cx, &state)?;
        }
        Ok(())
    });
    match installed.map_err(RuntimeError::from).and_then(|result| result) {
        Ok(()) => Ok(context),
        Err(err) => {
            context.close();
            isolate.dispose();
            Err(err)
        }
    }
}

/// Thread-safe handle for submitting script execution jobs
///
/// All script execution happens on the engine's worker threads.
#[derive(Clone)]
pub struct EngineHandle {
    job_tx: Sender<Job>,
    stats: Arc<EngineStats>,
}

impl EngineHandle {
    /// Evaluate script source and return the result as JSON
    ///
    /// A promise result is settled first; a rejection becomes a script error.
    ///
    /// ```no_run
    /// # async fn example(handle: tern_runtime::EngineHandle) {
    /// let result = handle.eval("[1, 2].map(x => x * 2)").await.unwrap();
    /// assert_eq!(result, serde_json::json!([2, 4]));
    /// # }
    /// ```
    pub async fn eval(&self, script: impl Into<String>) -> RuntimeResult<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        self.submit(Job::Eval {
            script: script.into(),
            source_url: None,
            response: tx,
        })?;
        receive(rx).await
    }

    /// Evaluate script source with a source URL for error locations
    pub async fn eval_with_source(
        &self,
        script: impl Into<String>,
        source_url: impl Into<String>,
    ) -> RuntimeResult<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        self.submit(Job::Eval {
            script: script.into(),
            source_url: Some(source_url.into()),
            response: tx,
        })?;
        receive(rx).await
    }

    /// Call a global function with JSON arguments
    pub async fn call(
        &self,
        function: impl Into<String>,
        args: Vec<serde_json::Value>,
    ) -> RuntimeResult<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        self.submit(Job::Call {
            function: function.into(),
            args,
            response: tx,
        })?;
        receive(rx).await
    }

    /// Like [`eval`](Self::eval), but fails with [`RuntimeError::QueueFull`]
    /// instead of waiting for room in the queue
    pub async fn try_eval(&self, script: impl Into<String>) -> RuntimeResult<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        let job = Job::Eval {
            script: script.into(),
            source_url: None,
            response: tx,
        };
        match self.job_tx.try_send(job) {
            Ok(()) => {
                self.stats.jobs_submitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => return Err(RuntimeError::QueueFull),
            Err(TrySendError::Disconnected(_)) => return Err(RuntimeError::Shutdown),
        }
        receive(rx).await
    }

    /// Get the engine statistics
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    fn submit(&self, job: Job) -> RuntimeResult<()> {
        self.stats.jobs_submitted.fetch_add(1, Ordering::Relaxed);
        self.job_tx.send(job).map_err(|_| {
            self.stats.jobs_submitted.fetch_sub(1, Ordering::Relaxed);
            RuntimeError::Shutdown
        })
    }
}

async fn receive(
    rx: oneshot::Receiver<RuntimeResult<serde_json::Value>>,
) -> RuntimeResult<serde_json::Value> {
    rx.await
        .map_err(|_| RuntimeError::internal("Worker dropped response"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate() {
        let snapshot = EngineStatsSnapshot {
            jobs_submitted: 4,
            jobs_completed: 4,
            jobs_failed: 1,
            jobs_timed_out: 0,
        };
        assert_eq!(snapshot.success_rate(), 75.0);

        let empty = EngineStats::new().snapshot();
        assert_eq!(empty.success_rate(), 100.0);
    }

    #[test]
    fn test_handle_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EngineHandle>();
        assert_send_sync::<Engine>();
    }

    #[test]
    fn test_failed_setup_surfaces_from_build() {
        let broken = Extension::new("broken").with_js("throw new Error('boom')");
        let err = Engine::builder()
            .pool_size(1)
            .extension(broken)
            .build()
            .err()
            .unwrap();
        assert!(err.is_script_error());
    }
}
