//! Background maintenance: periodic flush and compaction tasks.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::store::Store;

/// Context provided to background tasks during execution
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

/// Trait for background tasks that run periodically
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// How often to run this task
    fn interval(&self) -> Duration;

    /// Execute the task
    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Scheduler manages background tasks with graceful shutdown
pub struct Scheduler {
    tasks: RwLock<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: RwLock::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Register a periodic background task. Must be called within a tokio
    /// runtime.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let handle = self.spawn_timer_loop(task);
        self.tasks.write().unwrap().push(handle);
        self
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_id += 1;
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                            shutdown: shutdown_rx.resubscribe(),
                        };

                        if let Err(e) = task.execute(ctx).await {
                            tracing::error!(
                                task = task.name(),
                                error = %e,
                                "task execution failed"
                            );
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::info!(task = task.name(), "task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Graceful shutdown - wait for all tasks
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send(()).ok();

        for task in self.tasks.write().unwrap().drain(..) {
            task.await
                .map_err(|e| crate::Error::InvalidState(format!("task join error: {e}")))?;
        }

        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the store's periodic flush and compaction tasks.
pub fn spawn_maintenance(store: Arc<Store>) -> Scheduler {
    let scheduler = Scheduler::new();
    let config = store.config().scheduler.clone();

    scheduler.register(Arc::new(FlushTask {
        store: store.clone(),
        interval: config.flush_interval,
    }));
    scheduler.register(Arc::new(CompactionTask {
        interval: config.compaction_interval,
        retries: Mutex::new(RetryState::new(
            store.config().compaction.max_failures,
            store.config().compaction.retry_backoff,
        )),
        store,
    }));

    scheduler
}

struct FlushTask {
    store: Arc<Store>,
    interval: Duration,
}

#[async_trait::async_trait]
impl BackgroundTask for FlushTask {
    fn name(&self) -> &'static str {
        "flush"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        while self.store.flush()? {}
        Ok(())
    }
}

/// Failure bookkeeping for the background compactor: exponential backoff
/// between retries, escalating to a halted engine when retries run out.
struct RetryState {
    failures: u32,
    max_failures: u32,
    base_backoff: Duration,
    next_attempt: Option<Instant>,
}

impl RetryState {
    fn new(max_failures: u32, base_backoff: Duration) -> Self {
        Self {
            failures: 0,
            max_failures,
            base_backoff,
            next_attempt: None,
        }
    }

    fn ready(&self, now: Instant) -> bool {
        self.next_attempt.map_or(true, |at| now >= at)
    }

    fn record_success(&mut self) {
        self.failures = 0;
        self.next_attempt = None;
    }

    /// Returns true once the failure budget is exhausted.
    fn record_failure(&mut self, now: Instant) -> bool {
        self.failures += 1;
        if self.failures >= self.max_failures {
            return true;
        }
        let backoff = self
            .base_backoff
            .saturating_mul(1u32 << (self.failures - 1).min(16));
        self.next_attempt = Some(now + backoff);
        false
    }

    fn failures(&self) -> u32 {
        self.failures
    }
}

struct CompactionTask {
    store: Arc<Store>,
    interval: Duration,
    retries: Mutex<RetryState>,
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        if self.store.state.is_halted() {
            return Ok(());
        }

        let now = Instant::now();
        if !self.retries.lock()?.ready(now) {
            return Ok(());
        }

        match self.store.compact() {
            Ok(_) => {
                self.retries.lock()?.record_success();
                Ok(())
            }
            Err(e) => {
                let mut retries = self.retries.lock()?;
                let exhausted = retries.record_failure(now);
                if exhausted {
                    tracing::error!(
                        error = %e,
                        failures = retries.failures(),
                        "compaction failures exhausted retries, halting engine"
                    );
                    self.store.state.halt();
                } else {
                    tracing::warn!(
                        error = %e,
                        failures = retries.failures(),
                        "compaction failed, backing off"
                    );
                }
                Ok(())
            }
        }
    }
}
