//! DispatchQueue: FIFO task queue in front of every Discord send.
//!
//! A single worker loop pulls tasks in enqueue order and starts each one only
//! when a concurrency slot is free, the global cooldown (if any) has elapsed
//! and the minimum spacing since the previous start has passed. Tasks report
//! throttling back through [`DispatchQueue::report_throttled`], which drives
//! per-request backoff and, after repeated throttles, the global cooldown.

use crate::config::DispatchConfig;
use crate::dispatch::backoff::{Jitter, RandomJitter, backoff_delay};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::time::{Duration, Instant};

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A unit of work waiting for its turn.
struct QueuedTask {
    id: u64,
    context: Option<String>,
    job: Job,
}

/// Snapshot of the limiter for logging and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterState {
    /// Start time of the most recent task.
    pub last_request_time: Option<Instant>,
    pub consecutive_throttles: u32,
    pub active_count: usize,
    pub in_cooldown: bool,
    /// Tasks enqueued but not yet started.
    pub pending: usize,
}

#[derive(Debug, Default)]
struct Limiter {
    last_request_time: Option<Instant>,
    consecutive_throttles: u32,
    cooldown_until: Option<Instant>,
}

impl Limiter {
    /// Time left in the cooldown. Leaving cooldown resets the throttle counter.
    fn cooldown_remaining(&mut self, now: Instant) -> Option<Duration> {
        let until = self.cooldown_until?;
        if now < until {
            return Some(until - now);
        }
        self.cooldown_until = None;
        self.consecutive_throttles = 0;
        tracing::info!("dispatch cooldown ended, resuming");
        None
    }
}

struct Inner {
    config: DispatchConfig,
    jitter: Arc<dyn Jitter>,
    limiter: Mutex<Limiter>,
    slots: Arc<Semaphore>,
    pending: AtomicUsize,
    next_id: AtomicU64,
}

impl Inner {
    /// Wait until the next task may start, then claim the start slot.
    async fn wait_for_turn(&self, task_id: u64) {
        let jitter = self.jitter.sample(self.config.max_jitter);

        loop {
            let wait = {
                let now = Instant::now();
                let mut limiter = self.limiter.lock();

                if let Some(remaining) = limiter.cooldown_remaining(now) {
                    remaining
                } else {
                    let ready_at = limiter
                        .last_request_time
                        .map(|last| last + self.config.min_spacing + jitter);

                    match ready_at {
                        Some(ready_at) if ready_at > now => ready_at - now,
                        _ => {
                            limiter.last_request_time = Some(now);
                            return;
                        }
                    }
                }
            };

            tracing::trace!(task_id, wait_ms = wait.as_millis() as u64, "task waiting for its turn");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Rate-limited FIFO queue for outbound requests. Cheap to clone.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<Inner>,
    tx: mpsc::UnboundedSender<QueuedTask>,
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DispatchQueue {
    /// Create a queue with random jitter. Must be called inside a tokio runtime.
    pub fn new(config: DispatchConfig) -> Self {
        Self::with_jitter(config, Arc::new(RandomJitter))
    }

    pub fn with_jitter(config: DispatchConfig, jitter: Arc<dyn Jitter>) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        let inner = Arc::new(Inner {
            config,
            jitter,
            limiter: Mutex::new(Limiter::default()),
            slots: Arc::new(Semaphore::new(max_concurrent)),
            pending: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(inner.clone(), rx));

        Self { inner, tx }
    }

    /// Queue `task` and wait for its result.
    ///
    /// Resolves to `None` when the task fails or panics; the failure is logged
    /// and never reaches other queued tasks.
    pub async fn enqueue<T, F, Fut>(&self, task: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.submit(None, task).await
    }

    /// Same as [`enqueue`](Self::enqueue), tagging log lines with `context`.
    pub async fn enqueue_with_context<T, F, Fut>(&self, context: impl Into<String>, task: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.submit(Some(context.into()), task).await
    }

    async fn submit<T, F, Fut>(&self, context: Option<String>, task: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (result_tx, result_rx) = oneshot::channel();
        let job_context = context.clone();

        let job: Job = Box::new(move || {
            Box::pin(async move {
                match task().await {
                    Ok(value) => {
                        result_tx.send(Some(value)).ok();
                    }
                    Err(error) => {
                        tracing::warn!(
                            task_id = id,
                            context = job_context.as_deref().unwrap_or("-"),
                            error = %format!("{error:#}"),
                            "queued task failed"
                        );
                        result_tx.send(None).ok();
                    }
                }
            })
        });

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(QueuedTask { id, context, job }).is_err() {
            self.inner.pending.fetch_sub(1, Ordering::SeqCst);
            tracing::error!(task_id = id, "dispatch worker is gone, dropping task");
            return None;
        }

        // A dropped sender means the task panicked; treat it like a failure.
        result_rx.await.ok().flatten()
    }

    /// Record a throttled response and wait before the caller retries.
    ///
    /// Returns the attempt number to retry with. A return value equal to
    /// `attempt` means the retry budget is spent and the caller should give up.
    pub async fn report_throttled(&self, identifier: &str, retry_after: Option<f64>, attempt: u32) -> u32 {
        let config = &self.inner.config;

        let (consecutive, cooldown_wait) = {
            let now = Instant::now();
            let mut limiter = self.inner.limiter.lock();
            let already_cooling = limiter.cooldown_remaining(now);

            limiter.consecutive_throttles += 1;
            let consecutive = limiter.consecutive_throttles;

            let cooldown_wait = match already_cooling {
                Some(remaining) => Some(remaining),
                None if consecutive >= config.max_consecutive_throttles => {
                    limiter.cooldown_until = Some(now + config.cooldown);
                    tracing::warn!(
                        consecutive,
                        cooldown_ms = config.cooldown.as_millis() as u64,
                        "too many consecutive throttles, entering global cooldown"
                    );
                    Some(config.cooldown)
                }
                None => None,
            };

            (consecutive, cooldown_wait)
        };

        tracing::warn!(
            identifier,
            attempt,
            consecutive,
            retry_after = ?retry_after,
            "request throttled"
        );

        if attempt >= config.max_retries {
            tracing::warn!(identifier, attempt, "retry budget exhausted");
            return attempt;
        }

        let wait = match cooldown_wait {
            Some(remaining) => remaining,
            None => {
                let jitter = self.inner.jitter.sample(config.max_jitter);
                backoff_delay(config.base_backoff, attempt, retry_after, jitter)
            }
        };

        tracing::debug!(identifier, attempt, wait_ms = wait.as_millis() as u64, "backing off");
        tokio::time::sleep(wait).await;
        attempt + 1
    }

    /// Record a successful response, clearing the consecutive-throttle count.
    pub fn report_success(&self) {
        self.inner.limiter.lock().consecutive_throttles = 0;
    }

    pub fn is_in_cooldown(&self) -> bool {
        self.inner.limiter.lock().cooldown_remaining(Instant::now()).is_some()
    }

    pub fn state(&self) -> LimiterState {
        let max_concurrent = self.inner.config.max_concurrent.max(1);
        let mut limiter = self.inner.limiter.lock();
        let in_cooldown = limiter.cooldown_remaining(Instant::now()).is_some();

        LimiterState {
            last_request_time: limiter.last_request_time,
            consecutive_throttles: limiter.consecutive_throttles,
            active_count: max_concurrent.saturating_sub(self.inner.slots.available_permits()),
            in_cooldown,
            pending: self.inner.pending.load(Ordering::SeqCst),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.inner.config
    }
}

/// Start queued tasks in order, one concurrency slot each.
async fn run_worker(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<QueuedTask>) {
    while let Some(task) = rx.recv().await {
        let Ok(permit) = inner.slots.clone().acquire_owned().await else {
            break;
        };

        inner.wait_for_turn(task.id).await;
        inner.pending.fetch_sub(1, Ordering::SeqCst);

        tracing::debug!(
            task_id = task.id,
            context = task.context.as_deref().unwrap_or("-"),
            "starting queued task"
        );

        let QueuedTask { id, context, job } = task;
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(error) = tokio::spawn(job()).await
                && error.is_panic()
            {
                tracing::error!(
                    task_id = id,
                    context = context.as_deref().unwrap_or("-"),
                    "queued task panicked"
                );
            }
        });
    }

    tracing::debug!("dispatch worker stopped");
}
