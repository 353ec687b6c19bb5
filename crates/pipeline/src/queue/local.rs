//! In-process task queue on a tokio worker pool.
//!
//! Jobs go through a bounded channel to `workers` tasks. Each attempt is
//! bounded by the job's timeout; retryable failures and timeouts are put back
//! on the channel after an exponential backoff until `max_retry` is used up.
//! Permanent failures are dead-lettered on the spot. Nothing survives a
//! process restart; the backfill entry point re-enqueues unanalysed emails.

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{JobHandler, JobId, JobOptions, TaskQueue};
use crate::error::{JobError, QueueError};

#[derive(Debug, Clone)]
pub struct LocalQueueConfig {
    pub workers: usize,
    pub capacity: usize,
    /// Delay before the first retry; doubles on each further retry
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for LocalQueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            capacity: 1024,
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(300),
        }
    }
}

/// Snapshot of the queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub submitted: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub timed_out: u64,
    pub dead_lettered: u64,
    /// Jobs still queued when the queue shut down
    pub dropped: u64,
    pub in_flight: usize,
}

struct Envelope {
    id: JobId,
    job_type: String,
    payload: Vec<u8>,
    options: JobOptions,
    /// Retries already used
    retries: u32,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    timed_out: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
}

struct Shared {
    config: LocalQueueConfig,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    counters: Counters,
    in_flight: watch::Sender<usize>,
    shutdown: CancellationToken,
}

/// Handle to a running local queue; cheap to clone.
#[derive(Clone)]
pub struct LocalTaskQueue {
    tx: mpsc::Sender<Envelope>,
    rx: Arc<Mutex<mpsc::Receiver<Envelope>>>,
    shared: Arc<Shared>,
    workers: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

pub struct LocalTaskQueueBuilder {
    config: LocalQueueConfig,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl LocalTaskQueueBuilder {
    /// Register the consumer for `job_type`, replacing any earlier one.
    pub fn handler(mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_type.into(), handler);
        self
    }

    /// Spawn the workers. Cancelling `shutdown` stops them.
    pub fn start(self, shutdown: CancellationToken) -> LocalTaskQueue {
        let workers = self.config.workers.max(1);
        let (tx, rx) = mpsc::channel(self.config.capacity.max(1));
        let (in_flight, _) = watch::channel(0usize);

        let shared = Arc::new(Shared {
            config: self.config,
            handlers: self.handlers,
            counters: Counters::default(),
            in_flight,
            shutdown,
        });

        let rx = Arc::new(Mutex::new(rx));
        let handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|worker| {
                let shared = Arc::clone(&shared);
                let rx = Arc::clone(&rx);
                let tx = tx.clone();
                tokio::spawn(async move { worker_loop(worker, shared, rx, tx).await })
            })
            .collect();

        info!(
            "Task queue started ({} workers, job types: {:?})",
            workers,
            shared.handlers.keys().collect::<Vec<_>>()
        );

        LocalTaskQueue {
            tx,
            rx,
            shared,
            workers: Arc::new(StdMutex::new(handles)),
        }
    }
}

impl LocalTaskQueue {
    pub fn builder(config: LocalQueueConfig) -> LocalTaskQueueBuilder {
        LocalTaskQueueBuilder {
            config,
            handlers: HashMap::new(),
        }
    }

    pub fn stats(&self) -> QueueStats {
        let c = &self.shared.counters;
        QueueStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            in_flight: *self.shared.in_flight.borrow(),
        }
    }

    /// Resolve once every accepted job has either succeeded or been
    /// dead-lettered, including jobs waiting out a retry backoff.
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.in_flight.subscribe();
        // The sender lives in `shared`, so this cannot observe a closed channel
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Stop the workers and wait for them to exit. Jobs still queued are
    /// dropped and no longer count as in flight, so `wait_idle` resolves.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let handles = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Queue worker panicked: {}", e);
            }
        }

        let mut rx = self.rx.lock().await;
        rx.close();
        let mut dropped = 0u64;
        while let Ok(envelope) = rx.try_recv() {
            debug!("Dropping queued job {} ({})", envelope.id, envelope.job_type);
            dropped += 1;
            self.shared.finish();
        }
        if dropped > 0 {
            self.shared.counters.dropped.fetch_add(dropped, Ordering::Relaxed);
            warn!("Dropped {} queued jobs on shutdown", dropped);
        }
    }
}

#[async_trait]
impl TaskQueue for LocalTaskQueue {
    async fn submit(
        &self,
        job_type: &str,
        payload: Vec<u8>,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(QueueError::Closed);
        }
        if !self.shared.handlers.contains_key(job_type) {
            return Err(QueueError::UnknownJobType(job_type.to_string()));
        }

        let id = JobId::new();
        let envelope = Envelope {
            id,
            job_type: job_type.to_string(),
            payload,
            options,
            retries: 0,
        };

        self.shared.in_flight.send_modify(|n| *n += 1);
        if self.tx.send(envelope).await.is_err() {
            self.shared.finish();
            return Err(QueueError::Closed);
        }

        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        debug!("Submitted job {} ({})", id, job_type);
        Ok(id)
    }
}

async fn worker_loop(
    worker: usize,
    shared: Arc<Shared>,
    rx: Arc<Mutex<mpsc::Receiver<Envelope>>>,
    tx: mpsc::Sender<Envelope>,
) {
    loop {
        let envelope = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = shared.shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            }
        };
        shared.run_attempt(envelope, &tx).await;
    }
    debug!("Queue worker {} stopped", worker);
}

impl Shared {
    async fn run_attempt(self: &Arc<Self>, envelope: Envelope, tx: &mpsc::Sender<Envelope>) {
        let Some(handler) = self.handlers.get(&envelope.job_type) else {
            self.dead_letter(&envelope, "no handler registered");
            return;
        };

        let attempt = envelope.retries + 1;
        debug!(
            "Running job {} ({}), attempt {}",
            envelope.id, envelope.job_type, attempt
        );

        // A panicking handler must not take the worker (and the in-flight count) down with it
        let run = AssertUnwindSafe(handler.handle(&envelope.payload)).catch_unwind();

        let outcome = tokio::time::timeout(envelope.options.timeout, run).await;

        match outcome {
            Ok(Ok(Ok(()))) => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                self.finish();
            }
            Ok(Ok(Err(JobError::Permanent(e)))) => {
                self.dead_letter(&envelope, &format!("permanent failure: {:#}", e));
            }
            Ok(Ok(Err(JobError::Retryable(e)))) => {
                self.retry_or_bury(envelope, format!("{:#}", e), tx);
            }
            Ok(Err(_)) => {
                self.dead_letter(&envelope, "handler panicked");
            }
            Err(_) => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                let reason = format!("timed out after {:?}", envelope.options.timeout);
                self.retry_or_bury(envelope, reason, tx);
            }
        }
    }

    fn retry_or_bury(
        self: &Arc<Self>,
        mut envelope: Envelope,
        reason: String,
        tx: &mpsc::Sender<Envelope>,
    ) {
        if envelope.retries >= envelope.options.max_retry {
            self.dead_letter(
                &envelope,
                &format!("{} (gave up after {} retries)", reason, envelope.retries),
            );
            return;
        }

        envelope.retries += 1;
        let delay = self.backoff(envelope.retries);
        self.counters.retried.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Job {} ({}) failed: {}; retry {}/{} in {:?}",
            envelope.id,
            envelope.job_type,
            reason,
            envelope.retries,
            envelope.options.max_retry,
            delay
        );

        let shared = Arc::clone(self);
        let tx = tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.shutdown.cancelled() => {
                    debug!("Dropping retry of job {} on shutdown", envelope.id);
                    shared.finish();
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(returned) = tx.send(envelope).await {
                        shared.dead_letter(&returned.0, "queue closed before retry");
                    }
                }
            }
        });
    }

    fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.config
            .retry_base
            .saturating_mul(factor)
            .min(self.config.retry_max)
    }

    fn dead_letter(&self, envelope: &Envelope, reason: &str) {
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        error!(
            "Job {} ({}) dead-lettered: {}",
            envelope.id, envelope.job_type, reason
        );
        self.finish();
    }

    fn finish(&self) {
        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }
}
