//! Write buffer for batched post ingestion
//!
//! Request handlers queue posts on a bounded channel and return immediately.
//! A single background worker moves them into a batch and commits the batch
//! through a [`PersistenceSink`] when it fills up or when the flush interval
//! elapses, whichever comes first.
//!
//! Delivery is at-most-once: a batch that fails to commit is logged and
//! dropped, and posts still queued when shutdown begins are abandoned.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::IngestConfig;

/// Commits a batch of items to storage in one operation.
///
/// Only ever called from the write buffer's worker task, never concurrently
/// with itself. Must accept an empty slice.
#[async_trait]
pub trait PersistenceSink<T>: Send + Sync + 'static
where
    T: Send + Sync + 'static,
{
    async fn commit_batch(&self, items: &[T]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The intake is at capacity; the caller should retry later
    #[error("write buffer is full")]
    Overloaded,
    /// Shutdown has begun and no more items are accepted
    #[error("write buffer is shut down")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct WriteBufferConfig {
    pub intake_capacity: usize,
    pub max_batch_size: usize,
    /// `None` disables the periodic flush
    pub flush_interval: Option<Duration>,
}

impl From<&IngestConfig> for WriteBufferConfig {
    fn from(config: &IngestConfig) -> Self {
        let interval = config.flush_interval();
        Self {
            intake_capacity: config.intake_capacity,
            max_batch_size: config.max_batch_size,
            flush_interval: (!interval.is_zero()).then_some(interval),
        }
    }
}

/// Counters shared between producers and the worker
#[derive(Debug, Default)]
struct IngestStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    committed: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    flushes: AtomicU64,
}

impl IngestStats {
    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Release);
    }

    fn snapshot(&self) -> IngestSnapshot {
        // Worker-side counters first, so `accepted` is never behind them
        let committed = self.committed.load(Ordering::Acquire);
        let failed = self.failed.load(Ordering::Acquire);
        let abandoned = self.abandoned.load(Ordering::Acquire);
        let flushes = self.flushes.load(Ordering::Acquire);
        IngestSnapshot {
            accepted: self.accepted.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::Relaxed),
            committed,
            failed,
            abandoned,
            flushes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub committed: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub flushes: u64,
}

/// Cloneable, non-blocking submission handle
pub struct WriteSender<T> {
    tx: mpsc::Sender<T>,
    stats: Arc<IngestStats>,
}

impl<T> Clone for WriteSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<T> WriteSender<T> {
    /// Queue an item without waiting. Fails immediately when the intake is full or closed.
    pub fn submit(&self, item: T) -> Result<(), SubmitError> {
        // Counted before the send: the worker may commit the item before try_send returns
        self.stats.accepted.fetch_add(1, Ordering::SeqCst);
        let err = match self.tx.try_send(item) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(_)) => SubmitError::Overloaded,
            Err(TrySendError::Closed(_)) => SubmitError::Closed,
        };
        self.stats.accepted.fetch_sub(1, Ordering::SeqCst);
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        Err(err)
    }

    pub fn stats(&self) -> IngestSnapshot {
        self.stats.snapshot()
    }
}

/// Running write buffer: owns the worker task and its shutdown signal
pub struct WriteBuffer<T> {
    sender: WriteSender<T>,
    shutdown: CancellationToken,
    worker: JoinHandle<WorkerState>,
}

impl<T> WriteBuffer<T>
where
    T: Send + Sync + 'static,
{
    /// Spawn the batch worker. Must be called from within a tokio runtime.
    pub fn start<S>(sink: Arc<S>, config: WriteBufferConfig) -> Self
    where
        S: PersistenceSink<T>,
    {
        let (tx, rx) = mpsc::channel(config.intake_capacity.max(1));
        let stats = Arc::new(IngestStats::default());
        let shutdown = CancellationToken::new();

        let worker = BatchWorker {
            rx,
            batch: Batch::new(config.max_batch_size),
            scheduler: FlushScheduler::new(config.flush_interval),
            sink,
            shutdown: shutdown.clone(),
            stats: stats.clone(),
            state: WorkerState::Running,
        };

        info!(
            "Write buffer started (intake_capacity={}, batch_size={}, flush_interval={:?})",
            config.intake_capacity, config.max_batch_size, config.flush_interval
        );

        Self {
            sender: WriteSender { tx, stats },
            shutdown,
            worker: tokio::spawn(worker.run()),
        }
    }

    pub fn sender(&self) -> WriteSender<T> {
        self.sender.clone()
    }

    pub fn submit(&self, item: T) -> Result<(), SubmitError> {
        self.sender.submit(item)
    }

    pub fn stats(&self) -> IngestSnapshot {
        self.sender.stats()
    }

    /// Signal shutdown and wait for the worker's final flush to complete
    pub async fn shutdown(self) -> IngestSnapshot {
        self.shutdown.cancel();
        match self.worker.await {
            Ok(state) => debug_assert_eq!(state, WorkerState::Stopped),
            Err(e) => error!("Write buffer worker terminated abnormally: {}", e),
        }
        self.sender.stats()
    }
}

/// Posts accumulated between flushes. Only the worker touches it.
struct Batch<T> {
    items: Vec<T>,
    max_size: usize,
}

impl<T> Batch<T> {
    fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            items: Vec::with_capacity(max_size),
            max_size,
        }
    }

    fn push(&mut self, item: T) {
        debug_assert!(self.items.len() < self.max_size);
        self.items.push(item);
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn is_full(&self) -> bool {
        self.items.len() >= self.max_size
    }

    /// Take every item, leaving an empty batch with the same capacity
    fn drain_all(&mut self) -> Vec<T> {
        std::mem::replace(&mut self.items, Vec::with_capacity(self.max_size))
    }
}

/// Fixed-period flush timer. The first tick fires one full period after construction.
struct FlushScheduler {
    interval: Option<Interval>,
}

impl FlushScheduler {
    fn new(period: Option<Duration>) -> Self {
        let interval = period.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        Self { interval }
    }

    /// Resolves on the next tick; never resolves once stopped or when disabled
    async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    fn stop(&mut self) {
        self.interval = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
enum FlushReason {
    Full,
    Timer,
    Shutdown,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "batch full"),
            Self::Timer => write!(f, "timer"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

struct BatchWorker<T, S> {
    rx: mpsc::Receiver<T>,
    batch: Batch<T>,
    scheduler: FlushScheduler,
    sink: Arc<S>,
    shutdown: CancellationToken,
    stats: Arc<IngestStats>,
    state: WorkerState,
}

impl<T, S> BatchWorker<T, S>
where
    T: Send + Sync + 'static,
    S: PersistenceSink<T>,
{
    /// Returns the final state, always `Stopped`
    async fn run(mut self) -> WorkerState {
        while self.state == WorkerState::Running {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    self.state = WorkerState::Draining;
                }
                item = self.rx.recv() => {
                    match item {
                        Some(item) => {
                            self.batch.push(item);
                            if self.batch.is_full() {
                                self.flush(FlushReason::Full).await;
                            }
                        }
                        // Every sender is gone, nothing more can arrive
                        None => self.state = WorkerState::Draining,
                    }
                }
                _ = self.scheduler.tick() => {
                    if !self.batch.is_empty() {
                        self.flush(FlushReason::Timer).await;
                    }
                }
            }
        }

        self.drain().await;
        self.state
    }

    async fn drain(&mut self) {
        debug_assert_eq!(self.state, WorkerState::Draining);

        self.rx.close();
        let mut abandoned = 0;
        while self.rx.try_recv().is_ok() {
            abandoned += 1;
        }
        if abandoned > 0 {
            warn!("Abandoning {} queued posts on shutdown", abandoned);
            IngestStats::add(&self.stats.abandoned, abandoned);
        }

        // An empty batch is not committed
        if !self.batch.is_empty() {
            self.flush(FlushReason::Shutdown).await;
        }

        self.scheduler.stop();
        self.state = WorkerState::Stopped;
        info!("Write buffer shutting down");
    }

    async fn flush(&mut self, reason: FlushReason) {
        let items = self.batch.drain_all();
        let count = items.len();
        debug!("Flushing {} posts to database ({})", count, reason);

        match self.sink.commit_batch(&items).await {
            Ok(()) => {
                IngestStats::add(&self.stats.committed, count);
                debug!("Successfully flushed {} posts", count);
            }
            Err(e) => {
                // Posts are dropped, no retry
                IngestStats::add(&self.stats.failed, count);
                error!("Failed to flush {} posts ({}): {:#}", count, reason, e);
            }
        }
        self.stats.flushes.fetch_add(1, Ordering::Release);
        debug_assert_eq!(self.batch.len(), 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<u32>>>,
        fail: AtomicBool,
    }

    impl RecordingSink {
        fn batches(&self) -> Vec<Vec<u32>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PersistenceSink<u32> for RecordingSink {
        async fn commit_batch(&self, items: &[u32]) -> Result<()> {
            self.batches.lock().unwrap().push(items.to_vec());
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("database is locked");
            }
            Ok(())
        }
    }

    fn config(intake_capacity: usize, max_batch_size: usize, flush_ms: Option<u64>) -> WriteBufferConfig {
        WriteBufferConfig {
            intake_capacity,
            max_batch_size,
            flush_interval: flush_ms.map(Duration::from_millis),
        }
    }

    /// Let the worker run until it is idle. Time is paused, so nothing else advances.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_when_intake_full() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = WriteBuffer::start(sink.clone(), config(3, 100, None));

        // The worker has not run yet, so nothing leaves the intake
        for i in 0..3 {
            assert_eq!(buffer.submit(i), Ok(()));
        }
        assert_eq!(buffer.submit(3), Err(SubmitError::Overloaded));

        // Worker moves the queued posts into its batch, freeing the intake
        settle().await;
        assert_eq!(buffer.submit(4), Ok(()));
        settle().await;

        let stats = buffer.shutdown().await;
        assert_eq!(stats.accepted, 4);
        assert_eq!(stats.rejected, 1);
        assert_eq!(sink.batches(), vec![vec![0, 1, 2, 4]]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_flushes_immediately_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = WriteBuffer::start(sink.clone(), config(16, 5, None));

        for i in 10..15 {
            buffer.submit(i).unwrap();
        }
        settle().await;

        assert_eq!(sink.batches(), vec![vec![10, 11, 12, 13, 14]]);
        assert_eq!(buffer.stats().flushes, 1);

        // Nothing left for the shutdown flush
        buffer.shutdown().await;
        assert_eq!(sink.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_partial_batch() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = WriteBuffer::start(sink.clone(), config(16, 100, Some(50)));

        buffer.submit(7).unwrap();
        settle().await;
        assert!(sink.batches().is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sink.batches(), vec![vec![7]]);

        buffer.shutdown().await;
        assert_eq!(sink.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_does_not_commit() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = WriteBuffer::start(sink.clone(), config(16, 100, Some(50)));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(sink.batches().is_empty());

        let stats = buffer.shutdown().await;
        assert!(sink.batches().is_empty());
        assert_eq!(stats.flushes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn preserves_acceptance_order_across_flushes() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = WriteBuffer::start(sink.clone(), config(64, 4, Some(50)));

        for i in 0..10 {
            buffer.submit(i).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(sink.batches(), vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]);
        buffer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_remaining_batch_once() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = WriteBuffer::start(sink.clone(), config(16, 100, None));
        let sender = buffer.sender();

        for i in 1..=3 {
            sender.submit(i).unwrap();
        }
        settle().await;
        assert!(sink.batches().is_empty());

        let stats = buffer.shutdown().await;
        assert_eq!(sink.batches(), vec![vec![1, 2, 3]]);
        assert_eq!(stats.committed, 3);

        // The worker is gone; later submissions are refused
        assert_eq!(sender.submit(4), Err(SubmitError::Closed));
        assert_eq!(sink.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_queued_posts() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = WriteBuffer::start(sink.clone(), config(16, 100, None));

        buffer.submit(1).unwrap();
        settle().await;

        // Still in the intake when the shutdown signal is seen first
        buffer.submit(2).unwrap();
        buffer.submit(3).unwrap();

        let stats = buffer.shutdown().await;
        assert_eq!(sink.batches(), vec![vec![1]]);
        assert_eq!(stats.abandoned, 2);
        assert_eq!(stats.committed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn commit_failure_discards_batch_and_keeps_running() {
        let sink = Arc::new(RecordingSink::default());
        sink.fail.store(true, Ordering::SeqCst);
        let buffer = WriteBuffer::start(sink.clone(), config(16, 2, None));

        buffer.submit(1).unwrap();
        buffer.submit(2).unwrap();
        settle().await;

        sink.fail.store(false, Ordering::SeqCst);
        buffer.submit(3).unwrap();
        buffer.submit(4).unwrap();
        settle().await;

        // The failed batch is not retried
        assert_eq!(sink.batches(), vec![vec![1, 2], vec![3, 4]]);

        let stats = buffer.shutdown().await;
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.committed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn every_accepted_post_committed_exactly_once() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = WriteBuffer::start(sink.clone(), config(8, 5, Some(20)));

        let mut accepted = Vec::new();
        for i in 0..40 {
            if buffer.submit(i).is_ok() {
                accepted.push(i);
            }
            if i % 3 == 0 {
                tokio::time::sleep(Duration::from_millis(7)).await;
            }
        }
        settle().await;

        let stats = buffer.shutdown().await;
        let committed: Vec<u32> = sink.batches().into_iter().flatten().collect();
        assert_eq!(committed, accepted);
        assert_eq!(stats.committed as usize, accepted.len());
        assert!(sink.batches().iter().all(|b| !b.is_empty() && b.len() <= 5));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_every_sender_drains_worker() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = WriteBuffer::start(sink.clone(), config(16, 100, None));
        buffer.submit(9).unwrap();
        settle().await;

        let WriteBuffer { sender, worker, .. } = buffer;
        drop(sender);
        assert_eq!(worker.await.unwrap(), WorkerState::Stopped);

        assert_eq!(sink.batches(), vec![vec![9]]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_worker_ends_stopped() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = WriteBuffer::start(sink.clone(), config(16, 100, Some(50)));
        buffer.submit(1).unwrap();
        settle().await;

        let WriteBuffer { sender, shutdown, worker } = buffer;
        shutdown.cancel();
        assert_eq!(worker.await.unwrap(), WorkerState::Stopped);
        assert_eq!(sink.batches(), vec![vec![1]]);
        assert_eq!(sender.submit(2), Err(SubmitError::Closed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn committed_never_exceeds_accepted() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = WriteBuffer::start(sink.clone(), config(64, 1, None));
        let sender = buffer.sender();

        let watcher = tokio::spawn(async move {
            loop {
                let stats = sender.stats();
                assert!(stats.committed <= stats.accepted, "{:?}", stats);
                if stats.committed == 2000 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        });

        for i in 0..2000 {
            while buffer.submit(i).is_err() {
                tokio::task::yield_now().await;
            }
        }
        watcher.await.unwrap();

        let stats = buffer.shutdown().await;
        assert_eq!(stats.accepted, 2000);
        assert_eq!(stats.committed, 2000);
    }

    #[test]
    fn zero_interval_disables_timer() {
        let ingest = IngestConfig {
            intake_capacity: 10,
            max_batch_size: 5,
            flush_interval_ms: 0,
        };
        assert!(WriteBufferConfig::from(&ingest).flush_interval.is_none());
    }

    #[test]
    fn batch_drain_resets() {
        let mut batch = Batch::new(2);
        batch.push("a");
        assert!(!batch.is_full());
        batch.push("b");
        assert!(batch.is_full());
        assert_eq!(batch.drain_all(), vec!["a", "b"]);
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
    }
}
