//! Bounded worker pool
//!
//! A fixed set of persistent workers drains a shared bounded queue and runs a
//! pool-wide async callback for every item. `schedule` suspends the producer
//! while the queue is full, which is the pool's admission control.
//!
//! ```text
//!   schedule(item) ──▶ ┌──────────────────────────┐ ──▶ worker 0 ─┐
//!   schedule(item) ──▶ │ bounded queue (3 × N)     │ ──▶ worker 1 ─┼─▶ callback(item)
//!   schedule(item) ──▶ └──────────────────────────┘ ──▶ worker N ─┘
//! ```
//!
//! Items are not processed in submission order across workers. Callback
//! errors are logged and counted, never retried.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};

/// Queue slots per worker
pub const QUEUE_SLOTS_PER_WORKER: usize = 3;

/// Callback invoked by a worker for every scheduled item
pub type CallbackFunc<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Default)]
struct WorkerPoolStats {
    processed: AtomicU64,
    failed: AtomicU64,
}

/// A group of workers executing a callback over a bounded queue
pub struct WorkerPool<T> {
    /// Number of workers started by `start`
    worker_count: usize,

    /// Per-item callback
    callback: CallbackFunc<T>,

    /// Producer side, dropped by `stop`
    work_tx: Mutex<Option<mpsc::Sender<T>>>,

    /// Consumer side shared by the workers
    work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>,

    /// Running workers
    workers: Mutex<Vec<JoinHandle<()>>>,

    state: Mutex<PoolState>,

    stats: Arc<WorkerPoolStats>,
}

impl<T> std::fmt::Debug for WorkerPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker_count", &self.worker_count)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Create a pool of `worker_count` workers running `callback`.
    ///
    /// # Errors
    ///
    /// `Error::InvalidWorkerConfig` if `worker_count` is 0.
    pub fn new<F, Fut>(worker_count: usize, callback: F) -> Result<Self>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let callback: CallbackFunc<T> = Arc::new(move |item| callback(item).boxed());
        Self::try_new(worker_count, Some(callback))
    }

    /// Create a pool from an already boxed, possibly missing callback.
    ///
    /// # Errors
    ///
    /// `Error::InvalidWorkerConfig` if `worker_count` is 0 or `callback` is `None`.
    pub fn try_new(worker_count: usize, callback: Option<CallbackFunc<T>>) -> Result<Self> {
        if worker_count == 0 {
            return Err(Error::InvalidWorkerConfig("worker count must be greater than 0".into()));
        }
        let callback = callback
            .ok_or_else(|| Error::InvalidWorkerConfig("callback not set".into()))?;

        let (tx, rx) = mpsc::channel(worker_count * QUEUE_SLOTS_PER_WORKER);

        Ok(Self {
            worker_count,
            callback,
            work_tx: Mutex::new(Some(tx)),
            work_rx: Arc::new(tokio::sync::Mutex::new(rx)),
            workers: Mutex::new(Vec::with_capacity(worker_count)),
            state: Mutex::new(PoolState::Idle),
            stats: Arc::new(WorkerPoolStats::default()),
        })
    }

    /// Launch the workers. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                PoolState::Idle => *state = PoolState::Running,
                PoolState::Running => return Err(Error::WorkerPoolState("already running")),
                PoolState::Stopped => return Err(Error::WorkerPoolState("stopped")),
            }
        }
        self.spawn_workers();
        Ok(())
    }

    fn spawn_workers(&self) {
        let mut workers = self.workers.lock();
        for worker_id in 0..self.worker_count {
            let rx = Arc::clone(&self.work_rx);
            let callback = Arc::clone(&self.callback);
            let stats = Arc::clone(&self.stats);
            workers.push(tokio::spawn(process(worker_id, rx, callback, stats)));
        }
        debug!(workers = self.worker_count, "Worker pool started");
    }

    /// Queue one item, waiting while the queue is full.
    pub async fn schedule(&self, item: T) -> Result<()> {
        let tx = self
            .work_tx
            .lock()
            .clone()
            .ok_or(Error::WorkerPoolState("stopped"))?;

        tx.send(item)
            .await
            .map_err(|_| Error::WorkerPoolState("stopped"))
    }

    /// Queue one item without waiting. The item is handed back if the queue
    /// is full or the pool is stopped.
    pub fn try_schedule(&self, item: T) -> std::result::Result<(), T> {
        let guard = self.work_tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.try_send(item).map_err(|e| match e {
                mpsc::error::TrySendError::Full(item) => item,
                mpsc::error::TrySendError::Closed(item) => item,
            }),
            None => Err(item),
        }
    }

    /// Close the queue and wait for every queued and in-flight item.
    ///
    /// Items queued before `start` are still processed: a pool that was never
    /// started is started here to drain them.
    pub async fn stop(&self) -> Result<()> {
        let was_idle = {
            let mut state = self.state.lock();
            let previous = *state;
            *state = PoolState::Stopped;
            previous == PoolState::Idle
        };
        if was_idle {
            self.spawn_workers();
        }

        // Workers exit once every sender clone is gone and the queue is empty.
        drop(self.work_tx.lock().take());

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker terminated abnormally: {}", e);
            }
        }

        debug!(
            processed = self.processed_items(),
            failed = self.failed_items(),
            "Worker pool stopped"
        );
        Ok(())
    }
}

impl<T> WorkerPool<T> {
    /// Number of workers in this pool.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Capacity of the work queue.
    pub fn queue_capacity(&self) -> usize {
        self.worker_count * QUEUE_SLOTS_PER_WORKER
    }

    /// Callbacks that completed, successfully or not.
    pub fn processed_items(&self) -> u64 {
        self.stats.processed.load(Ordering::Relaxed)
    }

    /// Callbacks that returned an error.
    pub fn failed_items(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock() == PoolState::Running
    }
}

async fn process<T>(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>,
    callback: CallbackFunc<T>,
    stats: Arc<WorkerPoolStats>,
) {
    loop {
        let item = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };

        let Some(item) = item else {
            break;
        };

        let result = callback(item).await;
        stats.processed.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = result {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!(worker = worker_id, "Worker callback failed: {}", e);
        }
    }
}
