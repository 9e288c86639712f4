// =============================================================================
// Execution queue — bounded channel, fixed worker pool, keyed serialization
// =============================================================================
//
// Dispatcher and Executor each run their own `ExecutionQueue` (10 workers
// apiece). Jobs for the same `(account_id, symbol_root)` never run
// concurrently — a per-key `tokio::sync::Mutex` is acquired before a job
// runs and held for its duration, so a DCA-add can never race a flatten on
// the same account+symbol. Every job gets a 60s outer deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tracing::{error, warn};

use crate::errors::ExecutionError;

const TASK_DEADLINE: Duration = Duration::from_secs(60);

pub type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct QueueItem {
    account_id: i64,
    symbol_root: String,
    job: Job,
}

/// Registry of one `tokio::sync::Mutex<()>` per `(account_id, symbol_root)`
/// key, created on first use. Mirrors `RateLimiterRegistry`'s get-or-insert
/// shape.
struct KeyedMutexes {
    locks: SyncMutex<HashMap<(i64, String), Arc<AsyncMutex<()>>>>,
}

impl KeyedMutexes {
    fn new() -> Self {
        Self { locks: SyncMutex::new(HashMap::new()) }
    }

    fn for_key(&self, account_id: i64, symbol_root: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry((account_id, symbol_root.to_string()))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// A bounded job queue backed by a fixed pool of workers. `enqueue` fails
/// fast (see `try_enqueue`) rather than blocking past the webhook
/// dispatcher's latency budget.
pub struct ExecutionQueue {
    tx: mpsc::Sender<QueueItem>,
}

impl ExecutionQueue {
    pub fn start(capacity: usize, worker_count: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let keyed_mutexes = Arc::new(KeyedMutexes::new());
        let rx = Arc::new(AsyncMutex::new(rx));

        for worker_id in 0..worker_count {
            let rx = rx.clone();
            let keyed_mutexes = keyed_mutexes.clone();
            tokio::spawn(async move {
                run_worker(worker_id, rx, keyed_mutexes).await;
            });
        }

        Self { tx }
    }

    /// Enqueue `job`, waiting at most `budget` for a free queue slot. Used
    /// by the webhook dispatcher, which must respond within a tight latency
    /// window — 50ms budget, 503 if the queue stays full.
    pub async fn try_enqueue(
        &self,
        account_id: i64,
        symbol_root: &str,
        budget: Duration,
        job: Job,
    ) -> Result<(), ExecutionError> {
        let item = QueueItem { account_id, symbol_root: symbol_root.to_string(), job };
        match tokio::time::timeout(budget, self.tx.send(item)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ExecutionError::QueueFull),
            Err(_) => Err(ExecutionError::QueueFull),
        }
    }

    /// Fire-and-forget enqueue for internal callers (reconciliation, copy
    /// trade) that are not bound by the webhook latency budget.
    pub async fn enqueue(&self, account_id: i64, symbol_root: &str, job: Job) -> Result<(), ExecutionError> {
        let item = QueueItem { account_id, symbol_root: symbol_root.to_string(), job };
        self.tx.send(item).await.map_err(|_| ExecutionError::QueueFull)
    }
}

async fn run_worker(
    worker_id: usize,
    rx: Arc<AsyncMutex<mpsc::Receiver<QueueItem>>>,
    keyed_mutexes: Arc<KeyedMutexes>,
) {
    loop {
        let item = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(item) = item else {
            warn!(worker_id, "execution queue closed, worker exiting");
            return;
        };

        let key_lock = keyed_mutexes.for_key(item.account_id, &item.symbol_root);
        let _guard = key_lock.lock().await;

        let fut = (item.job)();
        if tokio::time::timeout(TASK_DEADLINE, fut).await.is_err() {
            error!(
                worker_id,
                account_id = item.account_id,
                symbol_root = %item.symbol_root,
                "execution task exceeded 60s deadline"
            );
        }
    }
}

/// Leaves enough permits free for unrelated concurrent non-execution work
/// (e.g. reconciliation reads) to never starve behind a saturated executor
/// pool. Not currently wired to a call site; kept as the throttle point a
/// future admission-control pass would hook into.
pub fn admission_semaphore(capacity: usize) -> Arc<Semaphore> {
    Arc::new(Semaphore::new(capacity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn jobs_run_and_complete() {
        let queue = ExecutionQueue::start(8, 2);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..5 {
            let counter = counter.clone();
            queue
                .enqueue(1, "GC", Box::new(move || Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn same_key_jobs_never_overlap() {
        let queue = ExecutionQueue::start(8, 4);
        let overlap_detected = Arc::new(AtomicU32::new(0));
        let in_flight = Arc::new(AtomicU32::new(0));

        for _ in 0..10 {
            let overlap_detected = overlap_detected.clone();
            let in_flight = in_flight.clone();
            queue
                .enqueue(1, "GC", Box::new(move || Box::pin(async move {
                    let n = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    if n > 1 {
                        overlap_detected.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                })))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(overlap_detected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn try_enqueue_returns_queue_full_when_budget_exhausted() {
        let queue = ExecutionQueue::start(1, 0);
        queue.enqueue(1, "GC", Box::new(|| Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }))).await.unwrap();

        let result = queue
            .try_enqueue(1, "GC", Duration::from_millis(20), Box::new(|| Box::pin(async move {})))
            .await;
        assert!(matches!(result, Err(ExecutionError::QueueFull)));
    }
}
