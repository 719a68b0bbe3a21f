use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, trace};

/// Work executed by the workers of a [`WorkerPool`].
#[async_trait]
pub trait WorkHandler: Send + Sync + 'static {
    type Item: Send + 'static;

    async fn handle(&self, item: Self::Item);
}

/// Fixed number of workers draining one bounded request queue.
///
/// A full queue blocks the producer, which is the only backpressure the
/// schedulers need. Cancellation stops workers between items, never inside
/// one, so waiting on the tracker waits for in-flight items.
pub struct WorkerPool<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    workers: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawns `workers` consumers on `tracker`; all of them stop once `cancel` fires.
    pub fn start<H>(
        name: &'static str,
        workers: usize,
        capacity: usize,
        handler: Arc<H>,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> Self
    where
        H: WorkHandler<Item = T>,
    {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..workers {
            let rx = Arc::clone(&rx);
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            tracker.spawn(async move {
                loop {
                    let next = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => None,
                            item = rx.recv() => item,
                        }
                    };
                    let Some(item) = next else {
                        break;
                    };
                    handler.handle(item).await;
                }
                trace!(pool = name, worker, "Worker stopped");
            });
        }
        debug!(pool = name, workers, capacity, "Worker pool started");

        Self { name, tx, workers }
    }

    /// Queues `item`, waiting for room. Returns `false` once cancelled or closed.
    pub async fn submit(&self, item: T, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.workers
    }
}
