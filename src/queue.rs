//! Bounded single-worker queue.
//!
//! Items are processed strictly in submission order by exactly one worker.
//! The next item starts only after the current one has finished, whether it
//! succeeded, failed, or panicked. A full queue makes [`WorkQueue::push`]
//! wait, which is how watcher bursts are throttled.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct WorkQueue<T> {
    tx: mpsc::Sender<T>,
    pending: Arc<AtomicUsize>,
    worker: JoinHandle<()>,
}

/// Cloneable submit side of a [`WorkQueue`].
pub struct QueueHandle<T> {
    tx: mpsc::Sender<T>,
    pending: Arc<AtomicUsize>,
}

impl<T> Clone for QueueHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            pending: self.pending.clone(),
        }
    }
}

impl<T: Send + 'static> QueueHandle<T> {
    pub async fn push(&self, item: T) -> Result<()> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(item).await.is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("work queue is closed");
        }
        Ok(())
    }

    /// Items queued or in flight.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Start the worker. `handler` is called once per item, never concurrently.
    pub fn spawn<F, Fut>(name: &'static str, capacity: usize, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<T>(capacity.max(1));
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = pending.clone();

        let worker = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                // Run each item on its own task so a panic does not kill the worker.
                if let Err(e) = tokio::spawn(handler(item)).await {
                    tracing::error!(queue = name, error = %e, "work item panicked");
                }
                worker_pending.fetch_sub(1, Ordering::SeqCst);
            }
            tracing::debug!(queue = name, "work queue drained");
        });

        Self {
            tx,
            pending,
            worker,
        }
    }

    pub fn handle(&self) -> QueueHandle<T> {
        QueueHandle {
            tx: self.tx.clone(),
            pending: self.pending.clone(),
        }
    }

    pub async fn push(&self, item: T) -> Result<()> {
        self.handle().push(item).await
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Stop accepting items and wait for everything queued to finish.
    ///
    /// Outstanding [`QueueHandle`]s keep the queue open until they are dropped.
    pub async fn finish(self) {
        drop(self.tx);
        if let Err(e) = self.worker.await {
            tracing::error!(error = %e, "work queue worker failed");
        }
    }
}
