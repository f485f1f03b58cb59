//! Asynchronous persistence pipeline
//!
//! A single bounded channel feeds a pool of workers. Each worker accumulates
//! a batch and bulk-writes it when the batch reaches the size threshold or
//! the flush interval elapses, whichever comes first. Store failures are
//! logged and counted but never requeued; durability is best-effort within
//! the flush window, and live fan-out is never gated on it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{ChatError, Result};
use crate::metrics::Metrics;
use crate::store::{MessageStore, NewMessage};

/// Shared ingress to the durable-write worker pool
pub struct PersistQueue {
    tx: Mutex<Option<mpsc::Sender<NewMessage>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PersistQueue {
    /// Spawn `workers` batching workers draining a queue of `capacity`.
    pub fn start(
        store: Arc<dyn MessageStore>,
        metrics: Arc<Metrics>,
        capacity: usize,
        workers: usize,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers)
            .map(|worker_id| {
                let store = Arc::clone(&store);
                let metrics = Arc::clone(&metrics);
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    run_worker(worker_id, store, metrics, rx, batch_size, flush_interval).await;
                })
            })
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    /// Enqueue a message, waiting at most `timeout`. A full queue past the
    /// deadline returns `Overloaded`; a shut-down queue returns `Unavailable`.
    pub async fn enqueue_timeout(&self, message: NewMessage, timeout: Duration) -> Result<()> {
        let tx = {
            let guard = self.tx.lock().await;
            guard
                .as_ref()
                .cloned()
                .ok_or_else(|| ChatError::unavailable("persistence queue is shut down"))?
        };

        match tokio::time::timeout(timeout, tx.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ChatError::unavailable("persistence queue is shut down")),
            Err(_) => Err(ChatError::overloaded("persistence queue is full")),
        }
    }

    /// Close the queue and wait for every worker to flush its in-flight
    /// batch. Call during graceful shutdown to avoid losing messages.
    pub async fn shutdown(&self) {
        self.tx.lock().await.take();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
        info!("persistence queue drained");
    }
}

/// Worker loop: batch by size or time, flush on queue close.
async fn run_worker(
    worker_id: usize,
    store: Arc<dyn MessageStore>,
    metrics: Arc<Metrics>,
    rx: Arc<Mutex<mpsc::Receiver<NewMessage>>>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut batch: Vec<NewMessage> = Vec::with_capacity(batch_size);

    loop {
        // Waiting is bounded by the flush interval so a quiet queue still
        // flushes partial batches on time. Receiving under a shared mutex
        // keeps the channel single-queue while letting every worker drain it.
        let received = tokio::time::timeout(flush_interval, async {
            rx.lock().await.recv().await
        })
        .await;

        match received {
            Ok(Some(message)) => {
                batch.push(message);
                if batch.len() >= batch_size {
                    flush(&*store, &metrics, &mut batch).await;
                }
            }
            Ok(None) => {
                // Queue closed: flush what we have and exit.
                flush(&*store, &metrics, &mut batch).await;
                debug!(worker_id, "persistence worker exiting");
                return;
            }
            Err(_) => {
                flush(&*store, &metrics, &mut batch).await;
            }
        }
    }
}

/// Bulk-write the batch. Errors are logged and counted; the batch is
/// discarded either way (at-most-once at the worker boundary).
async fn flush(store: &dyn MessageStore, metrics: &Metrics, batch: &mut Vec<NewMessage>) {
    if batch.is_empty() {
        return;
    }
    let count = batch.len();
    if let Err(e) = store.insert_many(std::mem::take(batch)).await {
        error!(count, error = %e, "bulk message insert failed");
        metrics.persist_failed(count as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryMessageStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn msg(id: &str) -> NewMessage {
        NewMessage {
            id: id.to_string(),
            room_id: "general".to_string(),
            user: "alice".to_string(),
            body: format!("body-{}", id),
            reply_to: None,
            encrypted: false,
            encrypted_keys: None,
            created_at: Utc::now(),
        }
    }

    fn queue(store: Arc<dyn MessageStore>, batch_size: usize) -> PersistQueue {
        PersistQueue::start(
            store,
            Arc::new(Metrics::new()),
            64,
            2,
            batch_size,
            Duration::from_millis(20),
        )
    }

    #[tokio::test]
    async fn test_flush_on_interval() {
        let store = Arc::new(MemoryMessageStore::new());
        let queue = queue(store.clone(), 50);

        queue
            .enqueue_timeout(msg("1"), Duration::from_secs(1))
            .await
            .unwrap();

        // Far below the batch size, so only the interval can flush it
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.recent("general", 10).await.unwrap().len(), 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_on_batch_size() {
        let store = Arc::new(MemoryMessageStore::new());
        let queue = PersistQueue::start(
            store.clone(),
            Arc::new(Metrics::new()),
            64,
            1,
            3,
            // Interval long enough that only the size threshold can flush
            Duration::from_secs(30),
        );

        for i in 0..3 {
            queue
                .enqueue_timeout(msg(&format!("{}", i)), Duration::from_secs(1))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.recent("general", 10).await.unwrap().len(), 3);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending() {
        let store = Arc::new(MemoryMessageStore::new());
        let queue = queue(store.clone(), 50);

        for i in 0..7 {
            queue
                .enqueue_timeout(msg(&format!("{}", i)), Duration::from_secs(1))
                .await
                .unwrap();
        }
        queue.shutdown().await;

        assert_eq!(store.recent("general", 10).await.unwrap().len(), 7);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_fails() {
        let store = Arc::new(MemoryMessageStore::new());
        let queue = queue(store.clone(), 50);
        queue.shutdown().await;

        assert!(matches!(
            queue.enqueue_timeout(msg("1"), Duration::from_millis(50)).await,
            Err(ChatError::Unavailable(_))
        ));
    }

    /// Store that always fails, for verifying the no-retry contract.
    struct FailingStore {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn insert_many(&self, batch: Vec<NewMessage>) -> crate::error::Result<usize> {
            self.attempts.fetch_add(batch.len(), Ordering::SeqCst);
            Err(ChatError::unavailable("store down"))
        }
        async fn insert_one(
            &self,
            _message: NewMessage,
        ) -> crate::error::Result<crate::store::StoredMessage> {
            Err(ChatError::unavailable("store down"))
        }
        async fn recent(
            &self,
            _room_id: &str,
            _limit: usize,
        ) -> crate::error::Result<Vec<crate::store::StoredMessage>> {
            Ok(Vec::new())
        }
        async fn get(
            &self,
            _message_id: &str,
        ) -> crate::error::Result<Option<crate::store::StoredMessage>> {
            Ok(None)
        }
        async fn edit(
            &self,
            _room_id: &str,
            _message_id: &str,
            _user: &str,
            _body: &str,
        ) -> crate::error::Result<crate::store::StoredMessage> {
            Err(ChatError::unavailable("store down"))
        }
        async fn delete(&self, _message_id: &str, _user: &str) -> crate::error::Result<()> {
            Err(ChatError::unavailable("store down"))
        }
    }

    #[tokio::test]
    async fn test_store_failure_not_retried() {
        let store = Arc::new(FailingStore {
            attempts: AtomicUsize::new(0),
        });
        let metrics = Arc::new(Metrics::new());
        let queue = PersistQueue::start(
            store.clone(),
            Arc::clone(&metrics),
            64,
            1,
            50,
            Duration::from_millis(20),
        );

        queue
            .enqueue_timeout(msg("1"), Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        queue.shutdown().await;

        // The message hit the store exactly once and the loss was counted
        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.persist_failures.load(Ordering::Relaxed), 1);
    }
}
