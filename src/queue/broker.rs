//! Named queue broker built on Tokio MPSC channels.
//!
//! Queues are identified by a string name and created lazily on first
//! reference, so pipeline stages and delivery workers only have to agree on
//! names, never on wiring order. Each queue is an unbounded FIFO: intake
//! volume for this system is human-scale and the durable backstop is the
//! ledger, not channel backpressure.
//!
//! # Shutdown and recovery
//!
//! On graceful shutdown [`QueueBroker::safe_close_all`] drains every known
//! queue and persists all of them to one snapshot document. The next start
//! calls [`QueueBroker::recover`], which re-enqueues every item onto its
//! original queue and then clears the document, so a crash after recovery
//! but before the next clean shutdown cannot replay the same snapshot
//! twice.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace};

use crate::errors::QueueError;
use crate::storage::document::{load_document, store_document};

/// Handle to one named FIFO queue. Cheap to clone; all clones share the
/// same underlying channel.
pub struct NamedQueue<T> {
    name: Arc<str>,
    sender: mpsc::UnboundedSender<T>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
}

impl<T> Clone for NamedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
        }
    }
}

impl<T: Send + 'static> NamedQueue<T> {
    fn new(name: &str) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            name: Arc::from(name),
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append an item. Fails only when every receiver handle has been
    /// dropped, which does not happen while the broker is alive.
    pub fn push(&self, item: T) -> Result<(), QueueError> {
        self.sender
            .send(item)
            .map_err(|_| QueueError::PushFailed {
                queue: self.name.to_string(),
                details: "channel closed".to_string(),
            })?;
        trace!(queue = %self.name, "Pushed item");
        Ok(())
    }

    /// Wait for the next item. Returns `None` only when the channel is
    /// closed and empty.
    pub async fn pull(&self) -> Option<T> {
        let mut receiver = self.receiver.lock().await;
        let item = receiver.recv().await;
        trace!(queue = %self.name, has_item = item.is_some(), "Pulled item");
        item
    }

    /// Non-blocking pop, used by drains.
    pub async fn try_pull(&self) -> Option<T> {
        self.receiver.lock().await.try_recv().ok()
    }

    /// Items currently buffered. A snapshot; may change immediately.
    pub async fn depth(&self) -> usize {
        self.receiver.lock().await.len()
    }
}

/// Registry of named queues plus the shutdown snapshot document.
pub struct QueueBroker<T> {
    queues: Mutex<HashMap<String, NamedQueue<T>>>,
    snapshot_path: PathBuf,
}

impl<T: Send + 'static> QueueBroker<T> {
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            snapshot_path: snapshot_path.into(),
        }
    }

    /// The single shared queue for `name`, created on first reference.
    pub async fn get_or_create(&self, name: &str) -> NamedQueue<T> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(queue = %name, "Created queue");
                NamedQueue::new(name)
            })
            .clone()
    }

    /// Pop everything currently in `name` into a list, oldest first.
    pub async fn drain(&self, name: &str) -> Vec<T> {
        let queue = {
            let queues = self.queues.lock().await;
            match queues.get(name) {
                Some(q) => q.clone(),
                None => return Vec::new(),
            }
        };

        let mut items = Vec::new();
        while let Some(item) = queue.try_pull().await {
            items.push(item);
        }
        items
    }
}

impl<T> QueueBroker<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// Drain every known queue and persist all of them to the snapshot
    /// document. Called once on graceful shutdown, after the consumers have
    /// stopped and folded any in-flight item back into its queue.
    pub async fn safe_close_all(&self) -> Result<(), QueueError> {
        let names: Vec<String> = {
            let queues = self.queues.lock().await;
            queues.keys().cloned().collect()
        };

        let mut snapshot: BTreeMap<String, Vec<T>> = BTreeMap::new();
        let mut total = 0usize;
        for name in names {
            let items = self.drain(&name).await;
            total += items.len();
            snapshot.insert(name, items);
        }

        store_document(&self.snapshot_path, &snapshot)
            .await
            .map_err(|source| QueueError::SnapshotFailed { source })?;
        info!(
            queues = snapshot.len(),
            items = total,
            path = %self.snapshot_path.display(),
            "Queue snapshot persisted"
        );
        Ok(())
    }

    /// Reload the snapshot document, re-enqueue every item onto its
    /// original queue, then clear the document. Returns how many items were
    /// re-enqueued. Runs before any consumer starts pulling.
    pub async fn recover(&self) -> Result<usize, QueueError> {
        let snapshot: BTreeMap<String, Vec<T>> = load_document(&self.snapshot_path)
            .await
            .map_err(|source| QueueError::SnapshotFailed { source })?;

        let mut total = 0usize;
        for (name, items) in snapshot {
            let queue = self.get_or_create(&name).await;
            for item in items {
                queue.push(item)?;
                total += 1;
            }
        }

        if total > 0 {
            // Clearing right away means a crash before the next clean
            // shutdown cannot replay the same snapshot again.
            store_document(&self.snapshot_path, &BTreeMap::<String, Vec<T>>::new())
                .await
                .map_err(|source| QueueError::SnapshotFailed { source })?;
            info!(items = total, "Queue snapshot recovered and cleared");
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn temp_snapshot_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("tldw_test_{}", Ulid::new()))
            .join("queues.json")
    }

    async fn cleanup(path: &PathBuf) {
        if let Some(dir) = path.parent() {
            let _ = tokio::fs::remove_dir_all(dir).await;
        }
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let path = temp_snapshot_path();
        let broker: QueueBroker<u32> = QueueBroker::new(&path);
        let queue = broker.get_or_create("intake").await;

        for i in 0..5 {
            queue.push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(queue.pull().await, Some(i));
        }

        cleanup(&path).await;
    }

    #[tokio::test]
    async fn same_name_returns_same_queue() {
        let path = temp_snapshot_path();
        let broker: QueueBroker<&'static str> = QueueBroker::new(&path);

        let producer = broker.get_or_create("replies").await;
        let consumer = broker.get_or_create("replies").await;

        producer.push("hello").unwrap();
        assert_eq!(consumer.pull().await, Some("hello"));

        cleanup(&path).await;
    }

    #[tokio::test]
    async fn drain_empties_queue_in_order() {
        let path = temp_snapshot_path();
        let broker: QueueBroker<u32> = QueueBroker::new(&path);
        let queue = broker.get_or_create("intake").await;
        for i in 0..3 {
            queue.push(i).unwrap();
        }

        assert_eq!(broker.drain("intake").await, vec![0, 1, 2]);
        assert_eq!(queue.depth().await, 0);
        assert!(broker.drain("never-created").await.is_empty());

        cleanup(&path).await;
    }

    #[tokio::test]
    async fn concurrent_producers_all_land() {
        let path = temp_snapshot_path();
        let broker: QueueBroker<u32> = QueueBroker::new(&path);
        let queue = broker.get_or_create("intake").await;

        let mut handles = Vec::new();
        for i in 0..10 {
            let q = queue.clone();
            handles.push(tokio::spawn(async move { q.push(i).unwrap() }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut seen = Vec::new();
        while let Some(item) = queue.try_pull().await {
            seen.push(item);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());

        cleanup(&path).await;
    }

    #[tokio::test]
    async fn snapshot_round_trip_redelivers_in_order() {
        let path = temp_snapshot_path();
        {
            let broker: QueueBroker<String> = QueueBroker::new(&path);
            let intake = broker.get_or_create("summarize").await;
            let replies = broker.get_or_create("public-reply").await;
            intake.push("t1".into()).unwrap();
            intake.push("t2".into()).unwrap();
            replies.push("r1".into()).unwrap();
            broker.safe_close_all().await.unwrap();
        }

        let broker: QueueBroker<String> = QueueBroker::new(&path);
        assert_eq!(broker.recover().await.unwrap(), 3);

        let intake = broker.get_or_create("summarize").await;
        assert_eq!(intake.pull().await.as_deref(), Some("t1"));
        assert_eq!(intake.pull().await.as_deref(), Some("t2"));
        let replies = broker.get_or_create("public-reply").await;
        assert_eq!(replies.pull().await.as_deref(), Some("r1"));

        // Document was cleared: a second recovery replays nothing.
        let again: QueueBroker<String> = QueueBroker::new(&path);
        assert_eq!(again.recover().await.unwrap(), 0);

        cleanup(&path).await;
    }

    #[tokio::test]
    async fn recover_without_snapshot_is_a_noop() {
        let path = temp_snapshot_path();
        let broker: QueueBroker<u32> = QueueBroker::new(&path);
        assert_eq!(broker.recover().await.unwrap(), 0);
        cleanup(&path).await;
    }

    #[tokio::test]
    async fn pull_waits_for_later_push() {
        let path = temp_snapshot_path();
        let broker: QueueBroker<u32> = QueueBroker::new(&path);
        let queue = broker.get_or_create("intake").await;

        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            producer.push(7).unwrap();
        });

        assert_eq!(queue.pull().await, Some(7));
        cleanup(&path).await;
    }
}
