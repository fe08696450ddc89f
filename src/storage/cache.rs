//! Write-through result cache.
//!
//! Finished pipeline results keyed by (content id, pipeline name) so two
//! pipelines working on the same content never collide. Every `set` mirrors
//! the whole map to disk; there is no eviction, entries live until an
//! operator clears them. The cache is the idempotent short-circuit that
//! keeps repeated requests about the same content from paying for a second
//! backend call.

use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::StorageError;
use crate::storage::document::{load_document, store_document};
use crate::task::{ChainKind, TaskResult};

/// Compose the cache key the pipeline engine always uses.
pub fn result_key(content_id: &str, chain: ChainKind) -> String {
    format!("{}:{}", content_id, chain.name())
}

pub struct ResultCache {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, TaskResult>>,
}

impl ResultCache {
    /// Load the cache document. Corruption is fatal here for the same
    /// reason it is for the ledger: a silent reset would quietly re-bill
    /// every previously answered request.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let entries: BTreeMap<String, TaskResult> = load_document(&path).await?;
        if !entries.is_empty() {
            debug!(entries = entries.len(), path = %path.display(), "Result cache loaded");
        }
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub async fn get(&self, key: &str) -> Option<TaskResult> {
        self.entries.lock().await.get(key).cloned()
    }

    pub async fn set(&self, key: &str, result: &TaskResult) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), result.clone());
        store_document(&self.path, &*entries).await?;
        debug!(cache.key = %key, "Result cached");
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        if entries.remove(key).is_some() {
            store_document(&self.path, &*entries).await?;
        }
        Ok(())
    }

    /// Drop every entry and persist the empty map.
    pub async fn clear(&self) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        entries.clear();
        store_document(&self.path, &*entries).await
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
