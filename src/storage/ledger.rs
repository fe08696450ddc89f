//! Durable task ledger: every task's full snapshot, keyed by id.
//!
//! The ledger is the source of truth for crash recovery. Entries are never
//! deleted; finished tasks stay around for statistics and audit. Every
//! mutation rewrites the backing document. A corrupt ledger file at load
//! time is fatal; operators get the broken file intact instead of a silent
//! reset.

use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::StorageError;
use crate::storage::document::{load_document, store_document};
use crate::task::{ChainKind, Stage, Task};

pub struct TaskLedger {
    path: PathBuf,
    tasks: Mutex<BTreeMap<String, Task>>,
}

impl TaskLedger {
    /// Load the ledger from `path`, starting empty when the file does not
    /// exist yet. Corruption is propagated, never papered over.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let tasks: BTreeMap<String, Task> = load_document(&path).await?;
        if !tasks.is_empty() {
            debug!(entries = tasks.len(), path = %path.display(), "Task ledger loaded");
        }
        Ok(Self {
            path,
            tasks: Mutex::new(tasks),
        })
    }

    /// Persist a full snapshot for a task. Re-creating an existing id
    /// replaces the stored snapshot, which is what restart races enqueue.
    pub async fn create(&self, task: &Task) -> Result<(), StorageError> {
        let mut tasks = self.tasks.lock().await;
        let existed = tasks.insert(task.id.clone(), task.clone()).is_some();
        self.persist(&tasks).await?;
        debug!(task.id = %task.id, chain = %task.chain, existed, "Ledger entry written");
        Ok(())
    }

    /// Replace the whole stored snapshot in one call.
    pub async fn replace(&self, task: &Task) -> Result<(), StorageError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.insert(task.id.clone(), task.clone()).is_none() {
            warn!(task.id = %task.id, "Ledger replace for an id that was never created");
        }
        self.persist(&tasks).await
    }

    /// Merge named fields into the stored snapshot. Unknown field names are
    /// logged and skipped (older snapshots and newer writers have to
    /// coexist across restarts), but a value that breaks the snapshot shape
    /// is an error.
    pub async fn update(
        &self,
        id: &str,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StorageError> {
        let mut tasks = self.tasks.lock().await;
        let current = tasks.get(id).ok_or_else(|| StorageError::TaskNotFound {
            task_id: id.to_string(),
        })?;

        // Serialize the live snapshot so field names are checked against the
        // real persisted shape, not a hand-maintained list.
        let value =
            serde_json::to_value(current).map_err(|source| StorageError::EncodeFailed {
                data_type: "Task".to_string(),
                source,
            })?;
        let serde_json::Value::Object(mut snapshot) = value else {
            return Err(StorageError::EncodeFailed {
                data_type: "Task".to_string(),
                source: <serde_json::Error as serde::ser::Error>::custom(
                    "task snapshot is not a JSON object",
                ),
            });
        };

        for (name, value) in fields {
            if snapshot.contains_key(&name) {
                snapshot.insert(name, value);
            } else {
                warn!(task.id = %id, field = %name, "Ignoring unknown ledger field");
            }
        }

        let merged: Task = serde_json::from_value(serde_json::Value::Object(snapshot)).map_err(
            |source| StorageError::InvalidPatch {
                task_id: id.to_string(),
                source,
            },
        )?;
        tasks.insert(id.to_string(), merged);
        self.persist(&tasks).await
    }

    /// Typed fast path for the most frequent mutation.
    pub async fn set_stage(&self, id: &str, stage: Stage) -> Result<(), StorageError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks.get_mut(id).ok_or_else(|| StorageError::TaskNotFound {
            task_id: id.to_string(),
        })?;
        task.stage = stage;
        debug!(task.id = %id, stage = %stage, "Ledger stage updated");
        self.persist(&tasks).await
    }

    /// Latest snapshot for a task id.
    pub async fn get(&self, id: &str) -> Result<Task, StorageError> {
        let tasks = self.tasks.lock().await;
        tasks
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::TaskNotFound {
                task_id: id.to_string(),
            })
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.tasks.lock().await.contains_key(id)
    }

    /// All entries for a pipeline, optionally narrowed to one stage.
    /// Ordered by id, which for ulid ids follows creation order.
    pub async fn query(&self, chain: ChainKind, stage: Option<Stage>) -> Vec<Task> {
        let tasks = self.tasks.lock().await;
        tasks
            .values()
            .filter(|t| t.chain == chain && stage.map_or(true, |s| t.stage == s))
            .cloned()
            .collect()
    }

    /// Entries for a pipeline that have not reached the terminal stage:
    /// the startup recovery scan.
    pub async fn pending_for(&self, chain: ChainKind) -> Vec<Task> {
        let tasks = self.tasks.lock().await;
        tasks
            .values()
            .filter(|t| t.chain == chain && t.stage != Stage::End)
            .cloned()
            .collect()
    }

    async fn persist(&self, tasks: &BTreeMap<String, Task>) -> Result<(), StorageError> {
        store_document(&self.path, tasks).await
    }
}
