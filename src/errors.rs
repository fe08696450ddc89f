use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error-tldw-config-1 Invalid backend entry in {var_name}: {entry}: {details}")]
    InvalidBackendEntry {
        var_name: String,
        entry: String,
        details: String,
    },

    #[error("error-tldw-config-2 No usable backend entries in {var_name}: {raw:?}")]
    EmptyBackendTable { var_name: String, raw: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("error-tldw-storage-1 State file read failed: {path}: {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("error-tldw-storage-2 State file write failed: {path}: {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("error-tldw-storage-3 State file corrupt: {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("error-tldw-storage-4 Snapshot encoding failed: {data_type}: {source}")]
    EncodeFailed {
        data_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("error-tldw-storage-5 Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("error-tldw-storage-6 Field merge produced an invalid snapshot for {task_id}: {source}")]
    InvalidPatch {
        task_id: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("error-tldw-queue-1 Queue push failed: {queue}: {details}")]
    PushFailed { queue: String, details: String },

    #[error("error-tldw-queue-2 Queue snapshot persistence failed: {source}")]
    SnapshotFailed {
        #[source]
        source: StorageError,
    },

    #[error("error-tldw-queue-3 Queue item decode failed: {queue}: {source}")]
    ItemDecodeFailed {
        queue: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("error-tldw-router-1 Backend settings missing for alias: {alias}")]
    MissingSettings { alias: String },

    #[error("error-tldw-router-2 Backend alias already registered: {alias}")]
    DuplicateAlias { alias: String },
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("error-tldw-chain-1 State persistence failed: {source}")]
    Persistence {
        #[from]
        source: StorageError,
    },

    #[error("error-tldw-chain-2 Queue hand-off failed: {source}")]
    Enqueue {
        #[from]
        source: QueueError,
    },
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("error-tldw-dispatch-1 Intake enqueue failed for chain {chain}: {source}")]
    EnqueueFailed {
        chain: String,
        #[source]
        source: QueueError,
    },
}
