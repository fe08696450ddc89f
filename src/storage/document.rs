//! Single-file JSON document persistence.
//!
//! The ledger, the result cache, and the queue snapshot each live in one
//! JSON document that is rewritten whole on mutation. Volume is low enough
//! that rewriting beats partial updates, and one file per concern keeps
//! recovery inspection trivial (`cat` + `jq`).

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

use crate::errors::StorageError;

/// Load a document, returning `T::default()` when the file does not exist
/// yet. A present-but-unreadable or corrupt file is an error: state files
/// are never silently reset.
pub async fn load_document<T>(path: &Path) -> Result<T, StorageError>
where
    T: DeserializeOwned + Default,
{
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str(&raw).map_err(|source| StorageError::Corrupt {
            path: path.display().to_string(),
            source,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(source) => Err(StorageError::ReadFailed {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Write a document, creating parent directories on first use. The new
/// content goes to a scratch file first and is renamed into place, so a
/// crash mid-write never leaves a torn document behind.
pub async fn store_document<T>(path: &Path, value: &T) -> Result<(), StorageError>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::WriteFailed {
                    path: parent.display().to_string(),
                    source,
                })?;
        }
    }

    let json = serde_json::to_string_pretty(value).map_err(|source| StorageError::EncodeFailed {
        data_type: std::any::type_name::<T>().to_string(),
        source,
    })?;

    let scratch = path.with_extension("tmp");
    tokio::fs::write(&scratch, json)
        .await
        .map_err(|source| StorageError::WriteFailed {
            path: scratch.display().to_string(),
            source,
        })?;
    tokio::fs::rename(&scratch, path)
        .await
        .map_err(|source| StorageError::WriteFailed {
            path: path.display().to_string(),
            source,
        })
}
