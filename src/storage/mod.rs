//! Persisted state: the task ledger, the result cache, and the shared
//! single-document JSON persistence they are built on. The queue snapshot
//! document lives with the broker in [`crate::queue`] but uses the same
//! document helpers.

pub mod cache;
pub mod document;
pub mod ledger;

pub use cache::{result_key, ResultCache};
pub use document::{load_document, store_document};
pub use ledger::TaskLedger;
