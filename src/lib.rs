//! # tldw
//!
//! tldw is a "too long; didn't watch" service built in Rust that turns
//! commands left on long-form content (comments, private messages, or API
//! calls) into LLM-backed results: a summary of the content, or an answer
//! to a question about it. Every task moves through a persistent pipeline
//! so a crash resumes work instead of losing it.
//!
//! ## Architecture Overview
//!
//! The service is built around several core components:
//!
//! ### Pipelines
//! - **Pipelines** are state machines over a shared runner; the shipped
//!   ones are `summarize` and `answer`
//! - Each stage transition is snapshotted to a JSON task ledger, which is
//!   the source of truth for crash recovery
//! - Finished results land in a per-content result cache so repeat
//!   requests skip generation entirely
//!
//! ### Backends
//! - **LLM backends** generate summaries and answers behind a priority
//!   router with failover and an error threshold
//! - **Speech backends** transcribe content audio when the platform has no
//!   transcript, behind the same router type
//! - Fixture implementations of both ship in-tree and power the binary's
//!   default configuration as well as the tests
//!
//! ### Dispatch and Delivery
//! - The dispatcher matches trigger commands against keyword tables and
//!   enqueues tasks on the matching pipeline's intake queue
//! - Delivery workers drain per-source outbound queues and hand rendered
//!   results to a delivery sink
//!
//! ## Configuration
//!
//! The service is configured via environment variables. Key variables
//! include:
//! - `TLDW_STATE_DIR`: directory for the ledger, cache, and queue snapshots
//! - `TLDW_LLM_BACKENDS` / `TLDW_SPEECH_BACKENDS`: backend priority tables
//! - `TLDW_SUMMARIZE_KEYWORDS` / `TLDW_ANSWER_KEYWORDS`: command keywords
//! - `TLDW_TOKEN_CEILING`: optional hard cap on cumulative LLM tokens
//!
//! ## Error Handling
//!
//! All error strings use the format: `error-tldw-<domain>-<number> <message>: <details>`
//!
//! ## Examples
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tldw::chain::{ChainRunner, SummarizeChain};
//! use tldw::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load configuration from environment
//!     let config = Config::new()?;
//!
//!     // Set up storage, queues, and backend routers
//!     // ... setup code ...
//!
//!     // Create and start a pipeline runner
//!     let runner = ChainRunner::new(Arc::new(SummarizeChain::new()), deps);
//!     runner.run(shutdown_token).await?;
//!
//!     Ok(())
//! }
//! ```

/// Pipeline state machines and the shared runner that drives them.
///
/// Contains the per-pipeline specifications (summarize, answer), the
/// runner that walks tasks through their stages, and the shared
/// dependency bundle.
pub mod chain;

/// Configuration management for the tldw service.
///
/// Configuration structures and loading logic for storage paths, backend
/// tables, keyword tables, and metrics. Loaded from environment
/// variables, with workable defaults for every value.
pub mod config;

/// Content metadata lookup for the platform hosting the content.
///
/// Defines the metadata provider trait plus the directory-backed fixture
/// implementation used by the binary and the tests.
pub mod content;

/// Outbound result rendering and delivery workers.
///
/// Renders finished task snapshots into deliverable messages and drains
/// the per-source outbound queues into a delivery sink.
pub mod delivery;

/// Trigger intake and keyword dispatch.
///
/// Classifies incoming trigger commands against the configured keyword
/// tables and enqueues tasks on the matching pipeline queue.
pub mod dispatch;

/// Error types for all service components.
///
/// Every variant renders with a stable `error-tldw-<domain>-<number>`
/// prefix so log lines can be grepped by error identity.
pub mod errors;

/// LLM backend abstraction, prompt templates, and reply plumbing.
pub mod llm;

/// Metrics collection and monitoring for service observability.
///
/// Provides instrumentation for tracking task throughput, cache
/// effectiveness, and backend health.
pub mod metrics;

/// Named in-memory queues with persistent shutdown snapshots.
pub mod queue;

/// Priority routing across registered backends.
///
/// Shared by the LLM and speech backend pools: highest priority wins,
/// repeated failures disable an entry, selection falls through to the
/// next candidate.
pub mod router;

/// Speech-to-text backend abstraction and fixtures.
pub mod speech;

/// Storage layer for durable pipeline state.
///
/// The task ledger (per-task stage snapshots) and the result cache, both
/// JSON files rewritten atomically on change.
pub mod storage;

/// Supervised background task management.
///
/// Spawn helpers that restart crashed workers with a backoff and tie
/// fatal failures to the process-wide shutdown token.
pub mod supervisor;

/// The task model: commands, stages, results, and endings.
pub mod task;

/// Bounded admission for CPU-heavy blocking work.
pub mod worker;

pub mod test_helpers;
