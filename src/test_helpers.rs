//! Shared fixtures for unit and integration tests.
//!
//! Everything here builds on the fixture backends, so a full dependency
//! bundle needs nothing but a scratch directory. State directories come
//! from [`temp_state_dir`] and are throwaway; tests remove them with
//! [`cleanup`] on the way out.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use ulid::Ulid;

use crate::chain::{ChainDeps, TokenUsage};
use crate::content::{ContentMetadata, FixtureMetadataProvider};
use crate::delivery::{DeliverySink, Outbound};
use crate::llm::LlmBackend;
use crate::metrics::NoOpMetricsPublisher;
use crate::queue::QueueBroker;
use crate::router::{BackendRouter, BackendSettings, RouterBackend};
use crate::speech::SpeechBackend;
use crate::storage::{ResultCache, TaskLedger};
use crate::task::{ChainKind, SourceKind, Task};
use crate::worker::BlockingPool;

/// Serializes tests that mutate process environment variables.
pub static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// A fresh scratch directory path under the system temp dir. Not created;
/// the state files create their parents on first write.
pub fn temp_state_dir() -> PathBuf {
    std::env::temp_dir().join(format!("tldw_test_{}", Ulid::new()))
}

/// Best-effort removal of a scratch directory.
pub async fn cleanup(dir: &Path) {
    let _ = tokio::fs::remove_dir_all(dir).await;
}

pub fn blocking_pool() -> Arc<BlockingPool> {
    Arc::new(BlockingPool::new(2))
}

/// Metadata with everything filled in, including a provider transcript.
pub fn sample_metadata(content_id: &str) -> ContentMetadata {
    ContentMetadata {
        id: content_id.to_string(),
        title: "Ducks of the north".to_string(),
        description: "A field recording of northern ducks.".to_string(),
        tags: vec!["ducks".to_string(), "nature".to_string()],
        comments: vec![
            "lovely birds".to_string(),
            "more ducks please".to_string(),
        ],
        parts: 1,
        transcript: Some("quack quack quack".to_string()),
        audio_url: Some(format!("https://media.example.com/{content_id}.m4a")),
    }
}

/// Same metadata minus the provider transcript, forcing transcription.
pub fn metadata_without_transcript(content_id: &str) -> ContentMetadata {
    ContentMetadata {
        transcript: None,
        ..sample_metadata(content_id)
    }
}

/// A summarizer verdict in the strict reply shape.
pub fn summary_reply(summary: &str) -> String {
    format!(
        r#"{{"summary": "{summary}", "score": "88", "thinking": "", "if_no_need_summary": false}}"#
    )
}

/// An answer verdict in the strict reply shape.
pub fn answer_reply(answer: &str) -> String {
    format!(r#"{{"answer": "{answer}", "score": "77"}}"#)
}

pub fn comment_task(chain: ChainKind, content_id: &str, command: &str) -> Task {
    Task::new(
        chain,
        SourceKind::Comment,
        42,
        content_id,
        format!("https://example.com/v/{content_id}"),
        command,
    )
}

pub fn private_task(chain: ChainKind, content_id: &str, command: &str) -> Task {
    Task::new(
        chain,
        SourceKind::PrivateMessage,
        42,
        content_id,
        format!("https://example.com/v/{content_id}"),
        command,
    )
}

/// A dependency bundle with no token ceiling and no transcript touch-up.
pub async fn fixture_deps(
    state_dir: &Path,
    metadata: Vec<ContentMetadata>,
    llm: Vec<Arc<dyn LlmBackend>>,
    speech: Vec<Arc<dyn SpeechBackend>>,
) -> anyhow::Result<Arc<ChainDeps>> {
    fixture_deps_with(state_dir, metadata, llm, speech, None, false).await
}

/// A full dependency bundle over fixture backends. Backends keep the order
/// given: the first entry gets the highest router priority.
pub async fn fixture_deps_with(
    state_dir: &Path,
    metadata: Vec<ContentMetadata>,
    llm: Vec<Arc<dyn LlmBackend>>,
    speech: Vec<Arc<dyn SpeechBackend>>,
    token_ceiling: Option<u64>,
    touch_up_transcripts: bool,
) -> anyhow::Result<Arc<ChainDeps>> {
    let ledger = Arc::new(TaskLedger::load(state_dir.join("ledger.json")).await?);
    let cache = Arc::new(ResultCache::load(state_dir.join("cache.json")).await?);
    let broker = Arc::new(QueueBroker::new(state_dir.join("queues.json")));

    let llm_router = Arc::new(BackendRouter::new(priority_table(&llm)));
    for backend in llm {
        llm_router.register(backend).await?;
    }
    let speech_router = Arc::new(BackendRouter::new(priority_table(&speech)));
    for backend in speech {
        speech_router.register(backend).await?;
    }

    Ok(Arc::new(ChainDeps {
        ledger,
        cache,
        broker,
        metadata: Arc::new(FixtureMetadataProvider::with_items(metadata)),
        llm: llm_router,
        speech: speech_router,
        metrics: Arc::new(NoOpMetricsPublisher::new()),
        tokens: Arc::new(TokenUsage::new(token_ceiling)),
        touch_up_transcripts,
    }))
}

fn priority_table<B: RouterBackend + ?Sized>(
    backends: &[Arc<B>],
) -> HashMap<String, BackendSettings> {
    backends
        .iter()
        .enumerate()
        .map(|(position, backend)| {
            (
                backend.alias().to_string(),
                BackendSettings {
                    priority: 100 - 10 * position as i32,
                    enabled: true,
                },
            )
        })
        .collect()
}

/// Captures delivered snapshots for assertions.
#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<Outbound>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outputs(&self) -> Vec<Outbound> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl DeliverySink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, outbound: &Outbound) -> anyhow::Result<()> {
        self.delivered.lock().push(outbound.clone());
        Ok(())
    }
}
