//! The pipeline engine: one state-machine runner per task category.
//!
//! [`runner::ChainRunner`] is the engine shared by every pipeline. The
//! per-pipeline pieces (precheck, prompt construction, output validation,
//! and the one-shot reformat prompt) hang off [`ChainSpec`]; the two
//! shipped specs are [`SummarizeChain`] and [`AnswerChain`].

pub mod answer;
pub mod runner;
pub mod summarize;

pub use answer::AnswerChain;
pub use runner::ChainRunner;
pub use summarize::SummarizeChain;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::content::{ContentMetadata, MetadataProvider};
use crate::llm::{ChatPrompt, LlmBackend};
use crate::metrics::SharedMetricsPublisher;
use crate::queue::QueueBroker;
use crate::router::BackendRouter;
use crate::speech::SpeechBackend;
use crate::storage::{ResultCache, TaskLedger};
use crate::task::{ChainKind, SourceKind, Task, TaskResult};

pub const PUBLIC_REPLY_QUEUE: &str = "public-reply";
pub const PRIVATE_MESSAGE_QUEUE: &str = "private-message";
pub const API_RESPONSE_QUEUE: &str = "api-response";

/// The outbound queue a finished (or status-bearing) snapshot is routed
/// to, by trigger source.
pub fn outbound_queue_for(source: SourceKind) -> &'static str {
    match source {
        SourceKind::PrivateMessage => PRIVATE_MESSAGE_QUEUE,
        SourceKind::Api => API_RESPONSE_QUEUE,
        SourceKind::Comment | SourceKind::Scheduled => PUBLIC_REPLY_QUEUE,
    }
}

/// What a pipeline made of a raw backend reply.
#[derive(Clone, Debug, PartialEq)]
pub enum ParsedReply {
    /// A well-formed result, ready for delivery and caching.
    Result(TaskResult),
    /// The backend judged the content not worth processing. `notice` is
    /// the short explanation for requesters that can receive one.
    NotApplicable { notice: String },
}

/// Per-pipeline behavior plugged into the shared runner.
pub trait ChainSpec: Send + Sync {
    fn kind(&self) -> ChainKind;

    /// Reject a task before any work happens. The returned message ends
    /// the task with an error and is forwarded to requesters that support
    /// synchronous feedback.
    fn precheck(&self, task: &Task) -> Option<String>;

    /// Build the generation prompt from the task and its fetched context.
    fn build_prompt(&self, task: &Task, meta: &ContentMetadata, transcript: &str) -> ChatPrompt;

    /// Validate a raw backend reply.
    fn parse(&self, raw: &str) -> Result<ParsedReply, serde_json::Error>;

    /// The one-shot re-prompt asking the backend to reformat its own prior
    /// output.
    fn retry_prompt(&self, raw: &str) -> ChatPrompt;
}

/// Rejection shared by every pipeline: a reply inside a comment thread has
/// no content of its own to work on.
pub(crate) fn nested_reply_rejection(task: &Task) -> Option<String> {
    match &task.reply_ref {
        Some(reply_ref) if reply_ref.is_nested() => Some(
            "Replying inside a comment thread is not supported; mention me on the content itself."
                .to_string(),
        ),
        _ => None,
    }
}

/// Cumulative LLM token usage with an optional hard ceiling.
pub struct TokenUsage {
    used: AtomicU64,
    ceiling: Option<u64>,
}

impl TokenUsage {
    pub fn new(ceiling: Option<u64>) -> Self {
        Self {
            used: AtomicU64::new(0),
            ceiling,
        }
    }

    /// Add a completion's token count, returning the new total.
    pub fn record(&self, tokens: u64) -> u64 {
        self.used.fetch_add(tokens, Ordering::Relaxed) + tokens
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn ceiling(&self) -> Option<u64> {
        self.ceiling
    }

    /// Whether the configured ceiling has been reached.
    pub fn exhausted(&self) -> bool {
        match self.ceiling {
            Some(ceiling) => self.used() >= ceiling,
            None => false,
        }
    }
}

/// Everything a pipeline runner needs, shared across pipelines.
pub struct ChainDeps {
    pub ledger: Arc<TaskLedger>,
    pub cache: Arc<ResultCache>,
    pub broker: Arc<QueueBroker<Task>>,
    pub metadata: Arc<dyn MetadataProvider>,
    pub llm: Arc<BackendRouter<dyn LlmBackend>>,
    pub speech: Arc<BackendRouter<dyn SpeechBackend>>,
    pub metrics: SharedMetricsPublisher,
    pub tokens: Arc<TokenUsage>,
    /// Run machine transcription through an LLM cleanup pass before use.
    pub touch_up_transcripts: bool,
}
