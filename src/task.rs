//! Task model shared by the dispatcher, pipeline engine, ledger, and
//! delivery workers.
//!
//! A [`Task`] is the unit of work flowing through the system. The full
//! snapshot is what gets persisted to the ledger and what travels through
//! the named queues, so everything here is serde-friendly and tolerant of
//! missing optional fields when older snapshots are reloaded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use ulid::Ulid;

/// Where a trigger came from. Drives precheck rules and outbound routing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A public mention/comment on the platform.
    Comment,
    /// A direct message conversation; supports synchronous status feedback.
    PrivateMessage,
    /// An external API caller.
    Api,
    /// A scheduled internal trigger (e.g. a watched creator posted).
    Scheduled,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Comment => "comment",
            SourceKind::PrivateMessage => "private_message",
            SourceKind::Api => "api",
            SourceKind::Scheduled => "scheduled",
        }
    }

    /// Whether the requester can receive short status messages while the
    /// task is still running (or after it failed).
    pub fn supports_sync_feedback(&self) -> bool {
        matches!(self, SourceKind::PrivateMessage)
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The task category a trigger was classified into. One pipeline engine
/// instance runs per kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainKind {
    Summarize,
    Answer,
}

impl ChainKind {
    /// Stable name used for intake queue names, ledger queries, and cache
    /// key composition.
    pub fn name(&self) -> &'static str {
        match self {
            ChainKind::Summarize => "summarize",
            ChainKind::Answer => "answer",
        }
    }

    pub fn all() -> [ChainKind; 2] {
        [ChainKind::Summarize, ChainKind::Answer]
    }
}

impl std::fmt::Display for ChainKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Pipeline progress. Transitions are monotonic except the single
/// `WaitingSend` ↔ `WaitingRetry` loop; `End` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preprocess,
    WaitingLlmResponse,
    WaitingSend,
    WaitingRetry,
    WaitingPushToCache,
    End,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Preprocess => "preprocess",
            Stage::WaitingLlmResponse => "waiting_llm_response",
            Stage::WaitingSend => "waiting_send",
            Stage::WaitingRetry => "waiting_retry",
            Stage::WaitingPushToCache => "waiting_push_to_cache",
            Stage::End => "end",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task reached `Stage::End`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Delivered a result (freshly generated or served from cache).
    Normal,
    /// Failed with a human-readable error detail.
    Error,
    /// The backend judged the content not worth processing.
    NotApplicable,
}

/// Comment threading references carried by comment triggers. Used by the
/// precheck to reject replies-to-replies, which cannot be answered in
/// context.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyRef {
    /// The top-level comment of the thread, if the trigger sits in one.
    pub root_id: Option<u64>,
    /// The comment being directly replied to.
    pub parent_id: Option<u64>,
}

impl ReplyRef {
    /// A trigger is a nested reply when it answers another comment rather
    /// than the thread root (or the content itself).
    pub fn is_nested(&self) -> bool {
        match (self.parent_id, self.root_id) {
            (Some(parent), Some(root)) => parent != root,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Pipeline-specific command parameters parsed by the dispatcher.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandParams {
    /// The question text for the answer pipeline.
    pub question: Option<String>,
}

/// Structured verdict produced by the summarize pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SummaryVerdict {
    pub summary: String,
    #[serde(default, deserialize_with = "flexible_int")]
    pub score: i32,
    #[serde(default)]
    pub thinking: String,
    /// Set by the model when the content has nothing worth summarizing.
    #[serde(default)]
    pub if_no_need_summary: bool,
}

/// Structured reply produced by the answer pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnswerReply {
    pub answer: String,
    #[serde(default, deserialize_with = "flexible_int")]
    pub score: i32,
}

/// The polymorphic task result: one variant per pipeline result schema,
/// plus a plain-text variant for raw backend output and status/error
/// messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskResult {
    Summary(SummaryVerdict),
    Answer(AnswerReply),
    Text { text: String },
}

impl TaskResult {
    pub fn text(text: impl Into<String>) -> Self {
        TaskResult::Text { text: text.into() }
    }

    /// The raw text form, when this result is still unparsed (or is a
    /// status/error message).
    pub fn as_text(&self) -> Option<&str> {
        match self {
            TaskResult::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Models emit scores as either a bare integer or a quoted string; accept
/// both when parsing their output.
fn flexible_int<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        Str(String),
    }

    match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(n) => i32::try_from(n)
            .map_err(|_| serde::de::Error::custom(format!("score out of range: {n}"))),
        IntOrString::Str(s) => s
            .trim()
            .parse::<i32>()
            .map_err(|_| serde::de::Error::custom(format!("not an integer score: {s}"))),
    }
}

/// The unit of work flowing through the system; the full snapshot is
/// persisted to the ledger and carried through the queues.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Opaque unique id, immutable once assigned.
    pub id: String,

    /// Where the trigger came from.
    pub source: SourceKind,

    /// The original trigger payload, kept verbatim for audit/debugging.
    #[serde(default)]
    pub raw_trigger: serde_json::Value,

    /// Platform id of the requester.
    pub sender_id: u64,

    /// Platform id of the content the task concerns.
    pub content_id: String,

    /// URL (or equivalent locator) of the content.
    pub locator: String,

    /// The literal command text the requester wrote.
    pub command: String,

    /// Pipeline-specific parameters the dispatcher parsed out of the
    /// command.
    #[serde(default)]
    pub params: CommandParams,

    /// Comment threading references, present for comment triggers.
    #[serde(default)]
    pub reply_ref: Option<ReplyRef>,

    /// Transcript text, cached on the task once fetched so a recovered
    /// task skips re-fetch.
    #[serde(default)]
    pub transcript: Option<String>,

    /// Pipeline result; starts as raw backend text, replaced by the parsed
    /// form on successful validation.
    #[serde(default)]
    pub result: Option<TaskResult>,

    /// Current pipeline stage.
    pub stage: Stage,

    /// The pipeline this task is assigned to.
    pub chain: ChainKind,

    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,

    /// Why the task ended, set once on the terminal stage.
    #[serde(default)]
    pub end_reason: Option<EndReason>,

    /// Whether the bounded reformat retry was taken before completion.
    #[serde(default)]
    pub retried: bool,

    /// Human-readable failure detail for error endings.
    #[serde(default)]
    pub error_detail: Option<String>,
}

impl Task {
    /// Create a fresh task at the initial stage with a new ulid.
    pub fn new(
        chain: ChainKind,
        source: SourceKind,
        sender_id: u64,
        content_id: impl Into<String>,
        locator: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            id: Ulid::new().to_string(),
            source,
            raw_trigger: serde_json::Value::Null,
            sender_id,
            content_id: content_id.into(),
            locator: locator.into(),
            command: command.into(),
            params: CommandParams::default(),
            reply_ref: None,
            transcript: None,
            result: None,
            stage: Stage::Preprocess,
            chain,
            created_at: Utc::now(),
            started_at: None,
            retry_started_at: None,
            ended_at: None,
            end_reason: None,
            retried: false,
            error_detail: None,
        }
    }

    pub fn with_params(mut self, params: CommandParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_raw_trigger(mut self, raw: serde_json::Value) -> Self {
        self.raw_trigger = raw;
        self
    }

    pub fn with_reply_ref(mut self, reply_ref: ReplyRef) -> Self {
        self.reply_ref = Some(reply_ref);
        self
    }

    pub fn is_ended(&self) -> bool {
        self.stage == Stage::End
    }

    /// Record that processing has begun. Only the first call sticks, so a
    /// task recovered mid-flight keeps its original start time.
    pub fn mark_started(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Move to the terminal stage. `ended_at` is set exactly once; a second
    /// call may change nothing.
    pub fn end(&mut self, reason: EndReason) {
        if self.ended_at.is_some() {
            return;
        }
        self.stage = Stage::End;
        self.end_reason = Some(reason);
        self.ended_at = Some(Utc::now());
    }

    /// Terminal failure with a human-readable detail.
    pub fn end_with_error(&mut self, detail: impl Into<String>) {
        if self.ended_at.is_some() {
            return;
        }
        self.error_detail = Some(detail.into());
        self.end(EndReason::Error);
    }
}
