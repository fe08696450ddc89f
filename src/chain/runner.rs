//! The stage-walking engine every pipeline runs on.
//!
//! One runner per pipeline pulls tasks from its intake queue and advances
//! each through the persisted stages: precheck and context acquisition,
//! the generation call, parse/validate with one bounded reformat retry,
//! then delivery, cache write, and the terminal ledger record. The ledger
//! snapshot is written at every stage move, so a task interrupted by a
//! crash resumes from its last persisted stage rather than from scratch.
//!
//! Task-level faults (bad content, backend failures, malformed output) end
//! the task with a readable detail and never escape the loop; only
//! persistence and queue faults propagate, which hands control to the
//! supervisor for a backoff restart.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::chain::{outbound_queue_for, ChainDeps, ChainSpec, ParsedReply};
use crate::content::ContentMetadata;
use crate::errors::ChainError;
use crate::llm::{templates, ChatPrompt};
use crate::storage::result_key;
use crate::task::{ChainKind, EndReason, SourceKind, Stage, Task, TaskResult};

/// Sent to sources that support synchronous feedback as soon as their task
/// is picked up.
const PROCESSING_STARTED_NOTICE: &str =
    "Request received; working on it. This can take a little while.";

const NO_LLM_DETAIL: &str = "No usable generation backend is available.";

enum TranscriptOutcome {
    Ready(String),
    Unavailable(String),
}

enum RetryVerdict {
    Parsed(ParsedReply),
    Failed(String),
}

pub struct ChainRunner {
    spec: Arc<dyn ChainSpec>,
    deps: Arc<ChainDeps>,
}

impl ChainRunner {
    pub fn new(spec: Arc<dyn ChainSpec>, deps: Arc<ChainDeps>) -> Self {
        Self { spec, deps }
    }

    pub fn kind(&self) -> ChainKind {
        self.spec.kind()
    }

    /// Requeue this pipeline's unfinished ledger entries, then serve the
    /// intake queue until the stop signal fires. An item pulled right as
    /// the signal fires is folded back into the queue so the shutdown
    /// snapshot keeps it.
    #[instrument(skip_all, fields(chain = %self.spec.kind()))]
    pub async fn run(&self, token: CancellationToken) -> Result<(), ChainError> {
        self.requeue_pending().await?;

        let intake = self.deps.broker.get_or_create(self.spec.kind().name()).await;
        loop {
            let queued = tokio::select! {
                () = token.cancelled() => break,
                item = intake.pull() => match item {
                    Some(task) => task,
                    None => break,
                },
            };
            if token.is_cancelled() {
                intake.push(queued)?;
                break;
            }
            self.deps
                .metrics
                .incr_with_tags("task.received", &[self.chain_tag()])
                .await;
            self.process(queued, &token).await?;
        }
        Ok(())
    }

    /// Startup recovery scan: every ledger entry for this pipeline that
    /// never reached the terminal stage goes back onto the intake queue
    /// before live traffic is served.
    async fn requeue_pending(&self) -> Result<(), ChainError> {
        let pending = self.deps.ledger.pending_for(self.spec.kind()).await;
        if pending.is_empty() {
            return Ok(());
        }
        info!(count = pending.len(), "Requeueing unfinished tasks from the ledger");
        let intake = self.deps.broker.get_or_create(self.spec.kind().name()).await;
        for task in pending {
            debug!(task.id = %task.id, stage = %task.stage, "Requeued");
            intake.push(task)?;
        }
        Ok(())
    }

    /// Advance one task as far as it can go in a single pass. The ledger
    /// snapshot wins over the queued copy: a requeued duplicate then sees
    /// the live stage instead of a stale one.
    #[instrument(skip_all, fields(task.id = %queued.id, content = %queued.content_id))]
    async fn process(&self, queued: Task, token: &CancellationToken) -> Result<(), ChainError> {
        let mut task = if self.deps.ledger.contains(&queued.id).await {
            self.deps.ledger.get(&queued.id).await?
        } else {
            self.deps.ledger.create(&queued).await?;
            queued
        };

        if task.is_ended() {
            debug!(stage = %task.stage, "Task already ended, skipping duplicate");
            self.deps
                .metrics
                .incr_with_tags("task.skipped", &[self.chain_tag()])
                .await;
            return Ok(());
        }

        task.mark_started();
        let mut meta: Option<ContentMetadata> = None;
        // Which backend produced the raw output currently on the task.
        // Unknown for tasks recovered from the ledger.
        let mut last_alias: Option<String> = None;
        let mut cache_checked = false;

        if task.stage == Stage::Preprocess {
            if let Some(rejection) = self.spec.precheck(&task) {
                return self.fail(task, rejection).await;
            }
            if task.source == SourceKind::PrivateMessage {
                self.send_status(&task, PROCESSING_STARTED_NOTICE).await?;
            }

            cache_checked = true;
            if let Some(cached) = self.cached_result(&task).await {
                return self.finish_from_cache(task, cached).await;
            }

            let fetched = match self.deps.metadata.fetch(&task.content_id).await {
                Ok(fetched) => fetched,
                Err(e) => {
                    warn!(error = ?e, "Metadata fetch failed");
                    return self.fail(task, "Could not fetch the content's details.").await;
                }
            };
            if fetched.is_multi_part() {
                return self.fail(task, "Multi-part content is not supported.").await;
            }

            match self.acquire_transcript(&fetched, token).await {
                TranscriptOutcome::Ready(text) => task.transcript = Some(text),
                TranscriptOutcome::Unavailable(detail) => return self.fail(task, detail).await,
            }
            meta = Some(fetched);

            task.stage = Stage::WaitingLlmResponse;
            self.deps.ledger.replace(&task).await?;
        }

        if task.stage == Stage::WaitingLlmResponse {
            // A task resumed at this stage still honors a warm cache
            // instead of paying for a backend call.
            if !cache_checked {
                if let Some(cached) = self.cached_result(&task).await {
                    return self.finish_from_cache(task, cached).await;
                }
            }
            let current_meta = match meta.take() {
                Some(current) => current,
                None => match self.deps.metadata.fetch(&task.content_id).await {
                    Ok(fetched) => fetched,
                    Err(e) => {
                        warn!(error = ?e, "Metadata fetch failed");
                        return self.fail(task, "Could not fetch the content's details.").await;
                    }
                },
            };
            // A resumed task keeps the transcript it already paid for.
            let transcript = match task.transcript.clone() {
                Some(text) => text,
                None => match self.acquire_transcript(&current_meta, token).await {
                    TranscriptOutcome::Ready(text) => {
                        task.transcript = Some(text.clone());
                        self.deps.ledger.replace(&task).await?;
                        text
                    }
                    TranscriptOutcome::Unavailable(detail) => {
                        return self.fail(task, detail).await
                    }
                },
            };

            let selected = match self.deps.llm.select_one().await {
                Some(selected) => selected,
                None => {
                    error!("Every generation backend is disabled, raising the stop signal");
                    token.cancel();
                    return self.fail(task, NO_LLM_DETAIL).await;
                }
            };
            let prompt = self.spec.build_prompt(&task, &current_meta, &transcript);
            match selected.backend.complete(prompt).await {
                Ok(Some(completion)) => {
                    self.record_tokens(&selected.alias, completion.tokens, token).await;
                    last_alias = Some(selected.alias.clone());
                    task.result = Some(TaskResult::text(completion.text));
                    task.stage = Stage::WaitingSend;
                    self.deps.ledger.replace(&task).await?;
                }
                Ok(None) => {
                    self.deps.llm.report_error(&selected.alias).await;
                    return self
                        .fail(task, "The generation backend returned nothing usable.")
                        .await;
                }
                Err(e) => {
                    warn!(backend = %selected.alias, error = ?e, "Generation call failed");
                    self.deps.llm.report_error(&selected.alias).await;
                    return self.fail(task, "The generation backend call failed.").await;
                }
            }
        }

        if matches!(
            task.stage,
            Stage::WaitingSend | Stage::WaitingRetry | Stage::WaitingPushToCache
        ) {
            let raw = match task.result.as_ref().and_then(TaskResult::as_text) {
                Some(text) => text.to_string(),
                None => {
                    return self.fail(task, "The raw backend output went missing.").await
                }
            };

            let first_try = if task.stage == Stage::WaitingRetry {
                // Recovered mid-retry: the stored output already failed
                // once, go straight back to the reformat prompt.
                None
            } else {
                match self.spec.parse(&raw) {
                    Ok(parsed) => Some(parsed),
                    Err(e) if task.stage == Stage::WaitingPushToCache => {
                        // Past the retry window; the stage never moves
                        // backwards.
                        warn!(error = ?e, "Recovered output no longer validates");
                        return self
                            .fail(task, "Stored backend output no longer validates.")
                            .await;
                    }
                    Err(e) => {
                        warn!(error = ?e, "Backend reply failed validation");
                        if let Some(alias) = last_alias.as_deref() {
                            self.deps.llm.report_error(alias).await;
                        }
                        None
                    }
                }
            };

            let parsed = match first_try {
                Some(parsed) => parsed,
                None => match self.retry(&mut task, &raw, token).await? {
                    RetryVerdict::Parsed(parsed) => parsed,
                    RetryVerdict::Failed(detail) => return self.fail(task, detail).await,
                },
            };

            return match parsed {
                ParsedReply::NotApplicable { notice } => {
                    self.end_not_applicable(task, notice).await
                }
                ParsedReply::Result(result) => self.finish(task, result).await,
            };
        }

        warn!(stage = %task.stage, "Task left in an unexpected stage");
        Ok(())
    }

    /// The single bounded retry: re-prompt the backend to reformat its own
    /// prior output, then validate once more. A second malformed reply is
    /// terminal.
    async fn retry(
        &self,
        task: &mut Task,
        raw: &str,
        token: &CancellationToken,
    ) -> Result<RetryVerdict, ChainError> {
        if task.stage != Stage::WaitingRetry {
            task.stage = Stage::WaitingRetry;
            task.retry_started_at = Some(Utc::now());
            let mut patch = serde_json::Map::new();
            patch.insert("stage".to_string(), json!(Stage::WaitingRetry));
            patch.insert("retry_started_at".to_string(), json!(task.retry_started_at));
            self.deps.ledger.update(&task.id, patch).await?;
        }
        self.deps
            .metrics
            .incr_with_tags("task.retried", &[self.chain_tag()])
            .await;

        let selected = match self.deps.llm.select_one().await {
            Some(selected) => selected,
            None => {
                error!("Every generation backend is disabled, raising the stop signal");
                token.cancel();
                return Ok(RetryVerdict::Failed(NO_LLM_DETAIL.to_string()));
            }
        };
        match selected.backend.complete(self.spec.retry_prompt(raw)).await {
            Ok(Some(completion)) => {
                self.record_tokens(&selected.alias, completion.tokens, token).await;
                match self.spec.parse(&completion.text) {
                    Ok(parsed) => {
                        task.retried = true;
                        task.result = Some(TaskResult::text(completion.text));
                        Ok(RetryVerdict::Parsed(parsed))
                    }
                    Err(e) => {
                        warn!(backend = %selected.alias, error = ?e, "Reformatted reply still failed validation");
                        self.deps.llm.report_error(&selected.alias).await;
                        Ok(RetryVerdict::Failed(
                            "The backend reply could not be turned into a valid result."
                                .to_string(),
                        ))
                    }
                }
            }
            Ok(None) => {
                self.deps.llm.report_error(&selected.alias).await;
                Ok(RetryVerdict::Failed(
                    "The generation backend returned nothing usable.".to_string(),
                ))
            }
            Err(e) => {
                warn!(backend = %selected.alias, error = ?e, "Reformat call failed");
                self.deps.llm.report_error(&selected.alias).await;
                Ok(RetryVerdict::Failed(
                    "The generation backend call failed.".to_string(),
                ))
            }
        }
    }

    /// Provider transcript when it exists, machine transcription otherwise,
    /// failing over across transcription backends until the router gives
    /// up.
    async fn acquire_transcript(
        &self,
        meta: &ContentMetadata,
        token: &CancellationToken,
    ) -> TranscriptOutcome {
        if let Some(text) = meta.transcript.as_deref() {
            if !text.trim().is_empty() {
                self.deps
                    .metrics
                    .incr_with_tags("transcript.provider", &[self.chain_tag()])
                    .await;
                return TranscriptOutcome::Ready(text.to_string());
            }
        }

        let audio = match meta.audio_source() {
            Some(audio) => audio,
            None => {
                return TranscriptOutcome::Unavailable(
                    "The content has no transcript and no audio to transcribe.".to_string(),
                )
            }
        };
        loop {
            let selected = match self.deps.speech.select_one().await {
                Some(selected) => selected,
                None => {
                    return TranscriptOutcome::Unavailable(
                        "The content has no transcript and no transcription backend is available."
                            .to_string(),
                    )
                }
            };
            match selected.backend.transcribe(&audio).await {
                Ok(Some(text)) => {
                    self.deps
                        .metrics
                        .incr_with_tags("transcript.asr", &[self.chain_tag()])
                        .await;
                    return TranscriptOutcome::Ready(self.touch_up(text, token).await);
                }
                Ok(None) => {
                    warn!(backend = %selected.alias, content = %audio.content_id, "Transcription produced nothing, trying the next backend");
                    self.deps.speech.report_error(&selected.alias).await;
                }
                Err(e) => {
                    warn!(backend = %selected.alias, content = %audio.content_id, error = ?e, "Transcription failed, trying the next backend");
                    self.deps.speech.report_error(&selected.alias).await;
                }
            }
        }
    }

    /// Best-effort cleanup pass over machine transcription. Any fault keeps
    /// the raw transcript.
    async fn touch_up(&self, raw: String, token: &CancellationToken) -> String {
        if !self.deps.touch_up_transcripts {
            return raw;
        }
        let selected = match self.deps.llm.select_one().await {
            Some(selected) => selected,
            None => return raw,
        };
        let prompt = ChatPrompt::user(templates::transcript_touch_up(&raw));
        match selected.backend.complete(prompt).await {
            Ok(Some(completion)) => {
                self.record_tokens(&selected.alias, completion.tokens, token).await;
                if completion.text.trim().is_empty() {
                    raw
                } else {
                    completion.text
                }
            }
            Ok(None) => raw,
            Err(e) => {
                warn!(backend = %selected.alias, error = ?e, "Transcript touch-up failed, keeping the machine transcript");
                raw
            }
        }
    }

    /// Count tokens against the process-wide ceiling; crossing it raises
    /// the stop signal, letting in-flight tasks finish while nothing new
    /// starts.
    async fn record_tokens(&self, alias: &str, tokens: u64, token: &CancellationToken) {
        let used = self.deps.tokens.record(tokens);
        self.deps
            .metrics
            .count_with_tags("llm.tokens", tokens, &[("backend", alias)])
            .await;
        debug!(backend = %alias, tokens, used, "Recorded token usage");
        if self.deps.tokens.exhausted() && !token.is_cancelled() {
            error!(
                used,
                ceiling = ?self.deps.tokens.ceiling(),
                "Cumulative token ceiling crossed, raising the stop signal"
            );
            token.cancel();
        }
    }

    /// Deliver a validated result, write it through the cache, and close
    /// the ledger entry.
    async fn finish(&self, mut task: Task, result: TaskResult) -> Result<(), ChainError> {
        task.result = Some(result.clone());
        self.send_snapshot(&task).await?;

        task.stage = Stage::WaitingPushToCache;
        self.deps.ledger.set_stage(&task.id, Stage::WaitingPushToCache).await?;
        self.deps
            .cache
            .set(&result_key(&task.content_id, task.chain), &result)
            .await?;

        task.end(EndReason::Normal);
        self.deps.ledger.replace(&task).await?;
        info!(retried = task.retried, "Task completed");
        self.deps
            .metrics
            .incr_with_tags("task.completed", &[self.chain_tag()])
            .await;
        self.record_duration(&task).await;
        Ok(())
    }

    /// One cache lookup with hit/miss accounting.
    async fn cached_result(&self, task: &Task) -> Option<TaskResult> {
        let key = result_key(&task.content_id, task.chain);
        match self.deps.cache.get(&key).await {
            Some(cached) => {
                self.deps
                    .metrics
                    .incr_with_tags("cache.hit", &[self.chain_tag()])
                    .await;
                Some(cached)
            }
            None => {
                self.deps
                    .metrics
                    .incr_with_tags("cache.miss", &[self.chain_tag()])
                    .await;
                None
            }
        }
    }

    /// Cache hit: deliver the stored result without any backend work.
    async fn finish_from_cache(&self, mut task: Task, cached: TaskResult) -> Result<(), ChainError> {
        task.result = Some(cached);
        self.send_snapshot(&task).await?;
        task.end(EndReason::Normal);
        self.deps.ledger.replace(&task).await?;
        info!("Task served from cache");
        self.deps
            .metrics
            .incr_with_tags("task.completed", &[self.chain_tag(), ("outcome", "from_cache")])
            .await;
        self.record_duration(&task).await;
        Ok(())
    }

    /// The backend judged the content not worth processing. Not an error,
    /// not cached: a later request gets a fresh judgement.
    async fn end_not_applicable(&self, mut task: Task, notice: String) -> Result<(), ChainError> {
        info!("Backend judged the content not worth processing");
        if task.source.supports_sync_feedback() {
            self.send_status(&task, &notice).await?;
        }
        task.result = Some(TaskResult::text(notice));
        task.end(EndReason::NotApplicable);
        self.deps.ledger.replace(&task).await?;
        self.deps
            .metrics
            .incr_with_tags("task.not_applicable", &[self.chain_tag()])
            .await;
        self.record_duration(&task).await;
        Ok(())
    }

    /// Terminal failure: record the detail, tell the requester when the
    /// source supports it, move on to the next intake item.
    async fn fail(&self, mut task: Task, detail: impl Into<String>) -> Result<(), ChainError> {
        let detail = detail.into();
        warn!(detail = %detail, "Task failed");
        task.end_with_error(detail);
        if task.source.supports_sync_feedback() {
            self.send_snapshot(&task).await?;
        }
        self.deps.ledger.replace(&task).await?;
        self.deps
            .metrics
            .incr_with_tags("task.failed", &[self.chain_tag()])
            .await;
        self.record_duration(&task).await;
        Ok(())
    }

    async fn send_snapshot(&self, task: &Task) -> Result<(), ChainError> {
        let queue = self
            .deps
            .broker
            .get_or_create(outbound_queue_for(task.source))
            .await;
        queue.push(task.clone())?;
        Ok(())
    }

    /// Push a copy of the task carrying a short status text instead of the
    /// live result.
    async fn send_status(&self, task: &Task, text: &str) -> Result<(), ChainError> {
        let mut snapshot = task.clone();
        snapshot.result = Some(TaskResult::text(text));
        self.send_snapshot(&snapshot).await
    }

    async fn record_duration(&self, task: &Task) {
        if let (Some(started), Some(ended)) = (task.started_at, task.ended_at) {
            let millis = (ended - started).num_milliseconds().max(0) as u64;
            self.deps
                .metrics
                .time_with_tags("task.duration", millis, &[self.chain_tag()])
                .await;
        }
    }

    fn chain_tag(&self) -> (&'static str, &'static str) {
        ("chain", self.spec.kind().name())
    }
}
