//! Keyword dispatch: inbound triggers become pipeline tasks.
//!
//! A trigger is one platform event (a comment mention, a private message,
//! an API call) carrying the literal command text the requester wrote. The
//! dispatcher scans that text for the configured pipeline keywords and, on
//! a match, builds a [`Task`] and enqueues it on the matching pipeline's
//! intake queue. Matching is literal and case-sensitive; the answer
//! keywords are checked first so a command like "ask to tldw this" goes to
//! the pipeline that can use the question text.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::DispatchError;
use crate::metrics::SharedMetricsPublisher;
use crate::queue::QueueBroker;
use crate::task::{ChainKind, CommandParams, ReplyRef, SourceKind, Task};

/// One inbound event, already resolved to a content id and locator by the
/// listener that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub source: SourceKind,
    pub sender_id: u64,
    pub content_id: String,
    pub locator: String,
    pub command: String,
    #[serde(default)]
    pub reply_ref: Option<ReplyRef>,
    /// The platform's raw event payload, kept verbatim on the task.
    #[serde(default)]
    pub raw: serde_json::Value,
}

pub struct Dispatcher {
    broker: Arc<QueueBroker<Task>>,
    summarize_keywords: Vec<String>,
    answer_keywords: Vec<String>,
    metrics: SharedMetricsPublisher,
}

impl Dispatcher {
    pub fn new(
        broker: Arc<QueueBroker<Task>>,
        summarize_keywords: Vec<String>,
        answer_keywords: Vec<String>,
        metrics: SharedMetricsPublisher,
    ) -> Self {
        Self {
            broker,
            summarize_keywords,
            answer_keywords,
            metrics,
        }
    }

    /// Which pipeline a command addresses, plus the parameters parsed from
    /// it. `None` when no keyword occurs in the text.
    pub fn classify(&self, command: &str) -> Option<(ChainKind, CommandParams)> {
        if let Some((index, keyword)) = find_keyword(command, &self.answer_keywords) {
            let rest = command[index + keyword.len()..]
                .trim_start()
                .strip_prefix(':')
                .unwrap_or(&command[index + keyword.len()..])
                .trim();
            let question = if rest.is_empty() {
                None
            } else {
                Some(rest.to_string())
            };
            return Some((ChainKind::Answer, CommandParams { question }));
        }
        if find_keyword(command, &self.summarize_keywords).is_some() {
            return Some((ChainKind::Summarize, CommandParams::default()));
        }
        None
    }

    /// Turn a trigger into a queued task, or `Ok(None)` when the command
    /// names no pipeline. Unmatched triggers are logged and dropped; plenty
    /// of mentions are just conversation.
    pub async fn dispatch(&self, trigger: Trigger) -> Result<Option<Task>, DispatchError> {
        let Some((chain, params)) = self.classify(&trigger.command) else {
            info!(command = %trigger.command, "No pipeline keyword in command, ignoring");
            self.metrics.incr("dispatch.unmatched").await;
            return Ok(None);
        };

        let mut task = Task::new(
            chain,
            trigger.source,
            trigger.sender_id,
            trigger.content_id,
            trigger.locator,
            trigger.command,
        )
        .with_params(params)
        .with_raw_trigger(trigger.raw);
        if let Some(reply_ref) = trigger.reply_ref {
            task = task.with_reply_ref(reply_ref);
        }

        let queue = self.broker.get_or_create(chain.name()).await;
        queue
            .push(task.clone())
            .map_err(|source| DispatchError::EnqueueFailed {
                chain: chain.name().to_string(),
                source,
            })?;
        debug!(task.id = %task.id, chain = %chain, source = %task.source, "Task dispatched");
        self.metrics
            .incr_with_tags("dispatch.matched", &[("chain", chain.name())])
            .await;
        Ok(Some(task))
    }
}

/// The earliest occurrence of any keyword in `command`; ties go to the
/// keyword listed first.
fn find_keyword<'a>(command: &str, keywords: &'a [String]) -> Option<(usize, &'a str)> {
    let mut best: Option<(usize, &'a str)> = None;
    for keyword in keywords {
        if keyword.is_empty() {
            continue;
        }
        if let Some(index) = command.find(keyword.as_str()) {
            if best.map_or(true, |(at, _)| index < at) {
                best = Some((index, keyword.as_str()));
            }
        }
    }
    best
}

/// Load every `*.json` trigger under `dir`, ordered by file name so demo
/// runs replay deterministically.
pub async fn load_trigger_dir(dir: &Path) -> anyhow::Result<Vec<Trigger>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading trigger dir {}", dir.display()))?;

    let mut found: Vec<(String, Trigger)> = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading trigger {}", path.display()))?;
        let trigger: Trigger = serde_json::from_slice(&bytes)
            .with_context(|| format!("decoding trigger {}", path.display()))?;
        found.push((entry.file_name().to_string_lossy().into_owned(), trigger));
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));

    debug!(triggers = found.len(), dir = %dir.display(), "Triggers loaded");
    Ok(found.into_iter().map(|(_, trigger)| trigger).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoOpMetricsPublisher;
    use crate::task::Stage;
    use ulid::Ulid;

    fn dispatcher(broker: Arc<QueueBroker<Task>>) -> Dispatcher {
        Dispatcher::new(
            broker,
            vec!["summarize".to_string(), "tldw".to_string()],
            vec!["ask".to_string(), "question".to_string()],
            Arc::new(NoOpMetricsPublisher::new()),
        )
    }

    fn broker() -> Arc<QueueBroker<Task>> {
        let path = std::env::temp_dir().join(format!("tldw_test_{}/queues.json", Ulid::new()));
        Arc::new(QueueBroker::new(path))
    }

    fn trigger(command: &str) -> Trigger {
        Trigger {
            source: SourceKind::Comment,
            sender_id: 42,
            content_id: "V1".to_string(),
            locator: "https://example.com/v/V1".to_string(),
            command: command.to_string(),
            reply_ref: None,
            raw: serde_json::json!({"event": "mention"}),
        }
    }

    #[test]
    fn answer_keyword_captures_the_question() {
        let d = dispatcher(broker());

        let (chain, params) = d.classify("ask: why is the sky blue").unwrap();
        assert_eq!(chain, ChainKind::Answer);
        assert_eq!(params.question.as_deref(), Some("why is the sky blue"));

        let (_, params) = d.classify("hey ask what happened at the end").unwrap();
        assert_eq!(params.question.as_deref(), Some("what happened at the end"));
    }

    #[test]
    fn answer_keyword_without_a_question_leaves_it_empty() {
        let d = dispatcher(broker());
        let (chain, params) = d.classify("ask").unwrap();
        assert_eq!(chain, ChainKind::Answer);
        assert!(params.question.is_none());

        let (_, params) = d.classify("ask:   ").unwrap();
        assert!(params.question.is_none());
    }

    #[test]
    fn answer_keywords_win_over_summarize_keywords() {
        let d = dispatcher(broker());
        let (chain, params) = d.classify("ask to tldw this video").unwrap();
        assert_eq!(chain, ChainKind::Answer);
        assert_eq!(params.question.as_deref(), Some("to tldw this video"));
    }

    #[test]
    fn earliest_keyword_occurrence_wins() {
        let d = dispatcher(broker());
        let (_, params) = d.classify("question ask me anything").unwrap();
        assert_eq!(params.question.as_deref(), Some("ask me anything"));
    }

    #[test]
    fn summarize_keywords_match_anywhere_in_the_command() {
        let d = dispatcher(broker());
        let (chain, params) = d.classify("please tldw").unwrap();
        assert_eq!(chain, ChainKind::Summarize);
        assert_eq!(params, CommandParams::default());
    }

    #[test]
    fn matching_is_case_sensitive() {
        let d = dispatcher(broker());
        assert!(d.classify("TLDW this").is_none());
        assert!(d.classify("nothing relevant here").is_none());
    }

    #[tokio::test]
    async fn matched_trigger_lands_on_the_pipeline_queue() {
        let broker = broker();
        let d = dispatcher(broker.clone());

        let mut t = trigger("tldw please");
        t.reply_ref = Some(ReplyRef {
            root_id: Some(5),
            parent_id: Some(5),
        });
        let task = d.dispatch(t).await.unwrap().unwrap();
        assert_eq!(task.chain, ChainKind::Summarize);
        assert_eq!(task.stage, Stage::Preprocess);
        assert_eq!(task.raw_trigger["event"], "mention");
        assert!(task.reply_ref.is_some());

        let queued = broker.get_or_create("summarize").await.pull().await.unwrap();
        assert_eq!(queued.id, task.id);
    }

    #[tokio::test]
    async fn unmatched_trigger_is_dropped() {
        let broker = broker();
        let d = dispatcher(broker.clone());

        assert!(d.dispatch(trigger("great video!")).await.unwrap().is_none());
        assert_eq!(broker.get_or_create("summarize").await.depth().await, 0);
        assert_eq!(broker.get_or_create("answer").await.depth().await, 0);
    }

    #[tokio::test]
    async fn trigger_dir_loads_in_file_name_order() {
        let dir = std::env::temp_dir().join(format!("tldw_test_{}", Ulid::new()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let second = trigger("tldw second");
        let first = trigger("tldw first");
        tokio::fs::write(
            dir.join("002_second.json"),
            serde_json::to_vec_pretty(&second).unwrap(),
        )
        .await
        .unwrap();
        tokio::fs::write(
            dir.join("001_first.json"),
            serde_json::to_vec_pretty(&first).unwrap(),
        )
        .await
        .unwrap();
        tokio::fs::write(dir.join("notes.md"), b"ignored").await.unwrap();

        let triggers = load_trigger_dir(&dir).await.unwrap();
        assert_eq!(triggers.len(), 2);
        assert_eq!(triggers[0].command, "tldw first");
        assert_eq!(triggers[1].command, "tldw second");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn sparse_trigger_documents_get_defaults() {
        let raw = r#"{
            "source": "comment",
            "sender_id": 7,
            "content_id": "V9",
            "locator": "https://example.com/v/V9",
            "command": "tldw"
        }"#;
        let t: Trigger = serde_json::from_str(raw).unwrap();
        assert!(t.reply_ref.is_none());
        assert!(t.raw.is_null());
    }
}
