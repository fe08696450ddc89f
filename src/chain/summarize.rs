//! The summarize pipeline: condense one piece of content into a short,
//! self-scored summary.

use crate::chain::{nested_reply_rejection, ChainSpec, ParsedReply};
use crate::content::ContentMetadata;
use crate::llm::{parse_reply, templates, ChatPrompt};
use crate::task::{ChainKind, SummaryVerdict, Task, TaskResult};

const NOT_WORTH_SUMMARIZING: &str =
    "This content does not have enough substance to be worth summarizing.";

#[derive(Clone, Copy, Debug, Default)]
pub struct SummarizeChain;

impl SummarizeChain {
    pub fn new() -> Self {
        Self
    }
}

impl ChainSpec for SummarizeChain {
    fn kind(&self) -> ChainKind {
        ChainKind::Summarize
    }

    fn precheck(&self, task: &Task) -> Option<String> {
        nested_reply_rejection(task)
    }

    fn build_prompt(&self, _task: &Task, meta: &ContentMetadata, transcript: &str) -> ChatPrompt {
        let tags = meta.tags_line();
        let comments = meta.comments_line();
        let user = templates::fill(
            templates::SUMMARY_USER,
            &[
                ("title", meta.title.as_str()),
                ("description", meta.description.as_str()),
                ("transcript", transcript),
                ("tags", tags.as_str()),
                ("comments", comments.as_str()),
            ],
        );
        ChatPrompt::with_system(templates::summary_system(), user)
    }

    fn parse(&self, raw: &str) -> Result<ParsedReply, serde_json::Error> {
        let verdict: SummaryVerdict = parse_reply(raw)?;
        if verdict.if_no_need_summary {
            return Ok(ParsedReply::NotApplicable {
                notice: NOT_WORTH_SUMMARIZING.to_string(),
            });
        }
        if verdict.summary.trim().is_empty() {
            // The reformat prompt tells the backend to flip
            // `if_no_need_summary` instead of leaving the summary blank.
            return Err(<serde_json::Error as serde::de::Error>::custom(
                "summary field is blank",
            ));
        }
        Ok(ParsedReply::Result(TaskResult::Summary(verdict)))
    }

    fn retry_prompt(&self, raw: &str) -> ChatPrompt {
        ChatPrompt::user(templates::summary_reformat(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatRole;
    use crate::task::{ReplyRef, SourceKind};

    fn sample_task() -> Task {
        Task::new(
            ChainKind::Summarize,
            SourceKind::Comment,
            42,
            "V1",
            "https://example.com/v/V1",
            "summarize this",
        )
    }

    fn sample_meta() -> ContentMetadata {
        ContentMetadata {
            id: "V1".to_string(),
            title: "Why ducks sleep with one eye open".to_string(),
            description: "A short look at unihemispheric sleep".to_string(),
            tags: vec!["birds".to_string()],
            comments: vec!["wild".to_string()],
            parts: 1,
            transcript: None,
            audio_url: None,
        }
    }

    #[test]
    fn prompt_carries_the_content_context() {
        let chain = SummarizeChain::new();
        let task = sample_task();
        let meta = sample_meta();

        let prompt = chain.build_prompt(&task, &meta, "the spoken words");
        assert_eq!(prompt.messages[0].role, ChatRole::System);
        assert!(prompt.messages[0].content.contains("if_no_need_summary"));
        assert_eq!(prompt.messages[1].role, ChatRole::User);
        assert!(prompt.messages[1].content.contains(&meta.title));
        assert!(prompt.messages[1].content.contains("the spoken words"));
    }

    #[test]
    fn valid_reply_parses_into_a_summary() {
        let chain = SummarizeChain::new();
        let raw = r#"{"summary": "ducks sleep with one eye open", "score": "88", "thinking": "", "if_no_need_summary": false}"#;
        match chain.parse(raw).unwrap() {
            ParsedReply::Result(TaskResult::Summary(verdict)) => {
                assert_eq!(verdict.summary, "ducks sleep with one eye open");
                assert_eq!(verdict.score, 88);
            }
            other => panic!("unexpected parse outcome: {other:?}"),
        }
    }

    #[test]
    fn no_need_summary_is_not_applicable() {
        let chain = SummarizeChain::new();
        let raw = r#"{"summary": "", "score": "0", "thinking": "", "if_no_need_summary": true}"#;
        assert!(matches!(
            chain.parse(raw).unwrap(),
            ParsedReply::NotApplicable { .. }
        ));
    }

    #[test]
    fn blank_summary_fails_validation() {
        let chain = SummarizeChain::new();
        let raw = r#"{"summary": "   ", "score": "50", "thinking": "", "if_no_need_summary": false}"#;
        assert!(chain.parse(raw).is_err());
    }

    #[test]
    fn prose_reply_fails_validation() {
        let chain = SummarizeChain::new();
        assert!(chain.parse("Sure! Here is your summary: ducks.").is_err());
    }

    #[test]
    fn retry_prompt_wraps_the_prior_output() {
        let chain = SummarizeChain::new();
        let prompt = chain.retry_prompt("Sure! Here is your summary: ducks.");
        assert_eq!(prompt.messages.len(), 1);
        assert!(prompt.messages[0]
            .content
            .contains("Sure! Here is your summary: ducks."));
        assert!(prompt.messages[0].content.contains("if_no_need_summary"));
    }

    #[test]
    fn nested_replies_fail_precheck() {
        let chain = SummarizeChain::new();
        let mut task = sample_task();
        assert!(chain.precheck(&task).is_none());

        task.reply_ref = Some(ReplyRef {
            root_id: Some(1),
            parent_id: Some(2),
        });
        assert!(chain.precheck(&task).is_some());
    }
}
