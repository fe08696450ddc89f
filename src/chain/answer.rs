//! The answer pipeline: respond to a viewer question about one piece of
//! content.

use crate::chain::{nested_reply_rejection, ChainSpec, ParsedReply};
use crate::content::ContentMetadata;
use crate::llm::{parse_reply, templates, ChatPrompt};
use crate::task::{AnswerReply, ChainKind, Task, TaskResult};

const MISSING_QUESTION: &str =
    "I could not find a question in your command; write it after the keyword.";

#[derive(Clone, Copy, Debug, Default)]
pub struct AnswerChain;

impl AnswerChain {
    pub fn new() -> Self {
        Self
    }
}

impl ChainSpec for AnswerChain {
    fn kind(&self) -> ChainKind {
        ChainKind::Answer
    }

    fn precheck(&self, task: &Task) -> Option<String> {
        if let Some(rejection) = nested_reply_rejection(task) {
            return Some(rejection);
        }
        let question = task.params.question.as_deref().unwrap_or("");
        if question.trim().is_empty() {
            return Some(MISSING_QUESTION.to_string());
        }
        None
    }

    fn build_prompt(&self, task: &Task, meta: &ContentMetadata, transcript: &str) -> ChatPrompt {
        let question = task.params.question.as_deref().unwrap_or("");
        let user = templates::fill(
            templates::ANSWER_USER,
            &[
                ("title", meta.title.as_str()),
                ("description", meta.description.as_str()),
                ("transcript", transcript),
                ("question", question),
            ],
        );
        ChatPrompt::with_system(templates::answer_system(), user)
    }

    fn parse(&self, raw: &str) -> Result<ParsedReply, serde_json::Error> {
        let reply: AnswerReply = parse_reply(raw)?;
        if reply.answer.trim().is_empty() {
            return Err(<serde_json::Error as serde::de::Error>::custom(
                "answer field is blank",
            ));
        }
        Ok(ParsedReply::Result(TaskResult::Answer(reply)))
    }

    fn retry_prompt(&self, raw: &str) -> ChatPrompt {
        ChatPrompt::user(templates::answer_reformat(raw))
    }
}
