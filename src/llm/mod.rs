//! Language-model backends behind the router.
//!
//! A backend turns a [`ChatPrompt`] into a [`Completion`]. `Ok(None)` is a
//! soft failure: the call went through but produced nothing usable, the
//! caller reports it against the backend's alias and ends the task. Prompt
//! text comes from [`templates`]; model replies are free text that
//! [`parse_reply`] digs the JSON payload out of.

pub mod fixture;
pub mod templates;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::router::RouterBackend;

pub use fixture::{FixtureLlm, FixtureReply};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// Messages for one completion call, system prompt first when present.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChatPrompt {
    pub messages: Vec<ChatMessage>,
}

impl ChatPrompt {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage {
                role: ChatRole::User,
                content: content.into(),
            }],
        }
    }

    pub fn with_system(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![
                ChatMessage {
                    role: ChatRole::System,
                    content: system.into(),
                },
                ChatMessage {
                    role: ChatRole::User,
                    content: user.into(),
                },
            ],
        }
    }

    /// Concatenated message text, for fixtures and logs.
    pub fn flattened(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// One model reply plus the tokens the call consumed, counted against the
/// optional process-wide ceiling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub tokens: u64,
}

#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn alias(&self) -> &str;

    /// One-time setup, run by the router on first selection.
    async fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn complete(&self, prompt: ChatPrompt) -> anyhow::Result<Option<Completion>>;
}

/// Lets `BackendRouter<dyn LlmBackend>` drive boxed language-model backends.
#[async_trait]
impl RouterBackend for dyn LlmBackend {
    fn alias(&self) -> &str {
        LlmBackend::alias(self)
    }

    async fn prepare(&self) -> anyhow::Result<()> {
        LlmBackend::prepare(self).await
    }
}

/// Decode a typed reply from raw model output. Tries the whole string
/// first, then the first balanced JSON object, which also covers replies
/// wrapped in code fences or prose.
pub fn parse_reply<T: DeserializeOwned>(raw: &str) -> Result<T, serde_json::Error> {
    match serde_json::from_str(raw.trim()) {
        Ok(value) => Ok(value),
        Err(whole) => match extract_json_block(raw) {
            Some(block) => serde_json::from_str(block),
            None => Err(whole),
        },
    }
}

/// The first balanced `{...}` in `raw`, brace-matched outside of string
/// literals. `None` when no object opens or the braces never close.
pub fn extract_json_block(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::SummaryVerdict;

    #[test]
    fn prompt_orders_system_before_user() {
        let prompt = ChatPrompt::with_system("be terse", "hello");
        assert_eq!(prompt.messages[0].role, ChatRole::System);
        assert_eq!(prompt.messages[1].role, ChatRole::User);
        assert_eq!(prompt.flattened(), "be terse\n\nhello");
    }

    #[test]
    fn parses_a_bare_json_reply() {
        let verdict: SummaryVerdict =
            parse_reply(r#"{"summary": "a video", "score": "88", "thinking": "hm"}"#).unwrap();
        assert_eq!(verdict.summary, "a video");
        assert_eq!(verdict.score, 88);
    }

    #[test]
    fn parses_a_fenced_reply_with_prose() {
        let raw = "Sure! Here is the JSON you asked for:\n```json\n{\"summary\": \"ok\", \"score\": 5}\n```\nHope that helps.";
        let verdict: SummaryVerdict = parse_reply(raw).unwrap();
        assert_eq!(verdict.summary, "ok");
        assert_eq!(verdict.score, 5);
    }

    #[test]
    fn brace_matching_ignores_braces_inside_strings() {
        let raw = r#"prefix {"summary": "uses { and } freely", "score": "1"} suffix"#;
        let block = extract_json_block(raw).unwrap();
        assert_eq!(block, r#"{"summary": "uses { and } freely", "score": "1"}"#);
    }

    #[test]
    fn reply_without_json_is_an_error() {
        assert!(parse_reply::<SummaryVerdict>("I refuse to answer in JSON.").is_err());
        assert!(extract_json_block("no object here").is_none());
        assert!(extract_json_block("open { never closes").is_none());
    }
}
