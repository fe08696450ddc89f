//! Canned language-model backend.
//!
//! Serves scripted completions so the full pipeline can run without a paid
//! vendor client: demos load replies from a JSON file, tests queue them up
//! inline. An exhausted queue answers `Ok(None)`, the soft-failure shape
//! real backends use when a call returns nothing usable.

use std::collections::VecDeque;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ChatPrompt, Completion, LlmBackend};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureReply {
    pub text: String,
    #[serde(default)]
    pub tokens: u64,
}

pub struct FixtureLlm {
    alias: String,
    replies: Mutex<VecDeque<FixtureReply>>,
    repeat_last: bool,
}

impl FixtureLlm {
    /// Replies served in order; once they run out every call soft-fails.
    pub fn with_replies(alias: impl Into<String>, replies: Vec<FixtureReply>) -> Self {
        Self {
            alias: alias.into(),
            replies: Mutex::new(replies.into()),
            repeat_last: false,
        }
    }

    /// A single reply served forever.
    pub fn repeating(alias: impl Into<String>, text: impl Into<String>, tokens: u64) -> Self {
        Self {
            alias: alias.into(),
            replies: Mutex::new(VecDeque::from(vec![FixtureReply {
                text: text.into(),
                tokens,
            }])),
            repeat_last: true,
        }
    }

    /// Load a JSON array of replies. The last entry repeats, so a demo run
    /// never goes dark mid-stream.
    pub async fn from_file(alias: impl Into<String>, path: &Path) -> anyhow::Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading llm fixture {}", path.display()))?;
        let replies: Vec<FixtureReply> = serde_json::from_slice(&bytes)
            .with_context(|| format!("decoding llm fixture {}", path.display()))?;
        Ok(Self {
            alias: alias.into(),
            replies: Mutex::new(replies.into()),
            repeat_last: true,
        })
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().len()
    }
}

#[async_trait]
impl LlmBackend for FixtureLlm {
    fn alias(&self) -> &str {
        &self.alias
    }

    async fn complete(&self, prompt: ChatPrompt) -> anyhow::Result<Option<Completion>> {
        let reply = {
            let mut replies = self.replies.lock();
            if self.repeat_last && replies.len() == 1 {
                replies.front().cloned()
            } else {
                replies.pop_front()
            }
        };
        match reply {
            Some(reply) => {
                debug!(
                    backend = %self.alias,
                    prompt_messages = prompt.messages.len(),
                    tokens = reply.tokens,
                    "Serving canned completion"
                );
                Ok(Some(Completion {
                    text: reply.text,
                    tokens: reply.tokens,
                }))
            }
            None => {
                debug!(backend = %self.alias, "Fixture exhausted, soft-failing");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn reply(text: &str, tokens: u64) -> FixtureReply {
        FixtureReply {
            text: text.to_string(),
            tokens,
        }
    }

    #[tokio::test]
    async fn serves_replies_in_order_then_soft_fails() {
        let llm = FixtureLlm::with_replies("canned", vec![reply("one", 10), reply("two", 20)]);

        let first = llm.complete(ChatPrompt::user("hi")).await.unwrap().unwrap();
        assert_eq!(first.text, "one");
        assert_eq!(first.tokens, 10);

        let second = llm.complete(ChatPrompt::user("hi")).await.unwrap().unwrap();
        assert_eq!(second.text, "two");

        assert!(llm.complete(ChatPrompt::user("hi")).await.unwrap().is_none());
        assert_eq!(llm.remaining(), 0);
    }

    #[tokio::test]
    async fn repeating_fixture_never_exhausts() {
        let llm = FixtureLlm::repeating("canned", "same", 5);
        for _ in 0..4 {
            let completion = llm.complete(ChatPrompt::user("hi")).await.unwrap().unwrap();
            assert_eq!(completion.text, "same");
        }
        assert_eq!(llm.remaining(), 1);
    }

    #[tokio::test]
    async fn loads_replies_from_a_json_file() {
        let dir = std::env::temp_dir().join(format!("tldw_test_{}", Ulid::new()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("replies.json");
        tokio::fs::write(
            &path,
            serde_json::to_vec(&vec![reply("from disk", 7)]).unwrap(),
        )
        .await
        .unwrap();

        let llm = FixtureLlm::from_file("canned", &path).await.unwrap();
        let completion = llm.complete(ChatPrompt::user("hi")).await.unwrap().unwrap();
        assert_eq!(completion.text, "from disk");
        assert_eq!(completion.tokens, 7);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn missing_fixture_file_is_an_error() {
        let path = std::env::temp_dir().join(format!("tldw_test_{}/absent.json", Ulid::new()));
        assert!(FixtureLlm::from_file("canned", &path).await.is_err());
    }

    #[tokio::test]
    async fn routes_as_a_trait_object() {
        use crate::router::{BackendRouter, BackendSettings};
        use std::collections::HashMap;
        use std::sync::Arc;

        let router: BackendRouter<dyn LlmBackend> = BackendRouter::new(HashMap::from([(
            "canned".to_string(),
            BackendSettings {
                priority: 50,
                enabled: true,
            },
        )]));
        let backend: Arc<dyn LlmBackend> = Arc::new(FixtureLlm::repeating("canned", "hi", 1));
        router.register(backend).await.unwrap();

        let selected = router.select_one().await.unwrap();
        assert_eq!(selected.alias, "canned");
        let completion = selected
            .backend
            .complete(ChatPrompt::user("prompt"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completion.text, "hi");
    }
}
