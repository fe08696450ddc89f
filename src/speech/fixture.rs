//! Canned transcription backend.
//!
//! Maps content ids to pre-written transcripts, with an optional fallback
//! for demo runs. Lookups go through the blocking pool the way a real
//! model-backed transcriber would run inference.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::debug;

use crate::worker::BlockingPool;

use super::{AudioSource, SpeechBackend};

pub struct FixtureSpeech {
    alias: String,
    pool: Arc<BlockingPool>,
    transcripts: Arc<HashMap<String, String>>,
    fallback: Option<String>,
}

impl FixtureSpeech {
    /// Transcripts keyed by content id; anything else soft-fails.
    pub fn with_transcripts(
        alias: impl Into<String>,
        pool: Arc<BlockingPool>,
        transcripts: HashMap<String, String>,
    ) -> Self {
        Self {
            alias: alias.into(),
            pool,
            transcripts: Arc::new(transcripts),
            fallback: None,
        }
    }

    /// The same transcript for every content id.
    pub fn always(alias: impl Into<String>, pool: Arc<BlockingPool>, text: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            pool,
            transcripts: Arc::new(HashMap::new()),
            fallback: Some(text.into()),
        }
    }

    /// Soft-fails every call. Stands in for a transcriber whose service is
    /// down.
    pub fn unavailable(alias: impl Into<String>, pool: Arc<BlockingPool>) -> Self {
        Self {
            alias: alias.into(),
            pool,
            transcripts: Arc::new(HashMap::new()),
            fallback: None,
        }
    }

    /// Load a JSON object of content-id to transcript pairs.
    pub async fn from_file(
        alias: impl Into<String>,
        pool: Arc<BlockingPool>,
        path: &Path,
    ) -> anyhow::Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading speech fixture {}", path.display()))?;
        let transcripts: HashMap<String, String> = serde_json::from_slice(&bytes)
            .with_context(|| format!("decoding speech fixture {}", path.display()))?;
        Ok(Self::with_transcripts(alias, pool, transcripts))
    }
}

#[async_trait]
impl SpeechBackend for FixtureSpeech {
    fn alias(&self) -> &str {
        &self.alias
    }

    async fn transcribe(&self, audio: &AudioSource) -> anyhow::Result<Option<String>> {
        let transcripts = self.transcripts.clone();
        let fallback = self.fallback.clone();
        let content_id = audio.content_id.clone();

        let text = self
            .pool
            .run(move || transcripts.get(&content_id).cloned().or(fallback))
            .await?;
        match &text {
            Some(text) => debug!(
                backend = %self.alias,
                content.id = %audio.content_id,
                chars = text.len(),
                "Transcription served"
            ),
            None => debug!(
                backend = %self.alias,
                content.id = %audio.content_id,
                "No transcript available, soft-failing"
            ),
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{BackendRouter, BackendSettings};

    fn pool() -> Arc<BlockingPool> {
        Arc::new(BlockingPool::new(2))
    }

    fn audio(content_id: &str) -> AudioSource {
        AudioSource {
            content_id: content_id.to_string(),
            url: format!("https://media.example/{content_id}/audio"),
        }
    }

    #[tokio::test]
    async fn serves_the_mapped_transcript() {
        let speech = FixtureSpeech::with_transcripts(
            "scripted",
            pool(),
            HashMap::from([("c-1".to_string(), "hello world".to_string())]),
        );

        let text = speech.transcribe(&audio("c-1")).await.unwrap();
        assert_eq!(text.as_deref(), Some("hello world"));
        assert!(speech.transcribe(&audio("c-2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fallback_covers_every_content_id() {
        let speech = FixtureSpeech::always("scripted", pool(), "same text");
        assert_eq!(
            speech.transcribe(&audio("anything")).await.unwrap().as_deref(),
            Some("same text")
        );
    }

    #[tokio::test]
    async fn unavailable_backend_always_soft_fails() {
        let speech = FixtureSpeech::unavailable("down", pool());
        assert!(speech.transcribe(&audio("c-1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn loads_transcripts_from_a_json_file() {
        use ulid::Ulid;

        let dir = std::env::temp_dir().join(format!("tldw_test_{}", Ulid::new()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("transcripts.json");
        tokio::fs::write(&path, br#"{"c-1": "from disk"}"#).await.unwrap();

        let speech = FixtureSpeech::from_file("scripted", pool(), &path).await.unwrap();
        assert_eq!(
            speech.transcribe(&audio("c-1")).await.unwrap().as_deref(),
            Some("from disk")
        );
        assert!(speech.transcribe(&audio("c-2")).await.unwrap().is_none());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn routes_as_a_trait_object() {
        let router: BackendRouter<dyn SpeechBackend> = BackendRouter::new(HashMap::from([(
            "scripted".to_string(),
            BackendSettings {
                priority: 50,
                enabled: true,
            },
        )]));
        let backend: Arc<dyn SpeechBackend> =
            Arc::new(FixtureSpeech::always("scripted", pool(), "text"));
        router.register(backend).await.unwrap();

        let selected = router.select_one().await.unwrap();
        assert_eq!(selected.alias, "scripted");
        let text = selected.backend.transcribe(&audio("c-9")).await.unwrap();
        assert_eq!(text.as_deref(), Some("text"));
    }
}
