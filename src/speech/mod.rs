//! Transcription backends behind the router.
//!
//! A backend turns a content item's audio into plain text. `Ok(None)` is a
//! soft failure: the pipeline reports it against the backend's alias and
//! asks the router for the next one, so one dead transcriber does not sink
//! the task. Model inference and decoding run through the shared
//! [`crate::worker::BlockingPool`].

pub mod fixture;

use async_trait::async_trait;

use crate::router::RouterBackend;

pub use fixture::FixtureSpeech;

/// Audio handle for one content item, as resolved by the metadata
/// provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioSource {
    pub content_id: String,
    pub url: String,
}

#[async_trait]
pub trait SpeechBackend: Send + Sync {
    fn alias(&self) -> &str;

    /// One-time setup, run by the router on first selection. Loading a
    /// local model belongs here, not in the constructor.
    async fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn transcribe(&self, audio: &AudioSource) -> anyhow::Result<Option<String>>;
}

/// Lets `BackendRouter<dyn SpeechBackend>` drive boxed transcription
/// backends.
#[async_trait]
impl RouterBackend for dyn SpeechBackend {
    fn alias(&self) -> &str {
        SpeechBackend::alias(self)
    }

    async fn prepare(&self) -> anyhow::Result<()> {
        SpeechBackend::prepare(self).await
    }
}
