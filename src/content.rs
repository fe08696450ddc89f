//! Content metadata and the provider seam the pipelines fetch it through.
//!
//! A provider resolves a canonical content id into the material prompts are
//! built from: title, description, tags, sampled comments, and whatever
//! transcript the platform already has. The bundled fixture provider serves
//! metadata from memory or a directory of JSON files, one per content id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::speech::AudioSource;

fn default_parts() -> u32 {
    1
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMetadata {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Sampled viewer comments, fed to the summarize prompt as color.
    #[serde(default)]
    pub comments: Vec<String>,
    /// Part count. Anything above one is rejected before backend work.
    #[serde(default = "default_parts")]
    pub parts: u32,
    /// Platform-provided transcript, when one exists.
    #[serde(default)]
    pub transcript: Option<String>,
    /// Where to pull audio for machine transcription.
    #[serde(default)]
    pub audio_url: Option<String>,
}

impl ContentMetadata {
    pub fn is_multi_part(&self) -> bool {
        self.parts > 1
    }

    /// Tags rendered the way prompts expect them: `#one #two`.
    pub fn tags_line(&self) -> String {
        self.tags
            .iter()
            .map(|tag| format!("#{tag}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn comments_line(&self) -> String {
        self.comments.join("\n")
    }

    pub fn audio_source(&self) -> Option<AudioSource> {
        self.audio_url.as_ref().map(|url| AudioSource {
            content_id: self.id.clone(),
            url: url.clone(),
        })
    }
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn fetch(&self, content_id: &str) -> anyhow::Result<ContentMetadata>;
}

/// Metadata served from memory, optionally seeded from a directory of
/// `<content_id>.json` files.
pub struct FixtureMetadataProvider {
    items: HashMap<String, ContentMetadata>,
    source_dir: Option<PathBuf>,
}

impl FixtureMetadataProvider {
    pub fn with_items(items: Vec<ContentMetadata>) -> Self {
        Self {
            items: items.into_iter().map(|item| (item.id.clone(), item)).collect(),
            source_dir: None,
        }
    }

    /// Load every `*.json` file under `dir`. Files that do not decode are
    /// an error; a directory of fixtures is authored by hand and a broken
    /// one should be noticed, not skipped.
    pub async fn from_dir(dir: &Path) -> anyhow::Result<Self> {
        let mut items = HashMap::new();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("reading metadata fixture dir {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading metadata fixture {}", path.display()))?;
            let item: ContentMetadata = serde_json::from_slice(&bytes)
                .with_context(|| format!("decoding metadata fixture {}", path.display()))?;
            items.insert(item.id.clone(), item);
        }
        debug!(items = items.len(), dir = %dir.display(), "Metadata fixtures loaded");
        Ok(Self {
            items,
            source_dir: Some(dir.to_path_buf()),
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl MetadataProvider for FixtureMetadataProvider {
    async fn fetch(&self, content_id: &str) -> anyhow::Result<ContentMetadata> {
        match self.items.get(content_id) {
            Some(item) => Ok(item.clone()),
            None => match &self.source_dir {
                Some(dir) => anyhow::bail!(
                    "no metadata fixture for content {content_id} under {}",
                    dir.display()
                ),
                None => anyhow::bail!("no metadata fixture for content {content_id}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    pub(crate) fn sample(id: &str) -> ContentMetadata {
        ContentMetadata {
            id: id.to_string(),
            title: format!("Title of {id}"),
            description: "A description".to_string(),
            tags: vec!["science".to_string(), "history".to_string()],
            comments: vec!["great".to_string(), "loved it".to_string()],
            parts: 1,
            transcript: Some("line one\nline two".to_string()),
            audio_url: Some(format!("https://media.example/{id}/audio")),
        }
    }

    #[test]
    fn renders_prompt_lines() {
        let item = sample("c-1");
        assert_eq!(item.tags_line(), "#science #history");
        assert_eq!(item.comments_line(), "great\nloved it");
        assert!(!item.is_multi_part());
    }

    #[test]
    fn audio_source_carries_the_content_id() {
        let audio = sample("c-1").audio_source().unwrap();
        assert_eq!(audio.content_id, "c-1");
        assert!(audio.url.contains("c-1"));
    }

    #[test]
    fn defaults_cover_sparse_metadata_documents() {
        let item: ContentMetadata =
            serde_json::from_str(r#"{"id": "c-2", "title": "Bare"}"#).unwrap();
        assert_eq!(item.parts, 1);
        assert!(item.tags.is_empty());
        assert!(item.transcript.is_none());
        assert!(item.audio_source().is_none());
    }

    #[tokio::test]
    async fn fetches_from_memory_and_errors_on_unknown_ids() {
        let provider = FixtureMetadataProvider::with_items(vec![sample("c-1")]);
        assert_eq!(provider.fetch("c-1").await.unwrap().id, "c-1");
        assert!(provider.fetch("c-9").await.is_err());
    }

    #[tokio::test]
    async fn loads_fixtures_from_a_directory() {
        let dir = std::env::temp_dir().join(format!("tldw_test_{}", Ulid::new()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            dir.join("c-1.json"),
            serde_json::to_vec_pretty(&sample("c-1")).unwrap(),
        )
        .await
        .unwrap();
        tokio::fs::write(dir.join("notes.txt"), b"ignored").await.unwrap();

        let provider = FixtureMetadataProvider::from_dir(&dir).await.unwrap();
        assert_eq!(provider.len(), 1);
        assert_eq!(provider.fetch("c-1").await.unwrap().title, "Title of c-1");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn broken_fixture_files_are_an_error() {
        let dir = std::env::temp_dir().join(format!("tldw_test_{}", Ulid::new()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("bad.json"), b"{ not json").await.unwrap();

        assert!(FixtureMetadataProvider::from_dir(&dir).await.is_err());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
