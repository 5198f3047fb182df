//! Ingestion pipeline: chunk → embed → store.
//!
//! [`IngestionPipeline::ingest_content`] turns one [`ContentItem`] into
//! [`KnowledgeEntry`] rows for a tenant. Re-ingesting the same
//! `(source_type, source_id)` either skips (when `skip_if_exists` is set and
//! entries already exist) or replaces every previous entry for that source
//! in a single store call, so a source never holds stale and fresh chunks at
//! the same time.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::chunk::{ChunkConfig, Chunker};
use crate::embedding::EmbeddingProvider;
use crate::models::{ContentItem, KnowledgeEntry, OrganizationId};
use crate::store::KnowledgeStore;

/// Per-call ingestion options shared by every adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestOptions {
    /// Leave an already-ingested source untouched.
    pub skip_if_exists: bool,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
}

impl IngestOptions {
    pub fn forced() -> Self {
        Self::default()
    }

    pub fn skip_existing() -> Self {
        Self {
            skip_if_exists: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    Created { chunks: usize },
    Updated { chunks: usize, replaced: usize },
    Skipped,
}

pub struct IngestionPipeline {
    store: Arc<dyn KnowledgeStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunk_config: ChunkConfig,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        chunk_config: ChunkConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            chunk_config,
        }
    }

    pub fn store(&self) -> &Arc<dyn KnowledgeStore> {
        &self.store
    }

    /// Chunk, embed, and store one content item for `org`.
    ///
    /// Empty content and invalid metadata fail before anything is written.
    pub async fn ingest_content(
        &self,
        org: &OrganizationId,
        item: &ContentItem,
        options: &IngestOptions,
    ) -> Result<IngestOutcome> {
        item.metadata.validate()?;

        if options.skip_if_exists
            && self
                .store
                .has_source(org, item.source_type, &item.source_id)
                .await?
        {
            tracing::debug!(
                organization_id = %org,
                source_type = %item.source_type,
                source_id = %item.source_id,
                "source already ingested, skipping"
            );
            return Ok(IngestOutcome::Skipped);
        }

        let config = self
            .chunk_config
            .clone()
            .with_overrides(options.chunk_size, options.chunk_overlap);
        let chunker = Chunker::new(config)?;
        let chunks = chunker.chunk_with_metadata(&item.content, &item.metadata)?;

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self
            .embedder
            .embed_batch(&texts)
            .await
            .with_context(|| format!("embedding {} chunks of {}", texts.len(), item.source_id))?;
        if vectors.len() != chunks.len() {
            bail!(
                "embedding provider returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            );
        }

        let now = Utc::now();
        let entries: Vec<KnowledgeEntry> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, embedding)| KnowledgeEntry {
                id: uuid::Uuid::new_v4().to_string(),
                organization_id: org.clone(),
                source_type: item.source_type,
                source_id: item.source_id.clone(),
                title: item.title.clone(),
                chunk_index: chunk.index,
                content_hash: format!("{:x}", Sha256::digest(chunk.content.as_bytes())),
                token_count: chunk.token_count,
                content: chunk.content,
                metadata: chunk.metadata,
                embedding,
                created_at: now,
            })
            .collect();

        let stored = entries.len();
        let replaced = self
            .store
            .replace_source(org, item.source_type, &item.source_id, &entries)
            .await?;

        tracing::info!(
            organization_id = %org,
            source_type = %item.source_type,
            source_id = %item.source_id,
            chunks = stored,
            replaced,
            "ingested content"
        );

        Ok(if replaced == 0 {
            IngestOutcome::Created { chunks: stored }
        } else {
            IngestOutcome::Updated {
                chunks: stored,
                replaced,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::models::{Metadata, SourceType};
    use crate::store::memory::InMemoryKnowledgeStore;
    use crate::RagError;

    fn setup() -> (Arc<InMemoryKnowledgeStore>, IngestionPipeline) {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let pipeline = IngestionPipeline::new(
            store.clone(),
            Arc::new(HashingEmbedder::default()),
            ChunkConfig::default(),
        );
        (store, pipeline)
    }

    fn item(content: &str) -> ContentItem {
        ContentItem {
            title: "Roof box".into(),
            content: content.into(),
            source_type: SourceType::Product,
            source_id: "sku-1".into(),
            metadata: Metadata::new().with("language", "en"),
        }
    }

    #[tokio::test]
    async fn skip_if_exists_does_not_duplicate() {
        let (store, pipeline) = setup();
        let org = OrganizationId::new("org-1").unwrap();
        let opts = IngestOptions::skip_existing();

        let first = pipeline.ingest_content(&org, &item("A sturdy roof box."), &opts).await.unwrap();
        assert_eq!(first, IngestOutcome::Created { chunks: 1 });
        let second = pipeline.ingest_content(&org, &item("A sturdy roof box."), &opts).await.unwrap();
        assert_eq!(second, IngestOutcome::Skipped);
        assert_eq!(store.count(&org).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn forced_update_keeps_latest_only() {
        let (store, pipeline) = setup();
        let org = OrganizationId::new("org-1").unwrap();
        let opts = IngestOptions::forced();

        pipeline.ingest_content(&org, &item("Old description."), &opts).await.unwrap();
        let outcome = pipeline.ingest_content(&org, &item("New description."), &opts).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Updated { chunks: 1, replaced: 1 });

        let entries = store.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "New description.");
        assert_eq!(entries[0].content_hash.len(), 64);
    }

    #[tokio::test]
    async fn empty_content_propagates() {
        let (store, pipeline) = setup();
        let org = OrganizationId::new("org-1").unwrap();
        let err = pipeline
            .ingest_content(&org, &item("   "), &IngestOptions::forced())
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<RagError>(), Some(RagError::EmptyContent)));
        assert_eq!(store.count(&org).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn oversized_chunk_override_keeps_existing_entries() {
        let (store, pipeline) = setup();
        let org = OrganizationId::new("org-1").unwrap();
        let long = "Roof box mounting notes for compact cars and estates. ".repeat(400);

        pipeline.ingest_content(&org, &item(&long), &IngestOptions::forced()).await.unwrap();
        let before = store.count(&org).await.unwrap();
        assert!(before > 1);

        let opts = IngestOptions {
            chunk_size: Some(3000),
            ..IngestOptions::forced()
        };
        let err = pipeline.ingest_content(&org, &item(&long), &opts).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<RagError>(), Some(RagError::InvalidConfig(_))));
        assert_eq!(store.count(&org).await.unwrap(), before);
    }

    #[tokio::test]
    async fn invalid_metadata_is_rejected() {
        let (_, pipeline) = setup();
        let org = OrganizationId::new("org-1").unwrap();
        let mut bad = item("Some text.");
        bad.metadata.insert("price", -5.0);
        assert!(pipeline
            .ingest_content(&org, &bad, &IngestOptions::forced())
            .await
            .is_err());
    }
}
