//! Retrieval engine: tenant-scoped similarity search with cutoffs.
//!
//! The engine embeds the query, builds a [`KnowledgeQuery`] (which cannot
//! exist without an organization id), applies the similarity threshold,
//! and truncates to the requested limit. Similarity scoring itself belongs
//! to the [`KnowledgeStore`] backend.
//!
//! Retrieval never fails outward: an embedding or store error is reported
//! to the [`ErrorSink`] and an empty [`RetrievalResult`] is returned with
//! `degraded` set.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::diagnostics::{ErrorCategory, ErrorSink};
use crate::embedding::EmbeddingProvider;
use crate::models::{Metadata, OrganizationId, RetrievedChunk, SourceType};
use crate::store::{KnowledgeQuery, KnowledgeStore};

/// Retrieval tuning for one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalOptions {
    /// Empty means every source type.
    pub source_types: Vec<SourceType>,
    pub limit: usize,
    /// Results below this similarity are dropped.
    pub similarity_threshold: f64,
    /// Exact-match key/value filters.
    pub metadata_filters: Metadata,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            source_types: Vec::new(),
            limit: 10,
            similarity_threshold: 0.65,
            metadata_filters: Metadata::new(),
        }
    }
}

impl RetrievalOptions {
    pub fn with_source_types(mut self, types: &[SourceType]) -> Self {
        self.source_types = types.to_vec();
        self
    }

    pub fn with_filter(mut self, key: &str, value: impl Into<crate::models::MetaValue>) -> Self {
        self.metadata_filters.insert(key, value);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub chunks: Vec<RetrievedChunk>,
    /// Candidates above the threshold before truncation.
    pub total_found: usize,
    /// Set when a backend error forced an empty result.
    pub degraded: bool,
}

pub struct RetrievalEngine {
    store: Arc<dyn KnowledgeStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    errors: Arc<ErrorSink>,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        errors: Arc<ErrorSink>,
    ) -> Self {
        Self {
            store,
            embedder,
            errors,
        }
    }

    /// Similarity-ranked chunks for `query` within `org`. Never fails.
    pub async fn retrieve(
        &self,
        query: &str,
        org: &OrganizationId,
        options: &RetrievalOptions,
    ) -> RetrievalResult {
        match self.try_retrieve(query, org, options).await {
            Ok(result) => result,
            Err(e) => {
                self.errors.report(ErrorCategory::Retrieval, &format!("{org}: {e:#}"));
                RetrievalResult {
                    degraded: true,
                    ..RetrievalResult::default()
                }
            }
        }
    }

    async fn try_retrieve(
        &self,
        query: &str,
        org: &OrganizationId,
        options: &RetrievalOptions,
    ) -> Result<RetrievalResult> {
        if query.trim().is_empty() || options.limit == 0 {
            return Ok(RetrievalResult::default());
        }

        let embedding = self.embedder.embed(query).await?;
        // Over-fetch so the threshold is applied before the caller's limit.
        let knowledge_query = KnowledgeQuery::for_tenant(org, embedding)
            .source_types(&options.source_types)
            .metadata_filters(options.metadata_filters.clone())
            .limit(options.limit.saturating_mul(4));

        let candidates = self.store.search(&knowledge_query).await?;
        let mut chunks: Vec<RetrievedChunk> = candidates
            .into_iter()
            .filter(|c| c.similarity >= options.similarity_threshold)
            .collect();
        let total_found = chunks.len();
        chunks.truncate(options.limit);

        tracing::debug!(
            organization_id = %org,
            total_found,
            returned = chunks.len(),
            "retrieved knowledge chunks"
        );

        Ok(RetrievalResult {
            chunks,
            total_found,
            degraded: false,
        })
    }
}
