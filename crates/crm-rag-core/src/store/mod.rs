//! Storage abstractions for the knowledge base and the memory index.
//!
//! The [`KnowledgeStore`] trait covers every operation the ingestion
//! pipeline, retrieval engine, and adapters need on embedded chunks. The
//! [`MemoryIndex`] and [`AccessRecorder`] traits back the context
//! assembler. All of them are tenant-scoped: every method takes an
//! [`OrganizationId`], and the query types cannot be built without one.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{KnowledgeEntry, MemoryType, MemoryUnit, Metadata, OrganizationId, RetrievedChunk, SourceType};

/// A tenant-scoped similarity query against a [`KnowledgeStore`].
///
/// Fields are private so the organization scope can never be omitted.
#[derive(Debug, Clone)]
pub struct KnowledgeQuery {
    organization_id: OrganizationId,
    embedding: Vec<f32>,
    source_types: Vec<SourceType>,
    metadata_filters: Metadata,
    limit: usize,
}

impl KnowledgeQuery {
    pub fn for_tenant(organization_id: &OrganizationId, embedding: Vec<f32>) -> Self {
        Self {
            organization_id: organization_id.clone(),
            embedding,
            source_types: Vec::new(),
            metadata_filters: Metadata::new(),
            limit: 10,
        }
    }

    /// Restrict to these source types. Empty means all.
    pub fn source_types(mut self, types: &[SourceType]) -> Self {
        self.source_types = types.to_vec();
        self
    }

    /// Exact-match metadata filters.
    pub fn metadata_filters(mut self, filters: Metadata) -> Self {
        self.metadata_filters = filters;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn organization_id(&self) -> &OrganizationId {
        &self.organization_id
    }

    pub fn embedding(&self) -> &[f32] {
        &self.embedding
    }

    pub fn get_source_types(&self) -> &[SourceType] {
        &self.source_types
    }

    pub fn get_metadata_filters(&self) -> &Metadata {
        &self.metadata_filters
    }

    pub fn get_limit(&self) -> usize {
        self.limit
    }

    /// Whether `entry` is inside this query's tenant, type and metadata scope.
    pub fn admits(&self, entry: &KnowledgeEntry) -> bool {
        entry.organization_id == self.organization_id
            && (self.source_types.is_empty() || self.source_types.contains(&entry.source_type))
            && entry.metadata.matches(&self.metadata_filters)
    }
}

/// Abstract knowledge-base backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`has_source`](KnowledgeStore::has_source) | Any entry stored for a source? |
/// | [`replace_source`](KnowledgeStore::replace_source) | Atomically swap a source's entries |
/// | [`search`](KnowledgeStore::search) | Cosine similarity search, best first |
/// | [`delete_source`](KnowledgeStore::delete_source) | Remove one source's entries |
/// | [`delete_older_than`](KnowledgeStore::delete_older_than) | Age-based eviction |
/// | [`count`](KnowledgeStore::count) | Entries held for a tenant |
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn has_source(
        &self,
        org: &OrganizationId,
        source_type: SourceType,
        source_id: &str,
    ) -> Result<bool>;

    /// Delete every entry for `(org, source_type, source_id)` and insert
    /// `entries` in one step. Returns the number of entries removed.
    async fn replace_source(
        &self,
        org: &OrganizationId,
        source_type: SourceType,
        source_id: &str,
        entries: &[KnowledgeEntry],
    ) -> Result<usize>;

    /// Return entries admitted by `query`, sorted by descending similarity
    /// (clamped to `[0, 1]`), at most `query.get_limit()` of them.
    async fn search(&self, query: &KnowledgeQuery) -> Result<Vec<RetrievedChunk>>;

    async fn delete_source(
        &self,
        org: &OrganizationId,
        source_type: SourceType,
        source_id: &str,
    ) -> Result<usize>;

    /// Delete entries created before `cutoff`, optionally only of one type.
    async fn delete_older_than(
        &self,
        org: &OrganizationId,
        source_type: Option<SourceType>,
        cutoff: DateTime<Utc>,
    ) -> Result<usize>;

    async fn count(&self, org: &OrganizationId) -> Result<usize>;
}

/// A stored memory as held by a [`MemoryIndex`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryRecord {
    pub id: String,
    pub organization_id: OrganizationId,
    /// Owner; `None` means organization-wide.
    pub user_id: Option<String>,
    /// Visible to every user of the organization.
    pub shared: bool,
    pub memory_type: MemoryType,
    pub content: String,
    pub importance_score: f64,
    pub created_at: DateTime<Utc>,
    pub metadata: Metadata,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

impl MemoryRecord {
    pub fn visible_to(&self, user_id: Option<&str>) -> bool {
        match user_id {
            None => true,
            Some(u) => self.shared || self.user_id.is_none() || self.user_id.as_deref() == Some(u),
        }
    }

    pub fn to_unit(&self, similarity: f64) -> MemoryUnit {
        MemoryUnit {
            id: self.id.clone(),
            memory_type: self.memory_type,
            content: self.content.clone(),
            importance_score: self.importance_score,
            created_at: self.created_at,
            similarity,
            metadata: self.metadata.clone(),
            compressed: false,
            original_memory_ids: Vec::new(),
        }
    }
}

/// A tenant-scoped similarity query against a [`MemoryIndex`].
#[derive(Debug, Clone)]
pub struct MemoryQuery {
    organization_id: OrganizationId,
    embedding: Vec<f32>,
    pub user_id: Option<String>,
    pub min_similarity: f64,
    pub limit: usize,
    /// Only memories created at or after this instant.
    pub created_after: Option<DateTime<Utc>>,
}

impl MemoryQuery {
    pub fn for_tenant(organization_id: &OrganizationId, embedding: Vec<f32>) -> Self {
        Self {
            organization_id: organization_id.clone(),
            embedding,
            user_id: None,
            min_similarity: 0.0,
            limit: 50,
            created_after: None,
        }
    }

    pub fn organization_id(&self) -> &OrganizationId {
        &self.organization_id
    }

    pub fn embedding(&self) -> &[f32] {
        &self.embedding
    }

    pub fn admits(&self, record: &MemoryRecord) -> bool {
        record.organization_id == self.organization_id
            && record.visible_to(self.user_id.as_deref())
            && self.created_after.map_or(true, |t| record.created_at >= t)
    }
}

#[async_trait]
pub trait MemoryIndex: Send + Sync {
    /// Memories admitted by `query` with similarity ≥ `min_similarity`,
    /// best first, at most `limit`.
    async fn search(&self, query: &MemoryQuery) -> Result<Vec<MemoryUnit>>;

    async fn insert(&self, record: &MemoryRecord) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Retrieve,
}

impl AccessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retrieve => "retrieve",
        }
    }
}

/// One "memory was used" bookkeeping row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessRecord {
    pub memory_id: String,
    pub organization_id: OrganizationId,
    pub access_type: AccessType,
    pub user_id: Option<String>,
    /// Free-form context, typically the query.
    pub context: Option<String>,
    pub accessed_at: DateTime<Utc>,
}

/// Sink for memory access bookkeeping.
#[async_trait]
pub trait AccessRecorder: Send + Sync {
    async fn record_access(&self, record: &AccessRecord) -> Result<()>;
}
