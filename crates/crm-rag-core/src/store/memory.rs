//! In-memory store implementations for testing and WASM targets.
//!
//! Uses `Vec` behind `std::sync::RwLock` for thread safety. Vector search
//! is brute-force cosine similarity over all stored vectors.

use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::embedding::cosine_similarity;
use crate::models::{KnowledgeEntry, MemoryUnit, OrganizationId, RetrievedChunk, SourceType};

use super::{
    AccessRecord, AccessRecorder, KnowledgeQuery, KnowledgeStore, MemoryIndex, MemoryQuery,
    MemoryRecord,
};

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

fn clamp_similarity(sim: f32) -> f64 {
    (sim as f64).clamp(0.0, 1.0)
}

/// In-memory [`KnowledgeStore`].
#[derive(Default)]
pub struct InMemoryKnowledgeStore {
    entries: RwLock<Vec<KnowledgeEntry>>,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored entry, across tenants.
    pub fn entries(&self) -> Vec<KnowledgeEntry> {
        self.entries.read().map(|e| e.clone()).unwrap_or_default()
    }
}

fn same_source(e: &KnowledgeEntry, org: &OrganizationId, st: SourceType, sid: &str) -> bool {
    &e.organization_id == org && e.source_type == st && e.source_id == sid
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn has_source(
        &self,
        org: &OrganizationId,
        source_type: SourceType,
        source_id: &str,
    ) -> Result<bool> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.iter().any(|e| same_source(e, org, source_type, source_id)))
    }

    async fn replace_source(
        &self,
        org: &OrganizationId,
        source_type: SourceType,
        source_id: &str,
        new_entries: &[KnowledgeEntry],
    ) -> Result<usize> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        let before = entries.len();
        entries.retain(|e| !same_source(e, org, source_type, source_id));
        let removed = before - entries.len();
        entries.extend(new_entries.iter().cloned());
        Ok(removed)
    }

    async fn search(&self, query: &KnowledgeQuery) -> Result<Vec<RetrievedChunk>> {
        let entries = self.entries.read().map_err(poisoned)?;
        let mut results: Vec<RetrievedChunk> = entries
            .iter()
            .filter(|e| query.admits(e))
            .map(|e| {
                let sim = clamp_similarity(cosine_similarity(query.embedding(), &e.embedding));
                e.to_retrieved(sim)
            })
            .collect();
        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(query.get_limit());
        Ok(results)
    }

    async fn delete_source(
        &self,
        org: &OrganizationId,
        source_type: SourceType,
        source_id: &str,
    ) -> Result<usize> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        let before = entries.len();
        entries.retain(|e| !same_source(e, org, source_type, source_id));
        Ok(before - entries.len())
    }

    async fn delete_older_than(
        &self,
        org: &OrganizationId,
        source_type: Option<SourceType>,
        cutoff: DateTime<Utc>,
    ) -> Result<usize> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        let before = entries.len();
        entries.retain(|e| {
            let stale = &e.organization_id == org
                && source_type.map_or(true, |st| e.source_type == st)
                && e.created_at < cutoff;
            !stale
        });
        Ok(before - entries.len())
    }

    async fn count(&self, org: &OrganizationId) -> Result<usize> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.iter().filter(|e| &e.organization_id == org).count())
    }
}

/// In-memory [`MemoryIndex`] and [`AccessRecorder`].
#[derive(Default)]
pub struct InMemoryMemoryIndex {
    records: RwLock<Vec<MemoryRecord>>,
    accesses: RwLock<Vec<AccessRecord>>,
}

impl InMemoryMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Access rows recorded so far.
    pub fn accesses(&self) -> Vec<AccessRecord> {
        self.accesses.read().map(|a| a.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl MemoryIndex for InMemoryMemoryIndex {
    async fn search(&self, query: &MemoryQuery) -> Result<Vec<MemoryUnit>> {
        let records = self.records.read().map_err(poisoned)?;
        let mut units: Vec<MemoryUnit> = records
            .iter()
            .filter(|r| query.admits(r))
            .filter_map(|r| {
                let sim = clamp_similarity(cosine_similarity(query.embedding(), &r.embedding));
                (sim >= query.min_similarity).then(|| r.to_unit(sim))
            })
            .collect();
        units.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        units.truncate(query.limit);
        Ok(units)
    }

    async fn insert(&self, record: &MemoryRecord) -> Result<()> {
        let mut records = self.records.write().map_err(poisoned)?;
        records.retain(|r| r.id != record.id);
        records.push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl AccessRecorder for InMemoryMemoryIndex {
    async fn record_access(&self, record: &AccessRecord) -> Result<()> {
        self.accesses.write().map_err(poisoned)?.push(record.clone());
        Ok(())
    }
}
