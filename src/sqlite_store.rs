//! SQLite-backed [`KnowledgeStore`], [`MemoryIndex`] and [`AccessRecorder`].
//!
//! Vectors are stored as little-endian `f32` blobs next to each row.
//! Similarity search loads the tenant's candidate rows (narrowed by source
//! type in SQL), scores them with cosine similarity in Rust, applies the
//! metadata filters, and keeps the best `limit`. This brute-force scan is
//! fine for per-tenant corpora of a few hundred thousand chunks.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crm_rag_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crm_rag_core::models::{
    KnowledgeEntry, MemoryType, MemoryUnit, Metadata, OrganizationId, RetrievedChunk, SourceType,
};
use crm_rag_core::store::{
    AccessRecord, AccessRecorder, KnowledgeQuery, KnowledgeStore, MemoryIndex, MemoryQuery,
    MemoryRecord,
};

pub(crate) fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Knowledge-base entries in the `knowledge_entries` table.
#[derive(Clone)]
pub struct SqliteKnowledgeStore {
    pool: SqlitePool,
}

impl SqliteKnowledgeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_entry(row: &SqliteRow) -> Result<KnowledgeEntry> {
    let org: String = row.get("organization_id");
    let source_type: String = row.get("source_type");
    let metadata_json: String = row.get("metadata_json");
    let blob: Vec<u8> = row.get("embedding");
    let chunk_index: i64 = row.get("chunk_index");
    let token_count: i64 = row.get("token_count");

    Ok(KnowledgeEntry {
        id: row.get("id"),
        organization_id: OrganizationId::new(org)?,
        source_type: source_type.parse().map_err(anyhow::Error::msg)?,
        source_id: row.get("source_id"),
        title: row.get("title"),
        chunk_index: chunk_index as usize,
        content: row.get("content"),
        token_count: token_count as usize,
        content_hash: row.get("content_hash"),
        metadata: Metadata::from_json(&metadata_json),
        embedding: blob_to_vec(&blob),
        created_at: ts_to_datetime(row.get("created_at")),
    })
}

#[async_trait]
impl KnowledgeStore for SqliteKnowledgeStore {
    async fn has_source(
        &self,
        org: &OrganizationId,
        source_type: SourceType,
        source_id: &str,
    ) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM knowledge_entries WHERE organization_id = ? AND source_type = ? AND source_id = ? LIMIT 1",
        )
        .bind(org.as_str())
        .bind(source_type.as_str())
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn replace_source(
        &self,
        org: &OrganizationId,
        source_type: SourceType,
        source_id: &str,
        entries: &[KnowledgeEntry],
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query(
            "DELETE FROM knowledge_entries WHERE organization_id = ? AND source_type = ? AND source_id = ?",
        )
        .bind(org.as_str())
        .bind(source_type.as_str())
        .bind(source_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO knowledge_entries (id, organization_id, source_type, source_id, title,
                                               chunk_index, content, token_count, content_hash,
                                               metadata_json, embedding, dims, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry.id)
            .bind(entry.organization_id.as_str())
            .bind(entry.source_type.as_str())
            .bind(&entry.source_id)
            .bind(&entry.title)
            .bind(entry.chunk_index as i64)
            .bind(&entry.content)
            .bind(entry.token_count as i64)
            .bind(&entry.content_hash)
            .bind(entry.metadata.to_json())
            .bind(vec_to_blob(&entry.embedding))
            .bind(entry.embedding.len() as i64)
            .bind(entry.created_at.timestamp())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(removed as usize)
    }

    async fn search(&self, query: &KnowledgeQuery) -> Result<Vec<RetrievedChunk>> {
        let types = query.get_source_types();
        let mut sql = String::from("SELECT * FROM knowledge_entries WHERE organization_id = ?");
        if !types.is_empty() {
            sql.push_str(&format!(" AND source_type IN ({})", placeholders(types.len())));
        }

        let mut q = sqlx::query(&sql).bind(query.organization_id().as_str());
        for t in types {
            q = q.bind(t.as_str());
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut scored: Vec<RetrievedChunk> = Vec::new();
        for row in &rows {
            let entry = row_to_entry(row)?;
            if !query.admits(&entry) {
                continue;
            }
            let sim = cosine_similarity(query.embedding(), &entry.embedding).clamp(0.0, 1.0);
            scored.push(entry.to_retrieved(sim as f64));
        }

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(query.get_limit());
        Ok(scored)
    }

    async fn delete_source(
        &self,
        org: &OrganizationId,
        source_type: SourceType,
        source_id: &str,
    ) -> Result<usize> {
        let result = sqlx::query(
            "DELETE FROM knowledge_entries WHERE organization_id = ? AND source_type = ? AND source_id = ?",
        )
        .bind(org.as_str())
        .bind(source_type.as_str())
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn delete_older_than(
        &self,
        org: &OrganizationId,
        source_type: Option<SourceType>,
        cutoff: DateTime<Utc>,
    ) -> Result<usize> {
        let result = match source_type {
            Some(st) => {
                sqlx::query(
                    "DELETE FROM knowledge_entries WHERE organization_id = ? AND source_type = ? AND created_at < ?",
                )
                .bind(org.as_str())
                .bind(st.as_str())
                .bind(cutoff.timestamp())
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "DELETE FROM knowledge_entries WHERE organization_id = ? AND created_at < ?",
                )
                .bind(org.as_str())
                .bind(cutoff.timestamp())
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() as usize)
    }

    async fn count(&self, org: &OrganizationId) -> Result<usize> {
        let n: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM knowledge_entries WHERE organization_id = ?")
                .bind(org.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(n as usize)
    }
}

/// CRM memories in the `memories` table, with access rows in
/// `memory_access_log`.
#[derive(Clone)]
pub struct SqliteMemoryIndex {
    pool: SqlitePool,
}

impl SqliteMemoryIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Number of access rows logged for one memory.
    pub async fn access_count(&self, memory_id: &str) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM memory_access_log WHERE memory_id = ?")
            .bind(memory_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }
}

fn row_to_memory(row: &SqliteRow) -> Result<MemoryRecord> {
    let org: String = row.get("organization_id");
    let memory_type: String = row.get("memory_type");
    let metadata_json: String = row.get("metadata_json");
    let blob: Vec<u8> = row.get("embedding");
    let shared: i64 = row.get("shared");

    Ok(MemoryRecord {
        id: row.get("id"),
        organization_id: OrganizationId::new(org)?,
        user_id: row.get("user_id"),
        shared: shared != 0,
        memory_type: memory_type.parse::<MemoryType>().map_err(anyhow::Error::msg)?,
        content: row.get("content"),
        importance_score: row.get("importance_score"),
        created_at: ts_to_datetime(row.get("created_at")),
        metadata: Metadata::from_json(&metadata_json),
        embedding: blob_to_vec(&blob),
    })
}

#[async_trait]
impl MemoryIndex for SqliteMemoryIndex {
    async fn search(&self, query: &MemoryQuery) -> Result<Vec<MemoryUnit>> {
        let rows = match query.created_after {
            Some(after) => {
                sqlx::query("SELECT * FROM memories WHERE organization_id = ? AND created_at >= ?")
                    .bind(query.organization_id().as_str())
                    .bind(after.timestamp())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM memories WHERE organization_id = ?")
                    .bind(query.organization_id().as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut units = Vec::new();
        for row in &rows {
            let record = row_to_memory(row)?;
            if !query.admits(&record) {
                continue;
            }
            let sim = cosine_similarity(query.embedding(), &record.embedding).clamp(0.0, 1.0) as f64;
            if sim >= query.min_similarity {
                units.push(record.to_unit(sim));
            }
        }

        units.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        units.truncate(query.limit);
        Ok(units)
    }

    async fn insert(&self, record: &MemoryRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO memories (id, organization_id, user_id, shared, memory_type, content,
                                  importance_score, metadata_json, embedding, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                importance_score = excluded.importance_score,
                metadata_json = excluded.metadata_json,
                embedding = excluded.embedding
            "#,
        )
        .bind(&record.id)
        .bind(record.organization_id.as_str())
        .bind(&record.user_id)
        .bind(record.shared as i64)
        .bind(record.memory_type.as_str())
        .bind(&record.content)
        .bind(record.importance_score)
        .bind(record.metadata.to_json())
        .bind(vec_to_blob(&record.embedding))
        .bind(record.created_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AccessRecorder for SqliteMemoryIndex {
    async fn record_access(&self, record: &AccessRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO memory_access_log (memory_id, organization_id, access_type, user_id, context, accessed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.memory_id)
        .bind(record.organization_id.as_str())
        .bind(record.access_type.as_str())
        .bind(&record.user_id)
        .bind(&record.context)
        .bind(record.accessed_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
