//! Core data models used throughout the retrieval layer.
//!
//! These types represent the content items, chunks, stored knowledge entries,
//! and retrieval results that flow through the ingestion and query pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RagError;

/// Tenant identifier. Every stored entry belongs to exactly one organization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrganizationId(String);

impl OrganizationId {
    /// Wrap a raw id. Empty or whitespace-only ids are rejected.
    pub fn new(id: impl Into<String>) -> Result<Self, RagError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(RagError::MissingOrganization);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrganizationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OrganizationId {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Origin of a content item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Local CRM catalog product.
    Product,
    /// Uploaded document with previously extracted data.
    Document,
    /// ERP record (product, customer, or order).
    Metakocka,
    /// External multi-language e-commerce catalog entry.
    Magento,
    Other,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Product => "product",
            Self::Document => "document",
            Self::Metakocka => "metakocka",
            Self::Magento => "magento",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "product" => Ok(Self::Product),
            "document" => Ok(Self::Document),
            "metakocka" => Ok(Self::Metakocka),
            "magento" => Ok(Self::Magento),
            "other" => Ok(Self::Other),
            _ => Err(format!("unknown source type: {s}")),
        }
    }
}

/// A single metadata value. The set of kinds is closed on purpose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Render for inclusion in formatted text blocks.
    pub fn display(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => format!("{f:.2}"),
            Self::Text(s) => s.clone(),
            Self::List(items) => items.join(", "),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<Vec<String>> for MetaValue {
    fn from(v: Vec<String>) -> Self {
        Self::List(v)
    }
}

/// Open key-value map attached to content items, chunks, and entries.
///
/// Keys are free-form; `language`, `category`, and `price` are validated by
/// [`Metadata::validate`] because downstream filters depend on their shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, MetaValue>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetaValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(MetaValue::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(MetaValue::as_f64)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetaValue)> {
        self.0.iter()
    }

    /// Copy every key of `other` into `self`, overwriting existing keys.
    pub fn extend_from(&mut self, other: &Metadata) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// True when every filter key is present with an equal value. Numbers
    /// compare by value, so `199` matches a stored `199.0`.
    pub fn matches(&self, filters: &Metadata) -> bool {
        filters.0.iter().all(|(k, want)| match self.0.get(k) {
            Some(have) => match (have.as_f64(), want.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => have == want,
            },
            None => false,
        })
    }

    /// Check the shape of the well-known keys.
    pub fn validate(&self) -> Result<(), RagError> {
        if let Some(v) = self.0.get("language") {
            let ok = v
                .as_str()
                .map(|s| s.len() == 2 && s.chars().all(|c| c.is_ascii_lowercase()))
                .unwrap_or(false);
            if !ok {
                return Err(RagError::InvalidMetadata {
                    key: "language".into(),
                    reason: "expected a two-letter lowercase code".into(),
                });
            }
        }
        if let Some(v) = self.0.get("category") {
            if v.as_str().is_none() {
                return Err(RagError::InvalidMetadata {
                    key: "category".into(),
                    reason: "expected text".into(),
                });
            }
        }
        if let Some(v) = self.0.get("price") {
            match v.as_f64() {
                Some(p) if p.is_finite() && p >= 0.0 => {}
                _ => {
                    return Err(RagError::InvalidMetadata {
                        key: "price".into(),
                        reason: "expected a non-negative number".into(),
                    })
                }
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse stored JSON; malformed input yields an empty map.
    pub fn from_json(json: &str) -> Self {
        serde_json::from_str(json).unwrap_or_default()
    }
}

/// A unit of ingestible knowledge produced by a source adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub title: String,
    pub content: String,
    pub source_type: SourceType,
    /// External identifier, unique per `(source_type, source_id)` within a tenant.
    pub source_id: String,
    pub metadata: Metadata,
}

/// A bounded slice of a content item's text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentChunk {
    pub content: String,
    pub index: usize,
    /// Estimated tokens of `content`, overlap included.
    pub token_count: usize,
    /// Estimated tokens of the text borrowed from the previous chunk.
    pub overlap_with_previous: usize,
    /// Estimated tokens of the text borrowed from the next chunk.
    pub overlap_with_next: usize,
    pub metadata: Metadata,
}

/// A stored, embedded chunk owned by one organization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeEntry {
    pub id: String,
    pub organization_id: OrganizationId,
    pub source_type: SourceType,
    pub source_id: String,
    pub title: String,
    pub chunk_index: usize,
    pub content: String,
    pub token_count: usize,
    /// SHA-256 of `content`.
    pub content_hash: String,
    pub metadata: Metadata,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

impl KnowledgeEntry {
    /// Ranked view of this entry for a query result.
    pub fn to_retrieved(&self, similarity: f64) -> RetrievedChunk {
        RetrievedChunk {
            entry_id: self.id.clone(),
            source_type: self.source_type,
            source_id: self.source_id.clone(),
            title: self.title.clone(),
            chunk_index: self.chunk_index,
            content: self.content.clone(),
            similarity,
            metadata: self.metadata.clone(),
        }
    }
}

/// A ranked, transient view of a knowledge entry returned from a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub entry_id: String,
    pub source_type: SourceType,
    pub source_id: String,
    pub title: String,
    pub chunk_index: usize,
    pub content: String,
    /// Similarity in `[0, 1]`.
    pub similarity: f64,
    pub metadata: Metadata,
}

/// Category of a stored memory, used when grouping memories for compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Facts about a contact or customer.
    Contact,
    /// Emails, calls, meetings.
    Interaction,
    Preference,
    Deal,
    Product,
    Insight,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contact => "contact",
            Self::Interaction => "interaction",
            Self::Preference => "preference",
            Self::Deal => "deal",
            Self::Product => "product",
            Self::Insight => "insight",
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contact" => Ok(Self::Contact),
            "interaction" => Ok(Self::Interaction),
            "preference" => Ok(Self::Preference),
            "deal" => Ok(Self::Deal),
            "product" => Ok(Self::Product),
            "insight" => Ok(Self::Insight),
            _ => Err(format!("unknown memory type: {s}")),
        }
    }
}

/// A memory considered for a context window. Built per request, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryUnit {
    pub id: String,
    pub memory_type: MemoryType,
    pub content: String,
    /// Importance in `[0, 1]`.
    pub importance_score: f64,
    pub created_at: DateTime<Utc>,
    /// Similarity to the query that surfaced this memory.
    pub similarity: f64,
    pub metadata: Metadata,
    /// Set when this unit is the merge of several memories.
    pub compressed: bool,
    /// Ids of the merged memories when `compressed` is set.
    pub original_memory_ids: Vec<String>,
}
