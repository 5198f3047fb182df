//! # CRM RAG Core
//!
//! Shared, WASM-safe logic for the CRM retrieval layer: content models,
//! chunking, knowledge-store and memory-index abstractions, retrieval,
//! context assembly, and generation orchestration.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! native-only dependencies. Every external collaborator (vector store,
//! embedding API, language model, ERP integration) is reached through a
//! trait defined here and implemented by the `crm-rag` application crate.
//!
//! ## Data Flow
//!
//! ```text
//! ContentItem ──▶ chunk ──▶ pipeline (embed + replace_source) ──▶ KnowledgeStore
//!                                                                     │
//!            query ──▶ retrieve (tenant-scoped) ◀─────────────────────┘
//!                          │
//!                          ├──▶ context (prioritize → compress → fit)
//!                          ▼
//!                      generation ──▶ LlmClient
//! ```

pub mod cache;
pub mod chunk;
pub mod context;
pub mod diagnostics;
pub mod embedding;
pub mod erp;
pub mod error;
pub mod generation;
pub mod language;
pub mod models;
pub mod pipeline;
pub mod retrieve;
pub mod store;
pub mod tokens;

pub use error::RagError;
pub use models::{ContentItem, Metadata, MetaValue, OrganizationId, SourceType};
