//! # CRM RAG
//!
//! Multi-tenant retrieval-augmented generation over CRM, ERP, catalog and
//! document data.
//!
//! Source adapters turn tenant records into content items; the ingestion
//! pipeline chunks, embeds, and stores them per organization; the retrieval
//! engine and context assembler bound what reaches the language model; the
//! generation orchestrator makes one grounded model call.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────┐   ┌─────────────┐   ┌──────────┐
//! │ Adapters          │──▶│  Pipeline   │──▶│  SQLite  │
//! │ product/document/ │   │ Chunk+Embed │   │ per-org  │
//! │ ERP/catalog       │   └─────────────┘   └────┬─────┘
//! └───────────────────┘                          │
//!                      ┌─────────────────────────┤
//!                      ▼                         ▼
//!                ┌───────────┐            ┌────────────┐
//!                │ Retrieval │───────────▶│ Generation │
//!                │ + Context │            │  (1 call)  │
//!                └───────────┘            └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! crm-rag init
//! crm-rag sync products acme
//! crm-rag search acme "winter tyres for a compact car"
//! crm-rag ask acme "which roof box fits a Golf?" --customer-email info@novak.si
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, env overrides, validation |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | SQLite knowledge store, memory index, access log |
//! | [`tenant`] | Product and document tables the adapters read |
//! | [`tiers`] | Subscription-tier and user context settings |
//! | [`embedding`] | Embedding provider construction, OpenAI backend |
//! | [`llm`] | Chat-completion client |
//! | [`erp_client`] | HTTP ERP client |
//! | [`ingest`] | Record-by-record batch runner |
//! | [`adapter_product`] | Product adapter |
//! | [`adapter_document`] | Document adapter |
//! | [`adapter_erp`] | ERP adapter |
//! | [`adapter_catalog`] | Multi-language catalog adapter |
//! | [`services`] | Service container |
//!
//! Chunking, retrieval, context assembly and generation live in
//! `crm_rag_core`.

pub mod adapter_catalog;
pub mod adapter_document;
pub mod adapter_erp;
pub mod adapter_product;
pub mod config;
pub mod db;
pub mod embedding;
pub mod erp_client;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod services;
pub mod sqlite_store;
pub mod tenant;
pub mod tiers;
