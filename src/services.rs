//! Explicit service container.
//!
//! [`RagServices::init`] builds every long-lived dependency once (pool,
//! stores, providers, clients, resolver) and hands out adapters wired to
//! them. Nothing is held in module-level statics; call
//! [`RagServices::shutdown`] to close the pool.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

use crm_rag_core::cache::{Clock, SystemClock};
use crm_rag_core::context::ContextAssembler;
use crm_rag_core::diagnostics::ErrorSink;
use crm_rag_core::embedding::EmbeddingProvider;
use crm_rag_core::erp::ErpClient;
use crm_rag_core::generation::{GenerationOrchestrator, LlmClient};
use crm_rag_core::language::{KeywordLanguageDetector, KeywordSentimentScorer};
use crm_rag_core::models::{MemoryType, Metadata, OrganizationId};
use crm_rag_core::pipeline::IngestionPipeline;
use crm_rag_core::retrieve::{RetrievalEngine, RetrievalOptions};
use crm_rag_core::store::{MemoryIndex, MemoryRecord};

use crate::adapter_catalog::CatalogAdapter;
use crate::adapter_document::DocumentAdapter;
use crate::adapter_erp::ErpAdapter;
use crate::adapter_product::ProductAdapter;
use crate::config::Config;
use crate::erp_client::HttpErpClient;
use crate::sqlite_store::{SqliteKnowledgeStore, SqliteMemoryIndex};
use crate::tenant::SqliteTenantStore;
use crate::tiers::ConfigTierResolver;
use crate::{db, embedding, llm, migrate};

/// A memory to store through [`RagServices::add_memory`].
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub memory_type: MemoryType,
    pub content: String,
    pub importance_score: f64,
    pub user_id: Option<String>,
    pub shared: bool,
    pub metadata: Metadata,
}

pub struct RagServices {
    pub config: Config,
    pub pool: SqlitePool,
    pub errors: Arc<ErrorSink>,
    pub clock: Arc<dyn Clock>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub knowledge: Arc<SqliteKnowledgeStore>,
    pub memories: Arc<SqliteMemoryIndex>,
    pub tenant: Arc<SqliteTenantStore>,
    pub tiers: Arc<ConfigTierResolver>,
    pub pipeline: Arc<IngestionPipeline>,
    pub retrieval: Arc<RetrievalEngine>,
    pub assembler: ContextAssembler,
    pub orchestrator: GenerationOrchestrator,
    pub erp: Option<Arc<dyn ErpClient>>,
}

impl RagServices {
    /// Connect, migrate, and build providers from `config`.
    ///
    /// A missing credential for an enabled provider fails here.
    pub async fn init(config: &Config) -> Result<Self> {
        let embedder = embedding::create_provider(&config.embedding)?;
        let llm = llm::create_client(&config.llm)?;
        let erp: Option<Arc<dyn ErpClient>> = match HttpErpClient::from_config(&config.erp)? {
            Some(client) => Some(Arc::new(client)),
            None => None,
        };
        let pool = db::connect(config).await?;
        Self::with_parts(config.clone(), pool, embedder, llm, erp, Arc::new(SystemClock)).await
    }

    /// Build from explicit parts. Runs migrations on `pool`.
    pub async fn with_parts(
        config: Config,
        pool: SqlitePool,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn LlmClient>,
        erp: Option<Arc<dyn ErpClient>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        migrate::run_migrations(&pool)
            .await
            .context("running migrations")?;

        let errors = Arc::new(ErrorSink::new());
        let knowledge = Arc::new(SqliteKnowledgeStore::new(pool.clone()));
        let memories = Arc::new(SqliteMemoryIndex::new(pool.clone()));
        let tenant = Arc::new(SqliteTenantStore::new(pool.clone()));
        let tiers = Arc::new(ConfigTierResolver::new(pool.clone(), &config.context, clock.clone()));

        let pipeline = Arc::new(IngestionPipeline::new(
            knowledge.clone(),
            embedder.clone(),
            config.chunking.clone(),
        ));
        let retrieval = Arc::new(RetrievalEngine::new(
            knowledge.clone(),
            embedder.clone(),
            errors.clone(),
        ));
        let assembler = ContextAssembler::new(
            memories.clone(),
            memories.clone(),
            embedder.clone(),
            tiers.clone(),
            errors.clone(),
            clock.clone(),
        );
        let mut orchestrator =
            GenerationOrchestrator::new(retrieval.clone(), llm, errors.clone(), clock.clone());
        if let Some(erp) = &erp {
            orchestrator = orchestrator.with_erp(erp.clone());
        }

        tracing::debug!(
            db = %config.db.path.display(),
            embedding = embedder.model_name(),
            erp = erp.is_some(),
            "services initialized"
        );

        Ok(Self {
            config,
            pool,
            errors,
            clock,
            embedder,
            knowledge,
            memories,
            tenant,
            tiers,
            pipeline,
            retrieval,
            assembler,
            orchestrator,
            erp,
        })
    }

    fn record_delay(&self) -> Duration {
        Duration::from_millis(self.config.sync.record_delay_ms)
    }

    /// Retrieval options seeded from `[retrieval]`.
    pub fn retrieval_options(&self) -> RetrievalOptions {
        RetrievalOptions::default()
            .with_limit(self.config.retrieval.limit)
            .with_threshold(self.config.retrieval.similarity_threshold)
    }

    pub fn product_adapter(&self) -> ProductAdapter {
        ProductAdapter::new(self.tenant.clone(), self.pipeline.clone(), self.record_delay())
    }

    pub fn document_adapter(&self) -> DocumentAdapter {
        DocumentAdapter::new(self.tenant.clone(), self.pipeline.clone(), self.record_delay())
    }

    /// Fails when no `[erp] base_url` is configured.
    pub fn erp_adapter(&self) -> Result<ErpAdapter> {
        let erp = self
            .erp
            .clone()
            .ok_or_else(|| anyhow::anyhow!("ERP integration is not configured. Set [erp] base_url."))?;
        Ok(ErpAdapter::new(erp, self.pipeline.clone(), self.record_delay()))
    }

    pub fn catalog_adapter(&self) -> CatalogAdapter {
        CatalogAdapter::new(
            self.pipeline.clone(),
            self.retrieval.clone(),
            Arc::new(KeywordLanguageDetector::new()),
            Arc::new(KeywordSentimentScorer),
            self.config.catalog.default_language.clone(),
            self.record_delay(),
        )
    }

    /// Embed and store one memory. Returns its id.
    pub async fn add_memory(&self, org: &OrganizationId, memory: NewMemory) -> Result<String> {
        let embedding = self.embedder.embed(&memory.content).await?;
        let record = MemoryRecord {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: org.clone(),
            user_id: memory.user_id,
            shared: memory.shared,
            memory_type: memory.memory_type,
            content: memory.content,
            importance_score: memory.importance_score.clamp(0.0, 1.0),
            created_at: self.clock.now(),
            metadata: memory.metadata,
            embedding,
        };
        self.memories.insert(&record).await?;
        Ok(record.id)
    }

    pub async fn shutdown(self) {
        if self.errors.total() > 0 {
            tracing::info!(suppressed = self.errors.total(), "shutting down with suppressed errors");
        }
        self.pool.close().await;
    }
}
