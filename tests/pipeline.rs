use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

use crm_rag::adapter_catalog::CatalogProduct;
use crm_rag::config::Config;
use crm_rag::db;
use crm_rag::services::{NewMemory, RagServices};
use crm_rag::tenant::{PriceRow, ProcessingStatus, TenantDocument, TenantProduct, TenantStore};
use crm_rag_core::cache::ManualClock;
use crm_rag_core::context::ContextOverrides;
use crm_rag_core::diagnostics::ErrorCategory;
use crm_rag_core::embedding::{DisabledEmbedder, EmbeddingProvider, HashingEmbedder};
use crm_rag_core::erp::{
    ErpClient, ErpContext, ErpCustomer, ErpOrder, ErpRecord, ErpRecordKind, ShippingStatus,
};
use crm_rag_core::generation::{ChatRequest, LlmClient};
use crm_rag_core::models::{MemoryType, Metadata, OrganizationId, SourceType};
use crm_rag_core::pipeline::{IngestOptions, IngestOutcome};
use crm_rag_core::store::KnowledgeStore;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
}

struct ScriptedLlm {
    reply: Option<String>,
    seen: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLlm {
    fn answering(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(reply.to_string()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            reply: None,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn last_prompt(&self) -> String {
        self.seen.lock().unwrap().last().map(|r| r.user.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        self.seen.lock().unwrap().push(request.clone());
        match &self.reply {
            Some(r) => Ok(r.clone()),
            None => bail!("model unavailable"),
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

struct FakeErp {
    customer: ErpCustomer,
    orders: Vec<ErpOrder>,
}

#[async_trait]
impl ErpClient for FakeErp {
    async fn get_ai_context(&self, _org: &OrganizationId) -> Result<ErpContext> {
        Ok(ErpContext {
            customers: vec![self.customer.clone()],
            orders: self.orders.clone(),
            ..ErpContext::default()
        })
    }

    async fn get_record(&self, _org: &OrganizationId, kind: ErpRecordKind, id: &str) -> Result<Option<ErpRecord>> {
        Ok(match kind {
            ErpRecordKind::Customer if id == self.customer.id => Some(ErpRecord::Customer(self.customer.clone())),
            _ => None,
        })
    }

    async fn get_customer_by_email(&self, _org: &OrganizationId, email: &str) -> Result<Option<ErpCustomer>> {
        Ok((self.customer.email.as_deref() == Some(email)).then(|| self.customer.clone()))
    }

    async fn get_recent_orders(&self, _org: &OrganizationId, _customer_id: &str, limit: usize) -> Result<Vec<ErpOrder>> {
        Ok(self.orders.iter().take(limit).cloned().collect())
    }

    async fn get_shipping_status(&self, _org: &OrganizationId, order_id: &str) -> Result<Option<ShippingStatus>> {
        Ok(Some(ShippingStatus {
            order_id: order_id.to_string(),
            status: "in transit".into(),
            carrier: Some("GLS".into()),
            tracking_number: None,
            estimated_delivery: None,
        }))
    }
}

fn novak_erp() -> Arc<FakeErp> {
    Arc::new(FakeErp {
        customer: ErpCustomer {
            id: "c-1".into(),
            name: "Novak d.o.o.".into(),
            email: Some("info@novak.si".into()),
            ..ErpCustomer::default()
        },
        orders: vec![ErpOrder {
            id: "o-1".into(),
            number: "2024-0042".into(),
            total: 249.0,
            order_date: Some(start() - Duration::days(5)),
            ..ErpOrder::default()
        }],
    })
}

fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::default();
    config.db.path = tmp.path().join("data/crm-rag.sqlite");
    config.sync.record_delay_ms = 0;
    config.retrieval.similarity_threshold = 0.05;
    config.context.tiers.insert(
        "starter".to_string(),
        ContextOverrides {
            max_context_size: Some(40),
            ..ContextOverrides::default()
        },
    );
    config
}

async fn setup_with(
    tmp: &TempDir,
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Arc<dyn LlmClient>,
    erp: Option<Arc<dyn ErpClient>>,
) -> RagServices {
    let config = test_config(tmp);
    let pool = db::connect(&config).await.unwrap();
    RagServices::with_parts(config, pool, embedder, llm, erp, Arc::new(ManualClock::new(start())))
        .await
        .unwrap()
}

async fn setup(tmp: &TempDir, llm: Arc<dyn LlmClient>) -> RagServices {
    setup_with(tmp, Arc::new(HashingEmbedder::default()), llm, Some(novak_erp())).await
}

fn product(id: &str, name: &str, category: &str, description: &str, price: f64) -> TenantProduct {
    TenantProduct {
        id: id.into(),
        name: name.into(),
        sku: Some(format!("SKU-{id}")),
        category: Some(category.into()),
        description: Some(description.into()),
        unit: Some("pcs".into()),
        metadata: Metadata::new(),
        prices: vec![PriceRow {
            price,
            currency: "EUR".into(),
        }],
        suppliers: Vec::new(),
        erp: None,
        updated_at: start(),
    }
}

async fn seed_products(services: &RagServices, org: &OrganizationId) {
    for p in [
        product("p1", "Roof box 420L", "Roof boxes", "Aerodynamic roof box for compact cars like the Golf.", 249.0),
        product("p2", "Winter tyre 205/55 R16", "Tyres", "Studless winter tyre with strong grip on snow.", 89.0),
        product("p3", "Bike carrier", "Carriers", "Tow bar bike carrier for three bikes.", 329.0),
    ] {
        services.tenant.upsert_product(org, &p).await.unwrap();
    }
}

#[tokio::test]
async fn product_sync_then_search() {
    let tmp = TempDir::new().unwrap();
    let services = setup(&tmp, ScriptedLlm::failing()).await;
    let org = OrganizationId::new("acme").unwrap();
    seed_products(&services, &org).await;

    let report = services
        .product_adapter()
        .sync_all(&org, &IngestOptions::forced())
        .await
        .unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(report.successful, 3);
    assert_eq!(report.failed, 0);

    let result = services
        .retrieval
        .retrieve("roof box for a Golf", &org, &services.retrieval_options())
        .await;
    assert!(!result.degraded);
    assert_eq!(result.chunks[0].source_id, "p1");
    assert_eq!(result.chunks[0].source_type, SourceType::Product);
    assert!(result.chunks.windows(2).all(|w| w[0].similarity >= w[1].similarity));

    let filtered = services
        .retrieval
        .retrieve(
            "roof box for a Golf",
            &org,
            &services.retrieval_options().with_filter("category", "Tyres"),
        )
        .await;
    assert!(filtered.chunks.iter().all(|c| c.source_id == "p2"));

    services.shutdown().await;
}

#[tokio::test]
async fn organizations_never_see_each_other() {
    let tmp = TempDir::new().unwrap();
    let services = setup(&tmp, ScriptedLlm::failing()).await;
    let acme = OrganizationId::new("acme").unwrap();
    let globex = OrganizationId::new("globex").unwrap();
    seed_products(&services, &acme).await;
    services
        .product_adapter()
        .sync_all(&acme, &IngestOptions::forced())
        .await
        .unwrap();

    let opts = services.retrieval_options().with_threshold(0.0);
    let result = services.retrieval.retrieve("roof box", &globex, &opts).await;
    assert!(result.chunks.is_empty());
    assert_eq!(services.knowledge.count(&globex).await.unwrap(), 0);
    assert!(services.knowledge.count(&acme).await.unwrap() >= 3);

    services.shutdown().await;
}

#[tokio::test]
async fn skip_existing_and_forced_reingest() {
    let tmp = TempDir::new().unwrap();
    let services = setup(&tmp, ScriptedLlm::failing()).await;
    let org = OrganizationId::new("acme").unwrap();
    seed_products(&services, &org).await;
    let adapter = services.product_adapter();

    adapter.sync_all(&org, &IngestOptions::forced()).await.unwrap();
    let before = services.knowledge.count(&org).await.unwrap();

    let skipped = adapter.sync_all(&org, &IngestOptions::skip_existing()).await.unwrap();
    assert_eq!(skipped.skipped, 3);
    assert_eq!(skipped.successful, 3);

    let outcome = adapter
        .sync_product(&org, "p1", &IngestOptions::forced())
        .await
        .unwrap();
    assert!(matches!(outcome, Some(IngestOutcome::Updated { .. })));
    assert_eq!(services.knowledge.count(&org).await.unwrap(), before);

    services.shutdown().await;
}

fn pending_doc(id: &str) -> TenantDocument {
    TenantDocument {
        id: id.into(),
        title: "Framework agreement 2024".into(),
        file_name: Some("agreement.pdf".into()),
        document_type: Some("contract".into()),
        language: Some("en".into()),
        extracted_text: Some("Delivery within 14 days. Payment terms net 30.".into()),
        extracted_data: Some(serde_json::json!({"customer_name": "Novak d.o.o.", "total_amount": 12000})),
        processing_status: ProcessingStatus::Processed,
        processing_error: None,
        created_at: start(),
    }
}

#[tokio::test]
async fn document_sync_writes_status_back() {
    let tmp = TempDir::new().unwrap();
    let services = setup(&tmp, ScriptedLlm::failing()).await;
    let org = OrganizationId::new("acme").unwrap();
    services.tenant.upsert_document(&org, &pending_doc("d1")).await.unwrap();

    let report = services
        .document_adapter()
        .sync_pending(&org, &IngestOptions::forced())
        .await
        .unwrap();
    assert_eq!(report.successful, 1);

    let doc = services.tenant.get_document(&org, "d1").await.unwrap().unwrap();
    assert_eq!(doc.processing_status, ProcessingStatus::RagIndexed);
    assert!(services.tenant.list_unindexed_documents(&org).await.unwrap().is_empty());

    let hits = services
        .retrieval
        .retrieve(
            "payment terms",
            &org,
            &services.retrieval_options().with_source_types(&[SourceType::Document]),
        )
        .await;
    assert_eq!(hits.chunks[0].source_id, "d1");

    services.shutdown().await;
}

#[tokio::test]
async fn failed_document_is_marked_failed() {
    let tmp = TempDir::new().unwrap();
    let services = setup_with(&tmp, Arc::new(DisabledEmbedder), ScriptedLlm::failing(), None).await;
    let org = OrganizationId::new("acme").unwrap();
    services.tenant.upsert_document(&org, &pending_doc("d1")).await.unwrap();

    let report = services
        .document_adapter()
        .sync_pending(&org, &IngestOptions::forced())
        .await
        .unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors[0].record_id, "d1");

    let doc = services.tenant.get_document(&org, "d1").await.unwrap().unwrap();
    assert_eq!(doc.processing_status, ProcessingStatus::RagFailed);
    assert!(doc.processing_error.is_some());
    assert_eq!(services.tenant.list_unindexed_documents(&org).await.unwrap().len(), 1);

    services.shutdown().await;
}

async fn remember(services: &RagServices, org: &OrganizationId, content: &str, entity: Option<&str>, importance: f64) -> String {
    let mut metadata = Metadata::new();
    if let Some(e) = entity {
        metadata.insert("entity_id", e.to_string());
    }
    services
        .add_memory(
            org,
            NewMemory {
                memory_type: MemoryType::Contact,
                content: content.to_string(),
                importance_score: importance,
                user_id: None,
                shared: true,
                metadata,
            },
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn context_respects_budget_and_logs_access() {
    let tmp = TempDir::new().unwrap();
    let services = setup(&tmp, ScriptedLlm::failing()).await;
    let org = OrganizationId::new("acme").unwrap();

    let mut ids = Vec::new();
    ids.push(remember(&services, &org, "Novak prefers delivery of roof boxes on Mondays.", Some("c-42"), 0.9).await);
    ids.push(remember(&services, &org, "Novak asked about roof box discounts for fleets.", Some("c-42"), 0.6).await);
    ids.push(remember(&services, &org, "Novak roof box order was delayed in March.", Some("c-42"), 0.4).await);
    ids.push(remember(&services, &org, "Roof box returns are accepted within 30 days.", None, 0.5).await);

    let overrides = ContextOverrides {
        max_context_size: Some(45),
        relevance_threshold: Some(0.0),
        ..ContextOverrides::default()
    };
    let result = services
        .assembler
        .build_optimized_context("Novak roof box", &org, None, Some(&overrides))
        .await;

    assert_eq!(result.metadata.total_candidates, 4);
    assert_eq!(result.metadata.max_context_size, 45);
    assert_eq!(result.metadata.compressed_count, 1);
    assert!(result.total_tokens <= 45);
    assert!(result.truncated);
    assert!(result.memories[0].compressed);
    assert_eq!(result.memories[0].original_memory_ids.len(), 3);

    for memory in &result.memories {
        let covered = if memory.compressed {
            memory.original_memory_ids.clone()
        } else {
            vec![memory.id.clone()]
        };
        for id in covered {
            assert!(ids.contains(&id));
            assert_eq!(services.memories.access_count(&id).await.unwrap(), 1);
        }
    }

    services.shutdown().await;
}

#[tokio::test]
async fn subscription_tier_shapes_context() {
    let tmp = TempDir::new().unwrap();
    let services = setup(&tmp, ScriptedLlm::failing()).await;
    let org = OrganizationId::new("acme").unwrap();
    services.tiers.set_plan(&org, "starter").await.unwrap();
    remember(&services, &org, "Novak roof box order", None, 0.5).await;

    let result = services
        .assembler
        .build_optimized_context(
            "Novak roof box order",
            &org,
            None,
            Some(&ContextOverrides {
                relevance_threshold: Some(0.0),
                ..ContextOverrides::default()
            }),
        )
        .await;
    assert_eq!(result.metadata.plan.as_deref(), Some("starter"));
    assert_eq!(result.metadata.max_context_size, 40);

    services.shutdown().await;
}

#[tokio::test]
async fn ask_is_grounded_and_degrades_on_model_failure() {
    let tmp = TempDir::new().unwrap();
    let llm = ScriptedLlm::answering(r#"{"answer": "The 420L roof box fits the Golf.", "confidence": 0.9}"#);
    let services = setup(&tmp, llm.clone()).await;
    let org = OrganizationId::new("acme").unwrap();
    seed_products(&services, &org).await;
    services
        .product_adapter()
        .sync_all(&org, &IngestOptions::forced())
        .await
        .unwrap();

    let answer = services
        .orchestrator
        .ask("roof box for a Golf", &org, &services.retrieval_options())
        .await;
    assert_eq!(answer.answer, "The 420L roof box fits the Golf.");
    assert!((answer.confidence - 0.9).abs() < 1e-9);
    assert!(!answer.degraded);
    assert!(llm.last_prompt().contains("Roof box 420L"));
    services.shutdown().await;

    let tmp = TempDir::new().unwrap();
    let services = setup(&tmp, ScriptedLlm::failing()).await;
    let answer = services
        .orchestrator
        .ask("roof box for a Golf", &org, &services.retrieval_options())
        .await;
    assert!(answer.degraded);
    assert!(answer.answer.is_empty());
    assert_eq!(services.errors.count(ErrorCategory::Generation), 1);
    services.shutdown().await;
}

#[tokio::test]
async fn live_erp_facts_boost_recommendations() {
    let tmp = TempDir::new().unwrap();
    let llm = ScriptedLlm::answering("Novak's last order is in transit.");
    let services = setup(&tmp, llm.clone()).await;
    let org = OrganizationId::new("acme").unwrap();
    seed_products(&services, &org).await;
    services
        .product_adapter()
        .sync_all(&org, &IngestOptions::forced())
        .await
        .unwrap();

    let answer = services
        .orchestrator
        .ask_with_live_erp("roof box for a Golf", &org, "info@novak.si", &services.retrieval_options())
        .await;

    assert_eq!(answer.answer, "Novak's last order is in transit.");
    let top = &answer.recommendations[0];
    assert_eq!(top.source_id, "p1");
    // one order (0.03) placed five days ago (0.2)
    assert!((top.priority - top.similarity - 0.23).abs() < 1e-9);

    let prompt = llm.last_prompt();
    assert!(prompt.contains("Live customer data"));
    assert!(prompt.contains("2024-0042"));
    assert!(prompt.contains("in transit via GLS"));

    services.shutdown().await;
}

fn catalog_entry(language: &str, name: &str, description: &str) -> CatalogProduct {
    CatalogProduct {
        sku: "RB-420".into(),
        name: name.into(),
        language: language.into(),
        description: Some(description.into()),
        price: Some(249.0),
        in_stock: Some(true),
        ..CatalogProduct::default()
    }
}

#[tokio::test]
async fn german_email_gets_german_store_reply() {
    let tmp = TempDir::new().unwrap();
    let services = setup(&tmp, ScriptedLlm::failing()).await;
    let org = OrganizationId::new("acme").unwrap();
    let catalog = services.catalog_adapter();

    let report = catalog
        .ingest(
            &org,
            vec![
                catalog_entry("de", "Dachbox 420L", "Dachbox für den Golf, 420 Liter."),
                catalog_entry("en", "Roof box 420L", "Roof box for the Golf, 420 litres."),
            ],
            &IngestOptions::forced(),
        )
        .await;
    assert_eq!(report.successful, 2);

    let rec = catalog
        .recommend(
            &org,
            "Guten Tag, ich suche eine Dachbox für den Golf. Was ist der Preis? Vielen Dank",
            &services.retrieval_options(),
        )
        .await;

    assert_eq!(rec.language, "de");
    assert!(rec.detected);
    assert_eq!(rec.store_code, "de");
    assert!(!rec.products.is_empty());
    assert!(rec.products.iter().all(|c| c.source_id == "RB-420:de"));
    assert!(rec.reply.starts_with("Guten Tag,"));
    assert!(rec.reply.contains("- Dachbox 420L"));

    let fallback = catalog.recommend(&org, "ok", &services.retrieval_options()).await;
    assert_eq!(fallback.language, "en");
    assert!(!fallback.detected);

    services.shutdown().await;
}

#[tokio::test]
async fn erp_sync_record_refresh_and_removal() {
    let tmp = TempDir::new().unwrap();
    let services = setup(&tmp, ScriptedLlm::failing()).await;
    let org = OrganizationId::new("acme").unwrap();
    let adapter = services.erp_adapter().unwrap();

    let report = adapter.full_sync(&org, &IngestOptions::forced()).await.unwrap();
    assert_eq!(report.customers.successful, 1);
    assert_eq!(report.orders.successful, 1);
    let synced = services.knowledge.count(&org).await.unwrap();

    let refreshed = adapter
        .sync_by_id(&org, ErpRecordKind::Customer, "c-1", &IngestOptions::forced())
        .await
        .unwrap();
    assert!(refreshed.is_some());

    let removed = adapter
        .sync_by_id(&org, ErpRecordKind::Order, "o-1", &IngestOptions::forced())
        .await
        .unwrap();
    assert!(removed.is_none());
    assert!(services.knowledge.count(&org).await.unwrap() < synced);

    services.shutdown().await;
}

#[tokio::test]
async fn erp_adapter_requires_configuration() {
    let tmp = TempDir::new().unwrap();
    let services = setup_with(&tmp, Arc::new(HashingEmbedder::default()), ScriptedLlm::failing(), None).await;
    assert!(services.erp_adapter().is_err());
    services.shutdown().await;
}
