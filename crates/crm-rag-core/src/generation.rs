//! Generation orchestrator: grounded prompt → one language-model call.
//!
//! The orchestrator renders retrieved chunks and/or assembled memories into
//! a single system/user prompt pair and calls the [`LlmClient`] once. There
//! are no retries and no streaming.
//!
//! The model is asked for `{"answer": ..., "confidence": ...}`. A reply that
//! is not that JSON shape is used verbatim as the answer, and confidence
//! falls back to the mean similarity of the grounding items.
//!
//! [`GenerationOrchestrator::ask_with_live_erp`] additionally pulls live
//! customer facts from the ERP (customer record, recent orders, shipping
//! status). Those facts are placed in the prompt ahead of the product
//! recommendations and are never embedded or stored. Recommendations are
//! re-ranked with an upsell boost derived from the order history.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::Clock;
use crate::context::ContextResult;
use crate::diagnostics::{ErrorCategory, ErrorSink};
use crate::erp::{ErpClient, ErpCustomer, ErpOrder, ShippingStatus};
use crate::models::{MemoryUnit, OrganizationId, RetrievedChunk, SourceType};
use crate::retrieve::{RetrievalEngine, RetrievalOptions, RetrievalResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    Json,
}

/// One chat-completion request: a system/user message pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub format: ResponseFormat,
}

/// Chat-completion backend. One call, pass or fail.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<String>;

    fn model_name(&self) -> &str;
}

/// Everything the prompt is grounded on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroundingContext {
    pub chunks: Vec<RetrievedChunk>,
    pub memories: Vec<MemoryUnit>,
}

impl GroundingContext {
    pub fn from_retrieval(result: RetrievalResult) -> Self {
        Self {
            chunks: result.chunks,
            memories: Vec::new(),
        }
    }

    pub fn from_context(result: ContextResult) -> Self {
        Self {
            chunks: Vec::new(),
            memories: result.memories,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty() && self.memories.is_empty()
    }

    /// Mean similarity across chunks and memories, 0 when empty.
    pub fn mean_similarity(&self) -> f64 {
        let sims: Vec<f64> = self
            .chunks
            .iter()
            .map(|c| c.similarity)
            .chain(self.memories.iter().map(|m| m.similarity))
            .collect();
        if sims.is_empty() {
            0.0
        } else {
            sims.iter().sum::<f64>() / sims.len() as f64
        }
    }
}

/// A product recommendation after the upsell re-rank.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub title: String,
    pub source_id: String,
    pub similarity: f64,
    pub priority: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationAnswer {
    pub answer: String,
    /// In `[0, 1]`.
    pub confidence: f64,
    /// Set when the model call failed and `answer` is empty.
    pub degraded: bool,
    pub recommendations: Vec<Recommendation>,
}

/// Live ERP facts for one customer. Ground truth, never embedded.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LiveFacts {
    pub customer: Option<ErpCustomer>,
    pub orders: Vec<ErpOrder>,
    pub shipping: Option<ShippingStatus>,
}

impl LiveFacts {
    pub fn is_empty(&self) -> bool {
        self.customer.is_none() && self.orders.is_empty() && self.shipping.is_none()
    }

    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        if let Some(c) = &self.customer {
            let mut line = format!("Customer: {}", c.name);
            if let Some(email) = &c.email {
                line.push_str(&format!(" <{email}>"));
            }
            lines.push(line);
            if !c.tags.is_empty() {
                lines.push(format!("Tags: {}", c.tags.join(", ")));
            }
        }
        if !self.orders.is_empty() {
            lines.push(format!("Recent orders ({}):", self.orders.len()));
            for o in &self.orders {
                let date = o
                    .order_date
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "unknown date".to_string());
                let status = o.status.as_deref().unwrap_or("unknown");
                let currency = o.currency.as_deref().unwrap_or("EUR");
                lines.push(format!("- {} on {date}: {:.2} {currency}, {status}", o.number, o.total));
            }
        }
        if let Some(s) = &self.shipping {
            let mut line = format!("Shipping for order {}: {}", s.order_id, s.status);
            if let Some(carrier) = &s.carrier {
                line.push_str(&format!(" via {carrier}"));
            }
            if let Some(tracking) = &s.tracking_number {
                line.push_str(&format!(" (tracking {tracking})"));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

const MAX_BOOST: f64 = 0.5;

/// Upsell boost from order history: `min(orders, 10) * 0.03`, plus 0.2 when
/// the latest order is at most 30 days old or 0.1 when at most 90, capped
/// at 0.5.
pub fn upsell_boost(orders: &[ErpOrder], now: DateTime<Utc>) -> f64 {
    let history = orders.len().min(10) as f64 * 0.03;
    let latest = orders.iter().filter_map(|o| o.order_date).max();
    let recency = match latest.map(|d| (now - d).num_days()) {
        Some(days) if days <= 30 => 0.2,
        Some(days) if days <= 90 => 0.1,
        _ => 0.0,
    };
    (history + recency).min(MAX_BOOST)
}

fn is_product_chunk(chunk: &RetrievedChunk) -> bool {
    matches!(chunk.source_type, SourceType::Product | SourceType::Magento)
        || chunk.metadata.get_str("erp_kind") == Some("product")
}

/// Product chunks ranked by `similarity + boost`, one per source.
pub fn rank_recommendations(chunks: &[RetrievedChunk], boost: f64) -> Vec<Recommendation> {
    let mut recs: Vec<Recommendation> = Vec::new();
    for chunk in chunks.iter().filter(|c| is_product_chunk(c)) {
        let priority = chunk.similarity + boost;
        match recs.iter().position(|r| r.source_id == chunk.source_id) {
            Some(i) => {
                if recs[i].priority < priority {
                    recs[i].similarity = chunk.similarity;
                    recs[i].priority = priority;
                }
            }
            None => recs.push(Recommendation {
                title: chunk.title.clone(),
                source_id: chunk.source_id.clone(),
                similarity: chunk.similarity,
                priority,
            }),
        }
    }
    recs.sort_by(|a, b| {
        b.priority
            .partial_cmp(&a.priority)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    recs
}

const SYSTEM_PROMPT: &str = "You are a sales assistant inside a CRM. Answer the question using only \
the provided context. If the context does not contain the answer, say so. Respond with a JSON object \
{\"answer\": string, \"confidence\": number between 0 and 1}.";

/// Render the user message.
pub fn build_prompt(query: &str, ctx: &GroundingContext, live: Option<&LiveFacts>) -> String {
    let mut out = String::new();

    let live = live.filter(|f| !f.is_empty());
    if let Some(facts) = live {
        out.push_str("Live customer data (authoritative):\n");
        out.push_str(&facts.summary());
        out.push_str("\n\n");
    }

    if !ctx.chunks.is_empty() {
        out.push_str(if live.is_some() {
            "Recommended products and knowledge:\n"
        } else {
            "Knowledge base:\n"
        });
        for (i, c) in ctx.chunks.iter().enumerate() {
            out.push_str(&format!("[{}] {} ({})\n{}\n\n", i + 1, c.title, c.source_type, c.content));
        }
    }

    if !ctx.memories.is_empty() {
        out.push_str("CRM memory:\n");
        for m in &ctx.memories {
            out.push_str(&format!("- [{}] {}\n", m.memory_type, m.content));
        }
        out.push('\n');
    }

    if ctx.is_empty() && live.is_none() {
        out.push_str("No context is available.\n\n");
    }

    out.push_str("Question: ");
    out.push_str(query);
    out
}

#[derive(Deserialize)]
struct JsonAnswer {
    answer: String,
    confidence: Option<f64>,
}

fn strip_fences(reply: &str) -> &str {
    let t = reply.trim();
    let t = t
        .strip_prefix("```json")
        .or_else(|| t.strip_prefix("```"))
        .unwrap_or(t);
    t.strip_suffix("```").unwrap_or(t).trim()
}

/// Split a model reply into `(answer, confidence)`.
pub fn parse_reply(reply: &str, fallback_confidence: f64) -> (String, f64) {
    match serde_json::from_str::<JsonAnswer>(strip_fences(reply)) {
        Ok(parsed) => {
            let confidence = parsed
                .confidence
                .filter(|c| c.is_finite())
                .map(|c| c.clamp(0.0, 1.0))
                .unwrap_or(fallback_confidence);
            (parsed.answer, confidence)
        }
        Err(_) => (reply.trim().to_string(), fallback_confidence),
    }
}

pub struct GenerationOrchestrator {
    retrieval: Arc<RetrievalEngine>,
    llm: Arc<dyn LlmClient>,
    erp: Option<Arc<dyn ErpClient>>,
    errors: Arc<ErrorSink>,
    clock: Arc<dyn Clock>,
    recent_orders: usize,
}

impl GenerationOrchestrator {
    pub fn new(
        retrieval: Arc<RetrievalEngine>,
        llm: Arc<dyn LlmClient>,
        errors: Arc<ErrorSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            retrieval,
            llm,
            erp: None,
            errors,
            clock,
            recent_orders: 5,
        }
    }

    pub fn with_erp(mut self, erp: Arc<dyn ErpClient>) -> Self {
        self.erp = Some(erp);
        self
    }

    /// Answer `query` from an already-built grounding context.
    pub async fn query_with_generation(
        &self,
        query: &str,
        org: &OrganizationId,
        ctx: &GroundingContext,
    ) -> GenerationAnswer {
        self.generate(query, org, ctx, None).await
    }

    /// Retrieve, then answer.
    pub async fn ask(
        &self,
        query: &str,
        org: &OrganizationId,
        options: &RetrievalOptions,
    ) -> GenerationAnswer {
        let retrieved = self.retrieval.retrieve(query, org, options).await;
        let ctx = GroundingContext::from_retrieval(retrieved);
        self.generate(query, org, &ctx, None).await
    }

    /// Retrieve, blend live ERP facts for `customer_email`, then answer.
    pub async fn ask_with_live_erp(
        &self,
        query: &str,
        org: &OrganizationId,
        customer_email: &str,
        options: &RetrievalOptions,
    ) -> GenerationAnswer {
        let facts = self.live_facts(org, customer_email).await;
        let boost = upsell_boost(&facts.orders, self.clock.now());

        let retrieved = self.retrieval.retrieve(query, org, options).await;
        let recommendations = rank_recommendations(&retrieved.chunks, boost);

        let mut chunks = retrieved.chunks;
        let rank_of = |c: &RetrievedChunk| {
            recommendations
                .iter()
                .position(|r| r.source_id == c.source_id)
                .unwrap_or(usize::MAX)
        };
        chunks.sort_by_key(|c| rank_of(c));
        let ctx = GroundingContext {
            chunks,
            memories: Vec::new(),
        };

        let mut answer = self.generate(query, org, &ctx, Some(&facts)).await;
        answer.recommendations = recommendations;
        answer
    }

    /// Fetch customer, recent orders, and latest shipping status. Failures
    /// leave the corresponding facts empty.
    pub async fn live_facts(&self, org: &OrganizationId, customer_email: &str) -> LiveFacts {
        let mut facts = LiveFacts::default();
        let erp = match &self.erp {
            Some(erp) => erp,
            None => return facts,
        };

        let customer = match erp.get_customer_by_email(org, customer_email).await {
            Ok(Some(c)) => c,
            Ok(None) => return facts,
            Err(e) => {
                self.errors
                    .report(ErrorCategory::LiveErp, &format!("customer lookup: {e:#}"));
                return facts;
            }
        };

        match erp.get_recent_orders(org, &customer.id, self.recent_orders).await {
            Ok(orders) => facts.orders = orders,
            Err(e) => self
                .errors
                .report(ErrorCategory::LiveErp, &format!("recent orders: {e:#}")),
        }

        if let Some(latest) = facts.orders.first() {
            match erp.get_shipping_status(org, &latest.id).await {
                Ok(status) => facts.shipping = status,
                Err(e) => self
                    .errors
                    .report(ErrorCategory::LiveErp, &format!("shipping status: {e:#}")),
            }
        }

        facts.customer = Some(customer);
        facts
    }

    async fn generate(
        &self,
        query: &str,
        org: &OrganizationId,
        ctx: &GroundingContext,
        live: Option<&LiveFacts>,
    ) -> GenerationAnswer {
        let request = ChatRequest {
            system: SYSTEM_PROMPT.to_string(),
            user: build_prompt(query, ctx, live),
            format: ResponseFormat::Json,
        };
        let fallback = ctx.mean_similarity();

        match self.llm.complete(&request).await {
            Ok(reply) => {
                let (answer, confidence) = parse_reply(&reply, fallback);
                tracing::debug!(
                    organization_id = %org,
                    model = self.llm.model_name(),
                    confidence,
                    "generated answer"
                );
                GenerationAnswer {
                    answer,
                    confidence,
                    degraded: false,
                    recommendations: Vec::new(),
                }
            }
            Err(e) => {
                self.errors
                    .report(ErrorCategory::Generation, &format!("{org}: {e:#}"));
                GenerationAnswer {
                    degraded: true,
                    ..GenerationAnswer::default()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::chunk::ChunkConfig;
    use crate::embedding::{EmbeddingProvider, HashingEmbedder};
    use crate::erp::{ErpContext, ErpRecord, ErpRecordKind};
    use crate::models::{ContentItem, Metadata};
    use crate::pipeline::{IngestOptions, IngestionPipeline};
    use crate::store::memory::InMemoryKnowledgeStore;
    use crate::store::KnowledgeStore;
    use chrono::Duration;
    use std::sync::Mutex;

    struct ScriptedLlm {
        reply: Result<String, String>,
        seen: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedLlm {
        fn replying(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                reply: Err("rate limited".to_string()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn last_prompt(&self) -> String {
            self.seen.lock().unwrap().last().unwrap().user.clone()
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, request: &ChatRequest) -> Result<String> {
            self.seen.lock().unwrap().push(request.clone());
            self.reply.clone().map_err(|e| anyhow::anyhow!(e))
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn chunk(source_id: &str, source_type: SourceType, similarity: f64) -> RetrievedChunk {
        RetrievedChunk {
            entry_id: format!("{source_id}-0"),
            source_type,
            source_id: source_id.into(),
            title: source_id.into(),
            chunk_index: 0,
            content: format!("about {source_id}"),
            similarity,
            metadata: Metadata::new(),
        }
    }

    fn order(id: &str, days_ago: i64, now: DateTime<Utc>) -> ErpOrder {
        ErpOrder {
            id: id.into(),
            number: format!("N-{id}"),
            total: 100.0,
            order_date: Some(now - Duration::days(days_ago)),
            ..Default::default()
        }
    }

    #[test]
    fn parse_json_reply() {
        let (answer, conf) = parse_reply(r#"{"answer":"Yes, in stock.","confidence":0.82}"#, 0.1);
        assert_eq!(answer, "Yes, in stock.");
        assert!((conf - 0.82).abs() < 1e-9);

        let (_, conf) = parse_reply("```json\n{\"answer\":\"x\",\"confidence\":7}\n```", 0.1);
        assert_eq!(conf, 1.0);
    }

    #[test]
    fn plain_text_reply_uses_mean_similarity() {
        let (answer, conf) = parse_reply("  It ships tomorrow. ", 0.7);
        assert_eq!(answer, "It ships tomorrow.");
        assert_eq!(conf, 0.7);
    }

    #[test]
    fn boost_rewards_history_and_recency() {
        let now = Utc::now();
        assert_eq!(upsell_boost(&[], now), 0.0);
        let recent = vec![order("a", 10, now), order("b", 200, now)];
        assert!((upsell_boost(&recent, now) - 0.26).abs() < 1e-9);
        let older = vec![order("a", 60, now)];
        assert!((upsell_boost(&older, now) - 0.13).abs() < 1e-9);
        let many: Vec<ErpOrder> = (0..15).map(|i| order(&i.to_string(), 5, now)).collect();
        assert!((upsell_boost(&many, now) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn recommendations_rank_products_only() {
        let chunks = vec![
            chunk("doc", SourceType::Document, 0.95),
            chunk("p1", SourceType::Product, 0.7),
            chunk("p2", SourceType::Magento, 0.8),
            chunk("p1", SourceType::Product, 0.75),
        ];
        let recs = rank_recommendations(&chunks, 0.2);
        let ids: Vec<&str> = recs.iter().map(|r| r.source_id.as_str()).collect();
        assert_eq!(ids, vec!["p2", "p1"]);
        assert!((recs[1].priority - 0.95).abs() < 1e-9);
    }

    #[test]
    fn live_facts_precede_recommendations() {
        let now = Utc::now();
        let facts = LiveFacts {
            customer: Some(ErpCustomer {
                id: "c1".into(),
                name: "Novak".into(),
                ..Default::default()
            }),
            orders: vec![order("o1", 3, now)],
            shipping: None,
        };
        let ctx = GroundingContext {
            chunks: vec![chunk("p1", SourceType::Product, 0.8)],
            memories: Vec::new(),
        };
        let prompt = build_prompt("What should I offer?", &ctx, Some(&facts));
        let live = prompt.find("Live customer data").unwrap();
        let recs = prompt.find("Recommended products").unwrap();
        let question = prompt.find("Question:").unwrap();
        assert!(live < recs && recs < question);
    }

    #[test]
    fn empty_live_facts_keep_knowledge_header() {
        let ctx = GroundingContext {
            chunks: vec![chunk("p1", SourceType::Product, 0.8)],
            memories: Vec::new(),
        };
        let prompt = build_prompt("What should I offer?", &ctx, Some(&LiveFacts::default()));
        assert!(prompt.contains("Knowledge base:"));
        assert!(!prompt.contains("Recommended products"));
        assert!(!prompt.contains("Live customer data"));

        let empty = GroundingContext::default();
        let prompt = build_prompt("Anything?", &empty, Some(&LiveFacts::default()));
        assert!(prompt.contains("No context is available."));
    }

    fn retrieval_over(store: Arc<dyn KnowledgeStore>, errors: Arc<ErrorSink>) -> Arc<RetrievalEngine> {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashingEmbedder::default());
        Arc::new(RetrievalEngine::new(store, embedder, errors))
    }

    #[tokio::test]
    async fn ask_grounds_prompt_and_falls_back_confidence() {
        let store: Arc<dyn KnowledgeStore> = Arc::new(InMemoryKnowledgeStore::new());
        let pipeline = IngestionPipeline::new(
            store.clone(),
            Arc::new(HashingEmbedder::default()),
            ChunkConfig::default(),
        );
        let org = OrganizationId::new("org").unwrap();
        pipeline
            .ingest_content(
                &org,
                &ContentItem {
                    title: "Roof box 420".into(),
                    content: "roof box 420 litres black".into(),
                    source_type: SourceType::Product,
                    source_id: "rb-420".into(),
                    metadata: Metadata::new(),
                },
                &IngestOptions::forced(),
            )
            .await
            .unwrap();

        let errors = Arc::new(ErrorSink::new());
        let llm = Arc::new(ScriptedLlm::replying("The roof box holds 420 litres."));
        let orchestrator = GenerationOrchestrator::new(
            retrieval_over(store, errors.clone()),
            llm.clone(),
            errors,
            Arc::new(ManualClock::new(Utc::now())),
        );
        let answer = orchestrator
            .ask("roof box 420 litres black", &org, &RetrievalOptions::default())
            .await;
        assert_eq!(answer.answer, "The roof box holds 420 litres.");
        assert!((answer.confidence - 1.0).abs() < 1e-5);
        assert!(llm.last_prompt().contains("roof box 420 litres black"));
    }

    #[tokio::test]
    async fn llm_failure_degrades() {
        let errors = Arc::new(ErrorSink::new());
        let orchestrator = GenerationOrchestrator::new(
            retrieval_over(Arc::new(InMemoryKnowledgeStore::new()), errors.clone()),
            Arc::new(ScriptedLlm::failing()),
            errors.clone(),
            Arc::new(ManualClock::new(Utc::now())),
        );
        let org = OrganizationId::new("org").unwrap();
        let answer = orchestrator
            .query_with_generation("hi", &org, &GroundingContext::default())
            .await;
        assert!(answer.degraded);
        assert_eq!(answer.confidence, 0.0);
        assert_eq!(errors.count(ErrorCategory::Generation), 1);
    }

    struct FakeErp {
        now: DateTime<Utc>,
        shipping_fails: bool,
    }

    #[async_trait]
    impl ErpClient for FakeErp {
        async fn get_ai_context(&self, _: &OrganizationId) -> Result<ErpContext> {
            Ok(ErpContext::default())
        }
        async fn get_record(&self, _: &OrganizationId, _: ErpRecordKind, _: &str) -> Result<Option<ErpRecord>> {
            Ok(None)
        }
        async fn get_customer_by_email(&self, _: &OrganizationId, email: &str) -> Result<Option<ErpCustomer>> {
            Ok((email == "ana@novak.si").then(|| ErpCustomer {
                id: "c1".into(),
                name: "Ana Novak".into(),
                email: Some(email.into()),
                ..Default::default()
            }))
        }
        async fn get_recent_orders(&self, _: &OrganizationId, _: &str, _: usize) -> Result<Vec<ErpOrder>> {
            Ok(vec![order("o1", 5, self.now), order("o2", 40, self.now)])
        }
        async fn get_shipping_status(&self, _: &OrganizationId, order_id: &str) -> Result<Option<ShippingStatus>> {
            if self.shipping_fails {
                anyhow::bail!("carrier API down")
            }
            Ok(Some(ShippingStatus {
                order_id: order_id.into(),
                status: "in transit".into(),
                carrier: Some("GLS".into()),
                ..Default::default()
            }))
        }
    }

    #[tokio::test]
    async fn live_erp_blend_reports_partial_failures() {
        let now = Utc::now();
        let errors = Arc::new(ErrorSink::new());
        let llm = Arc::new(ScriptedLlm::replying(r#"{"answer":"Offer the roof rack.","confidence":0.6}"#));
        let orchestrator = GenerationOrchestrator::new(
            retrieval_over(Arc::new(InMemoryKnowledgeStore::new()), errors.clone()),
            llm.clone(),
            errors.clone(),
            Arc::new(ManualClock::new(now)),
        )
        .with_erp(Arc::new(FakeErp {
            now,
            shipping_fails: true,
        }));
        let org = OrganizationId::new("org").unwrap();
        let answer = orchestrator
            .ask_with_live_erp("what to offer", &org, "ana@novak.si", &RetrievalOptions::default())
            .await;
        assert_eq!(answer.answer, "Offer the roof rack.");
        let prompt = llm.last_prompt();
        assert!(prompt.contains("Customer: Ana Novak"));
        assert!(prompt.contains("Recent orders (2):"));
        assert!(!prompt.contains("Shipping for order"));
        assert_eq!(errors.count(ErrorCategory::LiveErp), 1);

        let facts = orchestrator.live_facts(&org, "nobody@example.com").await;
        assert!(facts.is_empty());
    }
}
