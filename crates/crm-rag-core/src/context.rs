//! Context assembler: relevant memories packed into a token budget.
//!
//! # Pipeline
//!
//! 1. Resolve a [`ContextConfig`]: defaults, then the organization's plan
//!    tier, then user overrides, then per-call overrides.
//! 2. Search the [`MemoryIndex`] above `relevance_threshold`, limited to the
//!    user's own plus shared memories when a user is given, and to the last
//!    seven days when long-term memory is off.
//! 3. Prioritize:
//!    `score = (importance + max(0, 1 - age_days / 30) * recency_weight) * (1 + importance_weight)`.
//! 4. Compress when the candidates exceed the budget: memories of the same
//!    type sharing a reference key (`entity_id`, `contact_id`, ...) merge
//!    into the highest-importance member.
//! 5. Fit: take items in order until the next one would overflow, then stop.
//!
//! Every included memory gets an access record. Failures there, and any
//! failure of the pipeline itself, go to the [`ErrorSink`]; the caller sees
//! a degraded result, never an error.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::Clock;
use crate::diagnostics::{ErrorCategory, ErrorSink};
use crate::embedding::EmbeddingProvider;
use crate::models::{MemoryType, MemoryUnit, OrganizationId};
use crate::store::{AccessRecord, AccessRecorder, AccessType, MemoryIndex, MemoryQuery};
use crate::tokens::TokenEstimator;

/// Metadata keys that tie memories to the same CRM object.
pub const REFERENCE_KEYS: [&str; 5] = ["entity_id", "contact_id", "deal_id", "product_id", "customer_id"];

pub const STRATEGY_PRIORITIZED: &str = "importance_recency";
pub const STRATEGY_SIMILARITY: &str = "similarity";
pub const STRATEGY_ERROR: &str = "error";

const RECENCY_HORIZON_DAYS: f64 = 30.0;
const SHORT_TERM_DAYS: i64 = 7;
const CANDIDATE_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Token budget for the returned memories.
    pub max_context_size: usize,
    pub relevance_threshold: f64,
    pub recency_weight: f64,
    pub importance_weight: f64,
    pub enable_long_term_memory: bool,
    pub enable_memory_compression: bool,
    pub enable_context_prioritization: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_size: 4000,
            relevance_threshold: 0.7,
            recency_weight: 0.3,
            importance_weight: 0.5,
            enable_long_term_memory: true,
            enable_memory_compression: true,
            enable_context_prioritization: true,
        }
    }
}

/// Partial [`ContextConfig`]; `None` fields leave the lower layer alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextOverrides {
    pub max_context_size: Option<usize>,
    pub relevance_threshold: Option<f64>,
    pub recency_weight: Option<f64>,
    pub importance_weight: Option<f64>,
    pub enable_long_term_memory: Option<bool>,
    pub enable_memory_compression: Option<bool>,
    pub enable_context_prioritization: Option<bool>,
}

impl ContextConfig {
    pub fn apply(&mut self, o: &ContextOverrides) {
        if let Some(v) = o.max_context_size {
            self.max_context_size = v;
        }
        if let Some(v) = o.relevance_threshold {
            self.relevance_threshold = v;
        }
        if let Some(v) = o.recency_weight {
            self.recency_weight = v;
        }
        if let Some(v) = o.importance_weight {
            self.importance_weight = v;
        }
        if let Some(v) = o.enable_long_term_memory {
            self.enable_long_term_memory = v;
        }
        if let Some(v) = o.enable_memory_compression {
            self.enable_memory_compression = v;
        }
        if let Some(v) = o.enable_context_prioritization {
            self.enable_context_prioritization = v;
        }
    }

    /// Layer defaults, plan tier, user overrides and `call` overrides.
    ///
    /// Lookup failures are reported to `errors` and the failed layer is
    /// skipped. Returns the config and the plan name when one was found.
    pub async fn resolve(
        tiers: &dyn TierResolver,
        org: &OrganizationId,
        user_id: Option<&str>,
        call: Option<&ContextOverrides>,
        errors: &ErrorSink,
    ) -> (ContextConfig, Option<String>) {
        let mut config = ContextConfig::default();

        let plan = match tiers.plan_for(org).await {
            Ok(plan) => plan,
            Err(e) => {
                errors.report(ErrorCategory::TierLookup, &format!("plan for {org}: {e:#}"));
                None
            }
        };
        if let Some(tier) = plan.as_deref().and_then(|p| tiers.tier_overrides(p)) {
            config.apply(&tier);
        }

        if let Some(user) = user_id {
            match tiers.user_overrides(org, user).await {
                Ok(Some(o)) => config.apply(&o),
                Ok(None) => {}
                Err(e) => errors.report(
                    ErrorCategory::TierLookup,
                    &format!("user overrides for {org}/{user}: {e:#}"),
                ),
            }
        }

        if let Some(o) = call {
            config.apply(o);
        }
        (config, plan)
    }
}

/// Subscription-tier lookups backing [`ContextConfig::resolve`].
#[async_trait]
pub trait TierResolver: Send + Sync {
    /// Plan name for the organization's active subscription.
    async fn plan_for(&self, org: &OrganizationId) -> Result<Option<String>>;

    /// Context settings attached to a plan.
    fn tier_overrides(&self, plan: &str) -> Option<ContextOverrides>;

    async fn user_overrides(
        &self,
        org: &OrganizationId,
        user_id: &str,
    ) -> Result<Option<ContextOverrides>>;
}

/// Resolver with no plans and no user settings.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTiers;

#[async_trait]
impl TierResolver for DefaultTiers {
    async fn plan_for(&self, _org: &OrganizationId) -> Result<Option<String>> {
        Ok(None)
    }

    fn tier_overrides(&self, _plan: &str) -> Option<ContextOverrides> {
        None
    }

    async fn user_overrides(&self, _: &OrganizationId, _: &str) -> Result<Option<ContextOverrides>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextMetadata {
    pub total_candidates: usize,
    pub compressed_count: usize,
    pub prioritization_strategy: String,
    pub plan: Option<String>,
    pub max_context_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextResult {
    pub memories: Vec<MemoryUnit>,
    pub total_tokens: usize,
    pub truncated: bool,
    pub metadata: ContextMetadata,
}

impl ContextResult {
    fn error() -> Self {
        Self {
            metadata: ContextMetadata {
                prioritization_strategy: STRATEGY_ERROR.to_string(),
                ..ContextMetadata::default()
            },
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.metadata.prioritization_strategy == STRATEGY_ERROR
    }
}

pub struct ContextAssembler {
    memories: Arc<dyn MemoryIndex>,
    recorder: Arc<dyn AccessRecorder>,
    embedder: Arc<dyn EmbeddingProvider>,
    tiers: Arc<dyn TierResolver>,
    errors: Arc<ErrorSink>,
    clock: Arc<dyn Clock>,
    estimator: TokenEstimator,
}

impl ContextAssembler {
    pub fn new(
        memories: Arc<dyn MemoryIndex>,
        recorder: Arc<dyn AccessRecorder>,
        embedder: Arc<dyn EmbeddingProvider>,
        tiers: Arc<dyn TierResolver>,
        errors: Arc<ErrorSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            memories,
            recorder,
            embedder,
            tiers,
            errors,
            clock,
            estimator: TokenEstimator::CONTEXT,
        }
    }

    /// Build a budget-bounded context for `query`. Never fails; on error the
    /// result is empty with strategy [`STRATEGY_ERROR`].
    pub async fn build_optimized_context(
        &self,
        query: &str,
        org: &OrganizationId,
        user_id: Option<&str>,
        overrides: Option<&ContextOverrides>,
    ) -> ContextResult {
        let (config, plan) =
            ContextConfig::resolve(self.tiers.as_ref(), org, user_id, overrides, &self.errors).await;

        match self.assemble(query, org, user_id, &config).await {
            Ok(mut result) => {
                result.metadata.plan = plan;
                self.record_accesses(&result.memories, org, user_id, query).await;
                result
            }
            Err(e) => {
                self.errors
                    .report(ErrorCategory::ContextBuild, &format!("{org}: {e:#}"));
                ContextResult::error()
            }
        }
    }

    async fn assemble(
        &self,
        query: &str,
        org: &OrganizationId,
        user_id: Option<&str>,
        config: &ContextConfig,
    ) -> Result<ContextResult> {
        let now = self.clock.now();
        let embedding = self.embedder.embed(query).await?;

        let mut memory_query = MemoryQuery::for_tenant(org, embedding);
        memory_query.user_id = user_id.map(String::from);
        memory_query.min_similarity = config.relevance_threshold;
        memory_query.limit = CANDIDATE_LIMIT;
        if !config.enable_long_term_memory {
            memory_query.created_after = Some(now - Duration::days(SHORT_TERM_DAYS));
        }

        let mut items = self.memories.search(&memory_query).await?;
        let total_candidates = items.len();

        let strategy = if config.enable_context_prioritization {
            prioritize(&mut items, config, now);
            STRATEGY_PRIORITIZED
        } else {
            STRATEGY_SIMILARITY
        };

        let total: usize = items.iter().map(|m| self.estimator.estimate(&m.content)).sum();
        if config.enable_memory_compression && total > config.max_context_size {
            items = compress(items);
        }
        let compressed_count = items.iter().filter(|m| m.compressed).count();

        let (memories, total_tokens, truncated) =
            fit_to_window(items, config.max_context_size, &self.estimator);

        tracing::debug!(
            organization_id = %org,
            total_candidates,
            included = memories.len(),
            total_tokens,
            truncated,
            "assembled context"
        );

        Ok(ContextResult {
            memories,
            total_tokens,
            truncated,
            metadata: ContextMetadata {
                total_candidates,
                compressed_count,
                prioritization_strategy: strategy.to_string(),
                plan: None,
                max_context_size: config.max_context_size,
            },
        })
    }

    async fn record_accesses(
        &self,
        memories: &[MemoryUnit],
        org: &OrganizationId,
        user_id: Option<&str>,
        query: &str,
    ) {
        let now = self.clock.now();
        for memory in memories {
            let ids: Vec<&String> = if memory.compressed {
                memory.original_memory_ids.iter().collect()
            } else {
                vec![&memory.id]
            };
            for id in ids {
                let record = AccessRecord {
                    memory_id: id.clone(),
                    organization_id: org.clone(),
                    access_type: AccessType::Retrieve,
                    user_id: user_id.map(String::from),
                    context: Some(query.to_string()),
                    accessed_at: now,
                };
                if let Err(e) = self.recorder.record_access(&record).await {
                    self.errors
                        .report(ErrorCategory::AccessLog, &format!("memory {id}: {e:#}"));
                }
            }
        }
    }
}

/// Priority score of one memory at `now`.
pub fn priority_score(memory: &MemoryUnit, config: &ContextConfig, now: DateTime<Utc>) -> f64 {
    let age_days = (now - memory.created_at).num_seconds().max(0) as f64 / 86_400.0;
    let recency = (1.0 - age_days / RECENCY_HORIZON_DAYS).max(0.0);
    (memory.importance_score + recency * config.recency_weight) * (1.0 + config.importance_weight)
}

/// Sort by [`priority_score`], highest first.
pub fn prioritize(items: &mut [MemoryUnit], config: &ContextConfig, now: DateTime<Utc>) {
    items.sort_by(|a, b| {
        priority_score(b, config, now)
            .partial_cmp(&priority_score(a, config, now))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

type GroupKey = (MemoryType, &'static str, String);

fn group_keys(memory: &MemoryUnit) -> Vec<GroupKey> {
    REFERENCE_KEYS
        .iter()
        .filter_map(|key| {
            memory
                .metadata
                .get(key)
                .map(|v| (memory.memory_type, *key, v.display()))
        })
        .collect()
}

/// Merge memories sharing a type and any reference key. Sharing is
/// transitive: a memory keyed by both an entity and a contact joins the
/// groups of each.
///
/// Groups keep the position of their first member. Memories with no
/// reference key pass through unchanged.
pub fn compress(items: Vec<MemoryUnit>) -> Vec<MemoryUnit> {
    let mut slots: Vec<Option<Vec<(usize, MemoryUnit)>>> = Vec::new();
    let mut by_key: HashMap<GroupKey, usize> = HashMap::new();

    for (pos, item) in items.into_iter().enumerate() {
        let keys = group_keys(&item);
        let mut hits: Vec<usize> = keys.iter().filter_map(|k| by_key.get(k).copied()).collect();
        hits.sort_unstable();
        hits.dedup();

        let target = match hits.first() {
            Some(&first) => first,
            None => {
                slots.push(Some(Vec::new()));
                slots.len() - 1
            }
        };

        for &other in hits.iter().skip(1) {
            if let Some(members) = slots[other].take() {
                if let Some(group) = slots[target].as_mut() {
                    group.extend(members);
                }
            }
            for slot in by_key.values_mut() {
                if *slot == other {
                    *slot = target;
                }
            }
        }

        for key in keys {
            by_key.insert(key, target);
        }
        if let Some(group) = slots[target].as_mut() {
            group.push((pos, item));
        }
    }

    slots
        .into_iter()
        .flatten()
        .map(|mut group| {
            group.sort_by_key(|(pos, _)| *pos);
            merge_group(group.into_iter().map(|(_, m)| m).collect())
        })
        .collect()
}

fn merge_group(mut group: Vec<MemoryUnit>) -> MemoryUnit {
    if group.len() == 1 {
        if let Some(only) = group.pop() {
            return only;
        }
    }

    let base_pos = group
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            a.importance_score
                .partial_cmp(&b.importance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
        .unwrap_or(0);
    let mut base = group.remove(base_pos);

    let mut ids = vec![base.id.clone()];
    let mut content = base.content.clone();
    content.push_str("\n\nAdditional context:");
    for other in &group {
        content.push_str("\n- ");
        content.push_str(&other.content);
        ids.push(other.id.clone());
        base.similarity = base.similarity.max(other.similarity);
    }

    base.content = content;
    base.compressed = true;
    base.original_memory_ids = ids;
    base
}

/// Greedy prefix of `items` within `budget` tokens.
///
/// Returns the kept items, their token total, and whether anything was
/// left out.
pub fn fit_to_window(
    items: Vec<MemoryUnit>,
    budget: usize,
    estimator: &TokenEstimator,
) -> (Vec<MemoryUnit>, usize, bool) {
    let mut kept = Vec::new();
    let mut total = 0usize;
    let available = items.len();
    for item in items {
        let tokens = estimator.estimate(&item.content);
        if total + tokens > budget {
            break;
        }
        total += tokens;
        kept.push(item);
    }
    let truncated = kept.len() < available;
    (kept, total, truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::embedding::HashingEmbedder;
    use crate::models::Metadata;
    use crate::store::memory::InMemoryMemoryIndex;
    use crate::store::MemoryRecord;

    fn unit(id: &str, importance: f64, age_days: i64, now: DateTime<Utc>) -> MemoryUnit {
        MemoryUnit {
            id: id.into(),
            memory_type: MemoryType::Interaction,
            content: format!("memory {id}"),
            importance_score: importance,
            created_at: now - Duration::days(age_days),
            similarity: 0.9,
            metadata: Metadata::new(),
            compressed: false,
            original_memory_ids: Vec::new(),
        }
    }

    #[test]
    fn priority_prefers_recent_then_important() {
        let now = Utc::now();
        let config = ContextConfig::default();
        let mut items = vec![
            unit("old", 0.5, 40, now),
            unit("fresh", 0.5, 0, now),
            unit("important", 0.9, 40, now),
        ];
        prioritize(&mut items, &config, now);
        let order: Vec<&str> = items.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(order, vec!["important", "fresh", "old"]);

        // (0.5 + 1.0 * 0.3) * 1.5
        let fresh = unit("f", 0.5, 0, now);
        assert!((priority_score(&fresh, &config, now) - 1.2).abs() < 1e-9);
        // recency has fully decayed at 30 days
        let stale = unit("s", 0.5, 30, now);
        assert!((priority_score(&stale, &config, now) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn fit_stops_at_budget() {
        let now = Utc::now();
        let est = TokenEstimator::CONTEXT;
        let mut items: Vec<MemoryUnit> = (0..5).map(|i| unit(&i.to_string(), 0.5, 0, now)).collect();
        for m in &mut items {
            m.content = "x".repeat(40); // 10 tokens
        }
        let (kept, total, truncated) = fit_to_window(items.clone(), 35, &est);
        assert_eq!(kept.len(), 3);
        assert_eq!(total, 30);
        assert!(truncated);
        assert_eq!(kept, items[..3].to_vec());

        let (kept, _, truncated) = fit_to_window(items, 50, &est);
        assert_eq!(kept.len(), 5);
        assert!(!truncated);
    }

    #[test]
    fn compress_merges_by_reference_key() {
        let now = Utc::now();
        let mut items = Vec::new();
        for i in 0..20 {
            let mut m = unit(&format!("m{i}"), 0.1 + (i as f64) * 0.01, 1, now);
            m.metadata.insert("entity_id", format!("deal-{}", i % 4));
            items.push(m);
        }
        let merged = compress(items);
        assert_eq!(merged.len(), 4);
        for m in &merged {
            assert!(m.compressed);
            assert_eq!(m.original_memory_ids.len(), 5);
            assert!(m.content.contains("Additional context:"));
        }
        // highest importance member of group 0 is m16
        assert_eq!(merged[0].id, "m16");
    }

    #[test]
    fn compress_keeps_unkeyed_and_singletons() {
        let now = Utc::now();
        let mut a = unit("a", 0.5, 0, now);
        a.metadata.insert("contact_id", "c1");
        let b = unit("b", 0.5, 0, now);
        let mut c = unit("c", 0.5, 0, now);
        c.memory_type = MemoryType::Deal;
        c.metadata.insert("contact_id", "c1");
        let merged = compress(vec![a, b, c]);
        assert_eq!(merged.len(), 3);
        assert!(merged.iter().all(|m| !m.compressed));
    }

    #[test]
    fn compress_groups_on_any_shared_reference_key() {
        let now = Utc::now();
        let mut a = unit("a", 0.4, 0, now);
        a.metadata.insert("entity_id", "e1");
        a.metadata.insert("contact_id", "c1");
        let mut b = unit("b", 0.6, 0, now);
        b.metadata.insert("contact_id", "c1");
        let merged = compress(vec![a, b]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, "b");
        assert_eq!(merged[0].original_memory_ids, vec!["b", "a"]);

        // x and y start separate groups; z links them through both keys.
        let mut x = unit("x", 0.5, 0, now);
        x.metadata.insert("deal_id", "d1");
        let plain = unit("plain", 0.5, 0, now);
        let mut y = unit("y", 0.5, 0, now);
        y.metadata.insert("customer_id", "k1");
        let mut z = unit("z", 0.9, 0, now);
        z.metadata.insert("deal_id", "d1");
        z.metadata.insert("customer_id", "k1");
        let mut w = unit("w", 0.1, 0, now);
        w.metadata.insert("customer_id", "k1");
        let merged = compress(vec![x, plain, y, z, w]);
        let ids: Vec<&str> = merged.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "plain"]);
        assert_eq!(merged[0].original_memory_ids, vec!["z", "x", "y", "w"]);
    }

    struct Fixture {
        index: Arc<InMemoryMemoryIndex>,
        errors: Arc<ErrorSink>,
        assembler: ContextAssembler,
        now: DateTime<Utc>,
    }

    fn fixture_with(tiers: Arc<dyn TierResolver>) -> Fixture {
        let now = Utc::now();
        let index = Arc::new(InMemoryMemoryIndex::new());
        let errors = Arc::new(ErrorSink::new());
        let assembler = ContextAssembler::new(
            index.clone(),
            index.clone(),
            Arc::new(HashingEmbedder::default()),
            tiers,
            errors.clone(),
            Arc::new(ManualClock::new(now)),
        );
        Fixture {
            index,
            errors,
            assembler,
            now,
        }
    }

    async fn seed(f: &Fixture, id: &str, content: &str, entity: Option<&str>, age_days: i64) {
        let embedder = HashingEmbedder::default();
        let mut metadata = Metadata::new();
        if let Some(e) = entity {
            metadata.insert("entity_id", e);
        }
        f.index
            .insert(&MemoryRecord {
                id: id.into(),
                organization_id: OrganizationId::new("org").unwrap(),
                user_id: None,
                shared: true,
                memory_type: MemoryType::Deal,
                content: content.into(),
                importance_score: 0.5,
                created_at: f.now - Duration::days(age_days),
                metadata,
                embedding: embedder.embed_sync(content),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn build_respects_budget_and_records_access() {
        let f = fixture_with(Arc::new(DefaultTiers));
        for i in 0..20 {
            let content = format!("deal pipeline status update {} {}", i, "detail ".repeat(30));
            seed(&f, &format!("m{i}"), &content, Some(&format!("deal-{}", i % 4)), 1).await;
        }
        let org = OrganizationId::new("org").unwrap();
        let overrides = ContextOverrides {
            max_context_size: Some(800),
            relevance_threshold: Some(0.3),
            ..Default::default()
        };
        let result = f
            .assembler
            .build_optimized_context("deal pipeline status update detail", &org, None, Some(&overrides))
            .await;

        assert_eq!(result.metadata.total_candidates, 20);
        assert_eq!(result.metadata.compressed_count, 4);
        assert!(result.total_tokens <= 800);
        assert!(result.truncated);
        assert!(!result.memories.is_empty());
        let recorded: usize = result.memories.iter().map(|m| m.original_memory_ids.len()).sum();
        assert_eq!(f.index.accesses().len(), recorded);
    }

    #[tokio::test]
    async fn short_term_only_when_long_term_disabled() {
        let f = fixture_with(Arc::new(DefaultTiers));
        seed(&f, "recent", "customer asked about delivery", None, 2).await;
        seed(&f, "old", "customer asked about delivery", None, 20).await;
        let org = OrganizationId::new("org").unwrap();
        let overrides = ContextOverrides {
            enable_long_term_memory: Some(false),
            ..Default::default()
        };
        let result = f
            .assembler
            .build_optimized_context("customer asked about delivery", &org, None, Some(&overrides))
            .await;
        let ids: Vec<&str> = result.memories.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["recent"]);
        assert!(!result.truncated);
    }

    struct FailingRecorder;

    #[async_trait]
    impl AccessRecorder for FailingRecorder {
        async fn record_access(&self, _: &AccessRecord) -> Result<()> {
            anyhow::bail!("log table locked")
        }
    }

    #[tokio::test]
    async fn access_log_failures_are_swallowed() {
        let now = Utc::now();
        let index = Arc::new(InMemoryMemoryIndex::new());
        let errors = Arc::new(ErrorSink::new());
        let assembler = ContextAssembler::new(
            index.clone(),
            Arc::new(FailingRecorder),
            Arc::new(HashingEmbedder::default()),
            Arc::new(DefaultTiers),
            errors.clone(),
            Arc::new(ManualClock::new(now)),
        );
        let embedder = HashingEmbedder::default();
        index
            .insert(&MemoryRecord {
                id: "m1".into(),
                organization_id: OrganizationId::new("org").unwrap(),
                user_id: None,
                shared: false,
                memory_type: MemoryType::Contact,
                content: "prefers phone calls".into(),
                importance_score: 0.8,
                created_at: now,
                metadata: Metadata::new(),
                embedding: embedder.embed_sync("prefers phone calls"),
            })
            .await
            .unwrap();

        let org = OrganizationId::new("org").unwrap();
        let result = assembler.build_optimized_context("prefers phone calls", &org, None, None).await;
        assert_eq!(result.memories.len(), 1);
        assert_eq!(errors.count(ErrorCategory::AccessLog), 1);
    }

    struct BrokenIndex;

    #[async_trait]
    impl MemoryIndex for BrokenIndex {
        async fn search(&self, _: &MemoryQuery) -> Result<Vec<MemoryUnit>> {
            anyhow::bail!("index unavailable")
        }
        async fn insert(&self, _: &MemoryRecord) -> Result<()> {
            anyhow::bail!("index unavailable")
        }
    }

    #[tokio::test]
    async fn pipeline_error_returns_error_marker() {
        let errors = Arc::new(ErrorSink::new());
        let assembler = ContextAssembler::new(
            Arc::new(BrokenIndex),
            Arc::new(InMemoryMemoryIndex::new()),
            Arc::new(HashingEmbedder::default()),
            Arc::new(DefaultTiers),
            errors.clone(),
            Arc::new(ManualClock::new(Utc::now())),
        );
        let org = OrganizationId::new("org").unwrap();
        let result = assembler.build_optimized_context("anything", &org, None, None).await;
        assert!(result.memories.is_empty());
        assert!(!result.truncated);
        assert!(result.is_error());
        assert_eq!(errors.count(ErrorCategory::ContextBuild), 1);
    }

    struct PlanTiers {
        fail_plan: bool,
    }

    #[async_trait]
    impl TierResolver for PlanTiers {
        async fn plan_for(&self, _: &OrganizationId) -> Result<Option<String>> {
            if self.fail_plan {
                anyhow::bail!("subscriptions table missing")
            }
            Ok(Some("pro".into()))
        }

        fn tier_overrides(&self, plan: &str) -> Option<ContextOverrides> {
            (plan == "pro").then(|| ContextOverrides {
                max_context_size: Some(8000),
                recency_weight: Some(0.1),
                ..Default::default()
            })
        }

        async fn user_overrides(&self, _: &OrganizationId, _: &str) -> Result<Option<ContextOverrides>> {
            Ok(Some(ContextOverrides {
                recency_weight: Some(0.9),
                ..Default::default()
            }))
        }
    }

    #[tokio::test]
    async fn resolve_layers_tier_then_user() {
        let errors = ErrorSink::new();
        let org = OrganizationId::new("org").unwrap();
        let (config, plan) =
            ContextConfig::resolve(&PlanTiers { fail_plan: false }, &org, Some("u1"), None, &errors).await;
        assert_eq!(plan.as_deref(), Some("pro"));
        assert_eq!(config.max_context_size, 8000);
        assert_eq!(config.recency_weight, 0.9);

        let (config, plan) =
            ContextConfig::resolve(&PlanTiers { fail_plan: true }, &org, None, None, &errors).await;
        assert_eq!(plan, None);
        assert_eq!(config, ContextConfig::default());
        assert_eq!(errors.count(ErrorCategory::TierLookup), 1);
    }
}
