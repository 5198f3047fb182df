//! Subscription-tier and user-setting lookups for context assembly.
//!
//! The plan comes from the organization's newest active row in
//! `organization_subscriptions`, falling back to `context.default_plan`.
//! Per-plan settings come from `[context.tiers.<plan>]` in the config file;
//! per-user settings are JSON in `user_context_settings`. Both database
//! lookups are cached for `context.cache_ttl_secs`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crm_rag_core::cache::{Clock, TtlCache};
use crm_rag_core::context::{ContextOverrides, TierResolver};
use crm_rag_core::models::OrganizationId;

use crate::config::ContextSettings;

pub struct ConfigTierResolver {
    pool: SqlitePool,
    tiers: HashMap<String, ContextOverrides>,
    default_plan: Option<String>,
    plans: TtlCache<OrganizationId, Option<String>>,
    users: TtlCache<(OrganizationId, String), Option<ContextOverrides>>,
}

impl ConfigTierResolver {
    pub fn new(pool: SqlitePool, settings: &ContextSettings, clock: Arc<dyn Clock>) -> Self {
        let ttl = Duration::from_secs(settings.cache_ttl_secs);
        Self {
            pool,
            tiers: settings.tiers.clone(),
            default_plan: settings.default_plan.clone(),
            plans: TtlCache::new(ttl, clock.clone()),
            users: TtlCache::new(ttl, clock),
        }
    }

    /// Insert or replace a user's context settings and drop the cached copy.
    pub async fn set_user_overrides(
        &self,
        org: &OrganizationId,
        user_id: &str,
        overrides: &ContextOverrides,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_context_settings (organization_id, user_id, settings_json)
            VALUES (?, ?, ?)
            ON CONFLICT(organization_id, user_id) DO UPDATE SET
                settings_json = excluded.settings_json
            "#,
        )
        .bind(org.as_str())
        .bind(user_id)
        .bind(serde_json::to_string(overrides)?)
        .execute(&self.pool)
        .await?;
        self.users.invalidate(&(org.clone(), user_id.to_string()));
        Ok(())
    }

    /// Record a subscription and drop the cached plan.
    pub async fn set_plan(&self, org: &OrganizationId, plan: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO organization_subscriptions (organization_id, plan, status, created_at) VALUES (?, ?, 'active', ?)",
        )
        .bind(org.as_str())
        .bind(plan)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        self.plans.invalidate(org);
        Ok(())
    }
}

#[async_trait]
impl TierResolver for ConfigTierResolver {
    async fn plan_for(&self, org: &OrganizationId) -> Result<Option<String>> {
        if let Some(plan) = self.plans.get(org) {
            return Ok(plan);
        }

        let row: Option<String> = sqlx::query_scalar(
            r#"
            SELECT plan FROM organization_subscriptions
            WHERE organization_id = ? AND status = 'active'
            ORDER BY created_at DESC LIMIT 1
            "#,
        )
        .bind(org.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let plan = row.or_else(|| self.default_plan.clone());
        self.plans.insert(org.clone(), plan.clone());
        Ok(plan)
    }

    fn tier_overrides(&self, plan: &str) -> Option<ContextOverrides> {
        self.tiers.get(plan).cloned()
    }

    async fn user_overrides(
        &self,
        org: &OrganizationId,
        user_id: &str,
    ) -> Result<Option<ContextOverrides>> {
        let key = (org.clone(), user_id.to_string());
        if let Some(cached) = self.users.get(&key) {
            return Ok(cached);
        }

        let json: Option<String> = sqlx::query_scalar(
            "SELECT settings_json FROM user_context_settings WHERE organization_id = ? AND user_id = ?",
        )
        .bind(org.as_str())
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let overrides = match json {
            Some(j) => Some(
                serde_json::from_str::<ContextOverrides>(&j)
                    .with_context(|| format!("bad context settings for user {user_id}"))?,
            ),
            None => None,
        };
        self.users.insert(key, overrides.clone());
        Ok(overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_rag_core::cache::ManualClock;

    async fn resolver(settings: ContextSettings) -> (tempfile::TempDir, ConfigTierResolver, Arc<ManualClock>) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect_path(&dir.path().join("t.sqlite")).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let resolver = ConfigTierResolver::new(pool, &settings, clock.clone());
        (dir, resolver, clock)
    }

    #[tokio::test]
    async fn plan_falls_back_to_default_and_is_cached() {
        let mut settings = ContextSettings {
            default_plan: Some("basic".to_string()),
            ..ContextSettings::default()
        };
        settings.tiers.insert(
            "pro".to_string(),
            ContextOverrides {
                max_context_size: Some(8000),
                ..ContextOverrides::default()
            },
        );
        let (_dir, resolver, clock) = resolver(settings).await;
        let org = OrganizationId::new("org-1").unwrap();

        assert_eq!(resolver.plan_for(&org).await.unwrap().as_deref(), Some("basic"));

        // Written behind the cache's back: still stale until the TTL passes.
        sqlx::query("INSERT INTO organization_subscriptions (organization_id, plan, status, created_at) VALUES (?, 'pro', 'active', 1)")
            .bind(org.as_str())
            .execute(&resolver.pool)
            .await
            .unwrap();
        assert_eq!(resolver.plan_for(&org).await.unwrap().as_deref(), Some("basic"));

        clock.advance(Duration::from_secs(301));
        assert_eq!(resolver.plan_for(&org).await.unwrap().as_deref(), Some("pro"));
        assert_eq!(resolver.tier_overrides("pro").unwrap().max_context_size, Some(8000));
        assert!(resolver.tier_overrides("enterprise").is_none());
    }

    #[tokio::test]
    async fn user_overrides_roundtrip() {
        let (_dir, resolver, _clock) = resolver(ContextSettings::default()).await;
        let org = OrganizationId::new("org-1").unwrap();
        assert!(resolver.user_overrides(&org, "u1").await.unwrap().is_none());

        let o = ContextOverrides {
            enable_memory_compression: Some(false),
            ..ContextOverrides::default()
        };
        resolver.set_user_overrides(&org, "u1", &o).await.unwrap();
        assert_eq!(resolver.user_overrides(&org, "u1").await.unwrap(), Some(o));
    }
}
