//! ERP adapter: products, customers and orders from the ERP integration.
//!
//! [`ErpAdapter::full_sync`] pulls the consolidated AI-context snapshot and
//! ingests each collection in turn. [`ErpAdapter::sync_by_id`] refreshes a
//! single record (removing it when the ERP no longer has it) and
//! [`ErpAdapter::cleanup_stale`] evicts ERP entries older than a cutoff.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crm_rag_core::erp::{
    erp_source_id, format_customer, format_order, format_product, format_record, ErpClient,
    ErpRecordKind,
};
use crm_rag_core::models::{ContentItem, OrganizationId, SourceType};
use crm_rag_core::pipeline::{IngestOptions, IngestOutcome, IngestionPipeline};

use crate::ingest::{run_batch, IngestReport};

/// Per-collection reports of one full sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErpSyncReport {
    pub products: IngestReport,
    pub customers: IngestReport,
    pub orders: IngestReport,
}

impl ErpSyncReport {
    pub fn total(&self) -> IngestReport {
        let mut total = IngestReport::default();
        total.merge(self.products.clone());
        total.merge(self.customers.clone());
        total.merge(self.orders.clone());
        total
    }
}

pub struct ErpAdapter {
    erp: Arc<dyn ErpClient>,
    pipeline: Arc<IngestionPipeline>,
    delay: Duration,
}

impl ErpAdapter {
    pub fn new(erp: Arc<dyn ErpClient>, pipeline: Arc<IngestionPipeline>, delay: Duration) -> Self {
        Self {
            erp,
            pipeline,
            delay,
        }
    }

    async fn ingest_items(
        &self,
        label: &str,
        org: &OrganizationId,
        items: Vec<ContentItem>,
        options: &IngestOptions,
    ) -> IngestReport {
        let pipeline = &self.pipeline;
        run_batch(
            label,
            org,
            items,
            self.delay,
            |item| item.source_id.clone(),
            |item| async move { pipeline.ingest_content(org, &item, options).await },
        )
        .await
    }

    /// Fetch the AI-context snapshot and ingest every collection.
    ///
    /// A failed snapshot fetch is an error; per-record failures land in the
    /// collection reports.
    pub async fn full_sync(&self, org: &OrganizationId, options: &IngestOptions) -> Result<ErpSyncReport> {
        let ctx = self
            .erp
            .get_ai_context(org)
            .await
            .with_context(|| format!("fetching ERP context for {org}"))?;

        tracing::info!(
            organization_id = %org,
            products = ctx.products.len(),
            customers = ctx.customers.len(),
            orders = ctx.orders.len(),
            "ERP snapshot fetched"
        );

        let products = ctx.products.iter().map(format_product).collect();
        let customers = ctx.customers.iter().map(format_customer).collect();
        let orders = ctx.orders.iter().map(format_order).collect();

        Ok(ErpSyncReport {
            products: self.ingest_items("erp_products", org, products, options).await,
            customers: self.ingest_items("erp_customers", org, customers, options).await,
            orders: self.ingest_items("erp_orders", org, orders, options).await,
        })
    }

    /// Refresh one record. `Ok(None)` means the ERP no longer has it and its
    /// entries were removed.
    pub async fn sync_by_id(
        &self,
        org: &OrganizationId,
        kind: ErpRecordKind,
        id: &str,
        options: &IngestOptions,
    ) -> Result<Option<IngestOutcome>> {
        match self.erp.get_record(org, kind, id).await? {
            Some(record) => {
                let item = format_record(&record);
                Ok(Some(self.pipeline.ingest_content(org, &item, options).await?))
            }
            None => {
                let removed = self
                    .pipeline
                    .store()
                    .delete_source(org, SourceType::Metakocka, &erp_source_id(kind, id))
                    .await?;
                tracing::info!(organization_id = %org, kind = %kind, id, removed, "ERP record gone, entries removed");
                Ok(None)
            }
        }
    }

    /// Delete ERP entries older than `days`.
    pub async fn cleanup_stale(&self, org: &OrganizationId, days: i64) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(days);
        let removed = self
            .pipeline
            .store()
            .delete_older_than(org, Some(SourceType::Metakocka), cutoff)
            .await?;
        tracing::info!(organization_id = %org, days, removed, "stale ERP entries removed");
        Ok(removed)
    }
}
