//! Product adapter: local catalog rows → knowledge entries.
//!
//! Each product is enriched with its price-list rows (reduced to
//! min/max/average), supplier names and reliability scores, and the ERP
//! mapping code, then rendered through the core product record as one
//! multi-section text block. Products chunk with the smaller product
//! defaults unless the caller overrides them.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crm_rag_core::chunk::{format_product, ChunkConfig, ProductRecord};
use crm_rag_core::models::{ContentItem, Metadata, OrganizationId, SourceType};
use crm_rag_core::pipeline::{IngestOptions, IngestOutcome, IngestionPipeline};

use crate::ingest::{run_batch, IngestReport};
use crate::tenant::{PriceRow, TenantProduct, TenantStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceSummary {
    pub min: f64,
    pub max: f64,
    pub average: f64,
    pub currency: String,
    pub count: usize,
}

/// Reduce price-list rows to min/max/average. The currency is the first
/// row's; rows are expected to share one.
pub fn summarize_prices(prices: &[PriceRow]) -> Option<PriceSummary> {
    let first = prices.first()?;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;
    for p in prices {
        min = min.min(p.price);
        max = max.max(p.price);
        sum += p.price;
    }
    Some(PriceSummary {
        min,
        max,
        average: sum / prices.len() as f64,
        currency: first.currency.clone(),
        count: prices.len(),
    })
}

/// Map a catalog row onto the core product record. Unit, pricing,
/// suppliers and the ERP mapping become ordered specification lines;
/// free-form metadata becomes the attribute section.
pub fn product_record(product: &TenantProduct) -> ProductRecord {
    let mut specifications = Vec::new();
    if let Some(unit) = &product.unit {
        specifications.push(("Unit".to_string(), unit.clone()));
    }

    if let Some(p) = summarize_prices(&product.prices) {
        if p.count == 1 {
            specifications.push(("Price".into(), format!("{:.2} {}", p.min, p.currency)));
        } else {
            specifications.push((
                "Price range".into(),
                format!("{:.2} - {:.2} {}", p.min, p.max, p.currency),
            ));
            specifications.push((
                "Average price".into(),
                format!("{:.2} {} ({} price lists)", p.average, p.currency, p.count),
            ));
        }
    }

    if !product.suppliers.is_empty() {
        let suppliers: Vec<String> = product
            .suppliers
            .iter()
            .map(|s| match s.reliability_score {
                Some(score) => format!("{} (reliability {:.2})", s.name, score),
                None => s.name.clone(),
            })
            .collect();
        specifications.push(("Suppliers".into(), suppliers.join(", ")));
    }

    if let Some(erp) = &product.erp {
        specifications.push((
            "ERP code".into(),
            format!("{} (sync status: {})", erp.external_code, erp.sync_status),
        ));
    }

    ProductRecord {
        name: product.name.clone(),
        sku: product.sku.clone(),
        category: product.category.clone(),
        description: product.description.clone(),
        specifications,
        attributes: product.metadata.clone(),
    }
}

pub fn product_content(product: &TenantProduct) -> ContentItem {
    let mut metadata = Metadata::new()
        .with("product_id", product.id.clone())
        .with("updated_at", product.updated_at.to_rfc3339());
    if let Some(sku) = &product.sku {
        metadata.insert("sku", sku.clone());
    }
    if let Some(category) = &product.category {
        metadata.insert("category", category.clone());
    }
    if let Some(p) = summarize_prices(&product.prices) {
        metadata.insert("price", p.min);
        metadata.insert("price_max", p.max);
        metadata.insert("currency", p.currency);
    }
    if let Some(erp) = &product.erp {
        metadata.insert("erp_code", erp.external_code.clone());
    }

    ContentItem {
        title: product.name.clone(),
        content: format_product(&product_record(product)),
        source_type: SourceType::Product,
        source_id: product.id.clone(),
        metadata,
    }
}

pub struct ProductAdapter {
    tenant: Arc<dyn TenantStore>,
    pipeline: Arc<IngestionPipeline>,
    delay: Duration,
}

impl ProductAdapter {
    pub fn new(tenant: Arc<dyn TenantStore>, pipeline: Arc<IngestionPipeline>, delay: Duration) -> Self {
        Self {
            tenant,
            pipeline,
            delay,
        }
    }

    fn options(options: &IngestOptions) -> IngestOptions {
        let defaults = ChunkConfig::for_products();
        IngestOptions {
            skip_if_exists: options.skip_if_exists,
            chunk_size: options.chunk_size.or(Some(defaults.chunk_size)),
            chunk_overlap: options.chunk_overlap.or(Some(defaults.chunk_overlap)),
        }
    }

    /// Ingest every product of the organization.
    pub async fn sync_all(&self, org: &OrganizationId, options: &IngestOptions) -> Result<IngestReport> {
        let products = self.tenant.list_products(org).await?;
        Ok(self.ingest(org, products, options).await)
    }

    pub async fn ingest(
        &self,
        org: &OrganizationId,
        products: Vec<TenantProduct>,
        options: &IngestOptions,
    ) -> IngestReport {
        let options = Self::options(options);
        let pipeline = &self.pipeline;
        let opts = &options;
        run_batch(
            "products",
            org,
            products,
            self.delay,
            |p| p.id.clone(),
            |p| async move { pipeline.ingest_content(org, &product_content(&p), opts).await },
        )
        .await
    }

    /// Re-ingest one product. A product that no longer exists has its
    /// entries removed.
    pub async fn sync_product(
        &self,
        org: &OrganizationId,
        product_id: &str,
        options: &IngestOptions,
    ) -> Result<Option<IngestOutcome>> {
        match self.tenant.get_product(org, product_id).await? {
            Some(p) => {
                let outcome = self
                    .pipeline
                    .ingest_content(org, &product_content(&p), &Self::options(options))
                    .await?;
                Ok(Some(outcome))
            }
            None => {
                self.pipeline
                    .store()
                    .delete_source(org, SourceType::Product, product_id)
                    .await?;
                Ok(None)
            }
        }
    }
}
