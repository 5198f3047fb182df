//! Multi-language e-commerce catalog adapter.
//!
//! Catalog entries arrive per store view (one language each). Every entry
//! is tagged with its store's `language`, `country`, `currency` and
//! `store` so retrieval can be filtered to one storefront.
//!
//! [`CatalogAdapter::recommend`] is the adapter's own reply flow: detect the
//! language of an incoming email, resolve the store (falling back to the
//! configured default language), retrieve catalog chunks for that store,
//! score the email's tone, and fill the canned reply skeleton.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crm_rag_core::language::{
    reply_skeleton, resolve_store, store_config, LanguageDetector, Sentiment, SentimentScorer,
};
use crm_rag_core::models::{ContentItem, Metadata, OrganizationId, RetrievedChunk, SourceType};
use crm_rag_core::pipeline::{IngestOptions, IngestionPipeline};
use crm_rag_core::retrieve::{RetrievalEngine, RetrievalOptions};
use crm_rag_core::RagError;

use crate::ingest::{run_batch, IngestReport};

/// One catalog product as exported for a single store view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogProduct {
    pub sku: String,
    pub name: String,
    /// Two-letter store-view language.
    pub language: String,
    pub description: Option<String>,
    pub short_description: Option<String>,
    pub category: Option<String>,
    pub price: Option<f64>,
    pub special_price: Option<f64>,
    pub in_stock: Option<bool>,
    pub url_key: Option<String>,
    pub attributes: Metadata,
}

/// Read a JSON array of catalog products.
pub fn load_catalog_file(path: &Path) -> Result<Vec<CatalogProduct>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read catalog file: {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| "Failed to parse catalog file")
}

pub fn catalog_content(product: &CatalogProduct) -> Result<ContentItem, RagError> {
    let store = store_config(&product.language).ok_or_else(|| RagError::InvalidMetadata {
        key: "language".into(),
        reason: format!("no store configured for '{}'", product.language),
    })?;

    let mut lines = vec![format!("Product: {}", product.name), format!("SKU: {}", product.sku)];
    if let Some(c) = &product.category {
        lines.push(format!("Category: {c}"));
    }
    match (product.price, product.special_price) {
        (Some(p), Some(s)) if s < p => {
            lines.push(format!("Price: {s:.2} {} (regular {p:.2})", store.currency))
        }
        (Some(p), _) => lines.push(format!("Price: {p:.2} {}", store.currency)),
        _ => {}
    }
    if let Some(in_stock) = product.in_stock {
        lines.push(format!("Availability: {}", if in_stock { "in stock" } else { "out of stock" }));
    }
    if let Some(s) = product.short_description.as_deref().filter(|s| !s.trim().is_empty()) {
        lines.push(format!("\n{}", s.trim()));
    }
    if let Some(d) = product.description.as_deref().filter(|d| !d.trim().is_empty()) {
        lines.push(format!("\n{}", d.trim()));
    }
    if !product.attributes.is_empty() {
        let attrs: Vec<String> = product
            .attributes
            .iter()
            .map(|(k, v)| format!("- {k}: {}", v.display()))
            .collect();
        lines.push(format!("\nAttributes:\n{}", attrs.join("\n")));
    }

    let mut metadata = Metadata::new()
        .with("sku", product.sku.clone())
        .with("language", store.language)
        .with("country", store.country)
        .with("currency", store.currency)
        .with("store", store.store_code);
    if let Some(c) = &product.category {
        metadata.insert("category", c.clone());
    }
    if let Some(p) = product.special_price.or(product.price) {
        metadata.insert("price", p);
    }
    if let Some(url) = &product.url_key {
        metadata.insert("url_key", url.clone());
    }

    Ok(ContentItem {
        title: product.name.clone(),
        content: lines.join("\n"),
        source_type: SourceType::Magento,
        source_id: format!("{}:{}", product.sku, store.store_code),
        metadata,
    })
}

/// Outcome of the catalog reply flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogRecommendation {
    pub language: String,
    /// False when the language came from the fallback.
    pub detected: bool,
    pub store_code: String,
    pub sentiment: Sentiment,
    pub products: Vec<RetrievedChunk>,
    pub reply: String,
}

pub struct CatalogAdapter {
    pipeline: Arc<IngestionPipeline>,
    retrieval: Arc<RetrievalEngine>,
    detector: Arc<dyn LanguageDetector>,
    sentiment: Arc<dyn SentimentScorer>,
    default_language: String,
    delay: Duration,
}

impl CatalogAdapter {
    pub fn new(
        pipeline: Arc<IngestionPipeline>,
        retrieval: Arc<RetrievalEngine>,
        detector: Arc<dyn LanguageDetector>,
        sentiment: Arc<dyn SentimentScorer>,
        default_language: impl Into<String>,
        delay: Duration,
    ) -> Self {
        Self {
            pipeline,
            retrieval,
            detector,
            sentiment,
            default_language: default_language.into(),
            delay,
        }
    }

    pub async fn ingest(
        &self,
        org: &OrganizationId,
        products: Vec<CatalogProduct>,
        options: &IngestOptions,
    ) -> IngestReport {
        let pipeline = &self.pipeline;
        run_batch(
            "catalog",
            org,
            products,
            self.delay,
            |p| format!("{}:{}", p.sku, p.language),
            |p| async move {
                let item = catalog_content(&p)?;
                pipeline.ingest_content(org, &item, options).await
            },
        )
        .await
    }

    /// Build a templated reply with catalog suggestions for `email_body`.
    ///
    /// `base` supplies the limit and threshold; source type and store
    /// filters are set here.
    pub async fn recommend(
        &self,
        org: &OrganizationId,
        email_body: &str,
        base: &RetrievalOptions,
    ) -> CatalogRecommendation {
        let matched = resolve_store(self.detector.as_ref(), email_body, &self.default_language);
        let store = matched.store;

        let options = base
            .clone()
            .with_source_types(&[SourceType::Magento])
            .with_filter("language", store.language)
            .with_filter("country", store.country);
        let result = self.retrieval.retrieve(email_body, org, &options).await;

        let mut names: Vec<String> = Vec::new();
        for chunk in &result.chunks {
            if !names.contains(&chunk.title) {
                names.push(chunk.title.clone());
            }
        }

        let sentiment = self.sentiment.score(email_body);
        let reply = reply_skeleton(store.language, &sentiment, &names);

        tracing::info!(
            organization_id = %org,
            language = store.language,
            detected = matched.detected,
            products = names.len(),
            "catalog recommendation built"
        );

        CatalogRecommendation {
            language: store.language.to_string(),
            detected: matched.detected,
            store_code: store.store_code.to_string(),
            sentiment,
            products: result.chunks,
            reply,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roof_box(language: &str, name: &str) -> CatalogProduct {
        CatalogProduct {
            sku: "RB-420".into(),
            name: name.into(),
            language: language.into(),
            price: Some(249.0),
            special_price: Some(199.0),
            in_stock: Some(true),
            ..CatalogProduct::default()
        }
    }

    #[test]
    fn entries_carry_store_metadata() {
        let item = catalog_content(&roof_box("pl", "Box dachowy 420L")).unwrap();
        assert_eq!(item.source_id, "RB-420:pl");
        assert_eq!(item.metadata.get_str("currency"), Some("PLN"));
        assert_eq!(item.metadata.get_str("country"), Some("PL"));
        assert_eq!(item.metadata.get_f64("price"), Some(199.0));
        assert!(item.content.contains("Price: 199.00 PLN (regular 249.00)"));
        assert!(item.metadata.validate().is_ok());
    }

    #[test]
    fn unknown_store_language_is_rejected() {
        assert!(catalog_content(&roof_box("xx", "Roof box")).is_err());
    }

    #[test]
    fn catalog_file_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"[{"sku": "A1", "name": "Dachbox", "language": "de", "attributes": {"volume_l": 420}}]"#,
        )
        .unwrap();
        let products = load_catalog_file(&path).unwrap();
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].attributes.get_f64("volume_l"), Some(420.0));
    }
}
