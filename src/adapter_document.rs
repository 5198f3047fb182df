//! Document adapter: uploaded documents with previously extracted data.
//!
//! Text extraction happens elsewhere. This adapter renders whatever was
//! stored (extracted text and/or a structured JSON payload) and falls back
//! to a metadata-only block when nothing was extracted. After each
//! document the `processing_status` column is written back: `rag_indexed`
//! on success, `rag_failed` with the error message otherwise.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crm_rag_core::models::{ContentItem, Metadata, OrganizationId, SourceType};
use crm_rag_core::pipeline::{IngestOptions, IngestOutcome, IngestionPipeline};

use crate::ingest::{run_batch, IngestReport};
use crate::tenant::{ProcessingStatus, TenantDocument, TenantStore};

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(render_value)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{k}={}", render_value(v)))
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

/// Render extracted structured data as `Label: value` lines, one per
/// top-level key. Nested values are flattened onto one line.
pub fn format_extracted_data(data: &serde_json::Value) -> String {
    match data {
        serde_json::Value::Object(map) => map
            .iter()
            .filter_map(|(k, v)| {
                let rendered = render_value(v);
                (!rendered.is_empty()).then(|| format!("{}: {}", humanize(k), rendered))
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => render_value(other),
    }
}

fn humanize(key: &str) -> String {
    let spaced = key.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => spaced,
    }
}

pub fn format_document(doc: &TenantDocument) -> String {
    let mut sections = vec![format!("Document: {}", doc.title)];
    if let Some(t) = &doc.document_type {
        sections.push(format!("Type: {t}"));
    }

    let text = doc.extracted_text.as_deref().filter(|t| !t.trim().is_empty());
    let data = doc
        .extracted_data
        .as_ref()
        .map(format_extracted_data)
        .filter(|d| !d.trim().is_empty());

    if text.is_none() && data.is_none() {
        if let Some(f) = &doc.file_name {
            sections.push(format!("File: {f}"));
        }
        if let Some(l) = &doc.language {
            sections.push(format!("Language: {l}"));
        }
        sections.push(format!("Uploaded: {}", doc.created_at.format("%Y-%m-%d")));
        return sections.join("\n");
    }

    if let Some(d) = data {
        sections.push(format!("\nExtracted data:\n{d}"));
    }
    if let Some(t) = text {
        sections.push(format!("\nContent:\n{}", t.trim()));
    }
    sections.join("\n")
}

pub fn document_content(doc: &TenantDocument) -> ContentItem {
    let mut metadata = Metadata::new()
        .with("document_id", doc.id.clone())
        .with("created_at", doc.created_at.to_rfc3339())
        .with(
            "has_extracted_text",
            doc.extracted_text.as_deref().is_some_and(|t| !t.trim().is_empty()),
        );
    if let Some(t) = &doc.document_type {
        metadata.insert("document_type", t.clone());
    }
    if let Some(f) = &doc.file_name {
        metadata.insert("file_name", f.clone());
    }
    if let Some(l) = doc
        .language
        .as_deref()
        .filter(|l| l.len() == 2 && l.chars().all(|c| c.is_ascii_alphabetic()))
    {
        metadata.insert("language", l.to_ascii_lowercase());
    }

    ContentItem {
        title: doc.title.clone(),
        content: format_document(doc),
        source_type: SourceType::Document,
        source_id: doc.id.clone(),
        metadata,
    }
}

pub struct DocumentAdapter {
    tenant: Arc<dyn TenantStore>,
    pipeline: Arc<IngestionPipeline>,
    delay: Duration,
}

impl DocumentAdapter {
    pub fn new(tenant: Arc<dyn TenantStore>, pipeline: Arc<IngestionPipeline>, delay: Duration) -> Self {
        Self {
            tenant,
            pipeline,
            delay,
        }
    }

    /// Ingest every document not yet indexed.
    pub async fn sync_pending(&self, org: &OrganizationId, options: &IngestOptions) -> Result<IngestReport> {
        let docs = self.tenant.list_unindexed_documents(org).await?;
        Ok(self.ingest(org, docs, options).await)
    }

    pub async fn ingest(
        &self,
        org: &OrganizationId,
        docs: Vec<TenantDocument>,
        options: &IngestOptions,
    ) -> IngestReport {
        run_batch(
            "documents",
            org,
            docs,
            self.delay,
            |d| d.id.clone(),
            |d| async move { self.ingest_one(org, &d, options).await },
        )
        .await
    }

    /// Ingest one document and write its processing status back.
    pub async fn ingest_one(
        &self,
        org: &OrganizationId,
        doc: &TenantDocument,
        options: &IngestOptions,
    ) -> Result<IngestOutcome> {
        let result = self
            .pipeline
            .ingest_content(org, &document_content(doc), options)
            .await;

        match &result {
            Ok(_) => {
                self.tenant
                    .set_document_status(org, &doc.id, ProcessingStatus::RagIndexed, None)
                    .await?;
            }
            Err(e) => {
                let message = format!("{e:#}");
                if let Err(write_err) = self
                    .tenant
                    .set_document_status(org, &doc.id, ProcessingStatus::RagFailed, Some(&message))
                    .await
                {
                    tracing::warn!(organization_id = %org, document_id = %doc.id, error = %write_err, "failed to record document failure status");
                }
            }
        }
        result
    }
}
