//! Record-by-record batch runner shared by the source adapters.
//!
//! Records are ingested one at a time with a fixed pause between them to
//! stay under downstream rate limits. A failing record is captured into
//! [`IngestReport::errors`] and the batch moves on; already-ingested
//! records stay ingested.

use anyhow::Result;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};

use crm_rag_core::models::OrganizationId;
use crm_rag_core::pipeline::IngestOutcome;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordError {
    pub record_id: String,
    pub error: String,
}

/// Aggregate result of one adapter batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    /// Successful records left untouched because they were already ingested.
    pub skipped: usize,
    pub errors: Vec<RecordError>,
}

impl IngestReport {
    pub fn record(&mut self, record_id: &str, result: Result<IngestOutcome>) {
        self.processed += 1;
        match result {
            Ok(outcome) => {
                self.successful += 1;
                if outcome == IngestOutcome::Skipped {
                    self.skipped += 1;
                }
            }
            Err(e) => {
                self.failed += 1;
                self.errors.push(RecordError {
                    record_id: record_id.to_string(),
                    error: format!("{e:#}"),
                });
            }
        }
    }

    /// Fold another batch (e.g. one ERP collection) into this report.
    pub fn merge(&mut self, other: IngestReport) {
        self.processed += other.processed;
        self.successful += other.successful;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
    }
}

/// Run `ingest` over `records` sequentially, pausing `delay` between records.
pub async fn run_batch<R, F, Fut>(
    label: &str,
    org: &OrganizationId,
    records: Vec<R>,
    delay: Duration,
    id_of: impl Fn(&R) -> String,
    mut ingest: F,
) -> IngestReport
where
    F: FnMut(R) -> Fut,
    Fut: Future<Output = Result<IngestOutcome>>,
{
    let start = Instant::now();
    let total = records.len();
    let mut report = IngestReport::default();

    tracing::info!(organization_id = %org, batch = label, total, "batch started");

    for (i, record) in records.into_iter().enumerate() {
        if i > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let id = id_of(&record);
        let result = ingest(record).await;
        if let Err(e) = &result {
            tracing::warn!(organization_id = %org, batch = label, record_id = %id, error = %format!("{e:#}"), "record failed");
        }
        report.record(&id, result);
    }

    tracing::info!(
        organization_id = %org,
        batch = label,
        processed = report.processed,
        successful = report.successful,
        skipped = report.skipped,
        failed = report.failed,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "batch finished"
    );
    report
}
