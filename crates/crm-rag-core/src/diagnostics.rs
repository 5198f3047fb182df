//! Sink for errors that are deliberately not returned to callers.
//!
//! Retrieval degradation, context-build failures, access-log writes and
//! similar best-effort paths report here instead of failing the primary
//! operation. Each report is logged with `tracing::warn!` and counted per
//! [`ErrorCategory`], so tests can assert on what was suppressed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Memory access bookkeeping writes.
    AccessLog,
    /// Knowledge-base retrieval fell back to an empty result.
    Retrieval,
    /// Context assembly fell back to an empty result.
    ContextBuild,
    /// Subscription tier or user override lookup failed.
    TierLookup,
    /// Live ERP facts could not be fetched.
    LiveErp,
    /// The language model call failed.
    Generation,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 6] = [
        ErrorCategory::AccessLog,
        ErrorCategory::Retrieval,
        ErrorCategory::ContextBuild,
        ErrorCategory::TierLookup,
        ErrorCategory::LiveErp,
        ErrorCategory::Generation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessLog => "access_log",
            Self::Retrieval => "retrieval",
            Self::ContextBuild => "context_build",
            Self::TierLookup => "tier_lookup",
            Self::LiveErp => "live_erp",
            Self::Generation => "generation",
        }
    }

    fn slot(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
pub struct ErrorSink {
    counts: [AtomicU64; 6],
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log and count a suppressed error.
    pub fn report(&self, category: ErrorCategory, error: &dyn fmt::Display) {
        self.counts[category.slot()].fetch_add(1, Ordering::Relaxed);
        tracing::warn!(category = category.as_str(), error = %error, "suppressed error");
    }

    pub fn count(&self, category: ErrorCategory) -> u64 {
        self.counts[category.slot()].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        ErrorCategory::ALL.iter().map(|c| self.count(*c)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_per_category() {
        let sink = ErrorSink::new();
        sink.report(ErrorCategory::AccessLog, &"db locked");
        sink.report(ErrorCategory::AccessLog, &"db locked");
        sink.report(ErrorCategory::Retrieval, &anyhow::anyhow!("timeout"));
        assert_eq!(sink.count(ErrorCategory::AccessLog), 2);
        assert_eq!(sink.count(ErrorCategory::Retrieval), 1);
        assert_eq!(sink.count(ErrorCategory::LiveErp), 0);
        assert_eq!(sink.total(), 3);
    }
}
