//! Typed errors for failures callers are expected to match on.
//!
//! Backend failures at trait seams travel as `anyhow::Error`; the variants
//! here cover the cases that must propagate unchanged (validation and
//! configuration) plus a wrapper used when a backend error is surfaced.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    /// Content handed to the chunker was empty or whitespace-only.
    #[error("content is empty")]
    EmptyContent,

    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A known metadata key carried a value of the wrong kind.
    #[error("invalid metadata `{key}`: {reason}")]
    InvalidMetadata { key: String, reason: String },

    /// An enabled provider has no API credential.
    #[error("missing credential: {0}")]
    MissingCredential(&'static str),

    /// An organization id was empty.
    #[error("organization id must not be empty")]
    MissingOrganization,

    #[error("backend error: {0}")]
    Backend(String),
}
