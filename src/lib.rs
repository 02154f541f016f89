//! Blockchain transaction analytics pipeline.
//!
//! Ingests raw transfer records, builds a per-address feature matrix and a
//! transaction graph, detects suspicious structural patterns, and fuses the
//! result into typology alerts. The surrounding transport (ingestion
//! extractors, REST export, schema migration tooling) lives outside this
//! crate; it exposes the analytics engine itself plus a CLI to drive it.

pub mod config;
pub mod features;
pub mod graph;
pub mod metrics;
pub mod model;
pub mod patterns;
pub mod pipeline;
pub mod storage;
pub mod typology;
pub mod utils;

pub use config::AnalyticsConfig;
pub use model::{AddressLabel, Flow, Transfer};
pub use pipeline::{PipelineOrchestrator, RunContext, RunIdentity};
pub use storage::StorageGateway;

/// Crate-wide error type.
///
/// Mirrors the error-kind catalogue in the component design: every fatal
/// condition in a pipeline stage is one of these variants, and
/// `PartialDetectorFailure` is absorbed inside a detector rather than ever
/// surfaced to a caller.
#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    #[error("config missing section {section}{}", key.as_ref().map(|k| format!(" key {k}")).unwrap_or_default())]
    ConfigMissing {
        section: String,
        key: Option<String>,
    },

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("empty window: no flows in the requested range")]
    EmptyWindow,

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("transient database error: {0}")]
    TransientDb(#[from] sqlx::Error),

    #[error("duplicate flow for ordered pair ({from}, {to})")]
    DuplicateFlow { from: String, to: String },

    #[error("community detection failed: {0}")]
    CommunityDetectionFailed(String),

    #[error("stage timed out: {stage}")]
    StageTimeout { stage: String },

    #[error("run cancelled before stage {stage}")]
    Cancelled { stage: String },

    /// Never returned to a caller: a single detection unit (one SCC, one
    /// path-enumeration pair) failed and was logged; the detector
    /// continues with the remaining units.
    #[error("partial detector failure in {unit}: {reason}")]
    PartialDetectorFailure { unit: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for AnalyticsError {
    fn from(err: anyhow::Error) -> Self {
        AnalyticsError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AnalyticsError>;
