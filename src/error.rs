//! Typed errors for the ingestion pipeline.
//!
//! Adapters, the normalizer, the ledger and the index writer all return
//! [`IngestError`]. The orchestrator uses [`IngestError::is_retryable`] to
//! decide whether a fetch or a batch gets another attempt, and
//! [`IngestError::status`] to turn request-level failures into the
//! `{ http_status_like, message }` shape callers see.

use serde::Serialize;
use thiserror::Error;

/// Result alias used throughout the pipeline.
pub type IngestResult<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    /// The backing service has no credentials or connection configured.
    #[error("{kind} source is unavailable: {reason}")]
    SourceUnavailable { kind: String, reason: String },

    /// No handler exists for this content type. Never surfaced to callers;
    /// the normalizer logs it and yields zero documents.
    #[error("unsupported content type '{extension}' for {name}")]
    NormalizationUnsupported { name: String, extension: String },

    /// Network or store hiccup during a fetch or a write.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// The index store was written but the ledger was not (or vice versa).
    /// Re-running the source reconciles both sides.
    #[error("ledger and index disagree for {source_id}: {message}")]
    LedgerInconsistency { source_id: String, message: String },

    /// No origin parameter was supplied and no default is configured.
    #[error("missing configuration: {0}")]
    ConfigurationMissing(String),

    #[error("ledger storage failure: {0}")]
    Ledger(String),

    #[error("index store failure: {0}")]
    IndexStore(String),

    /// The payload could not be decoded (corrupt PDF, malformed CSV, ...).
    #[error("failed to normalize {name}: {message}")]
    Normalization { name: String, message: String },

    /// Recorded against the first batch that was not started.
    #[error("ingestion cancelled")]
    Cancelled,
}

impl IngestError {
    pub fn unavailable(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(name: impl Into<String>, extension: impl Into<String>) -> Self {
        Self::NormalizationUnsupported {
            name: name.into(),
            extension: extension.into(),
        }
    }

    pub fn normalization(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Normalization {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn transient(message: impl std::fmt::Display) -> Self {
        Self::TransientIo(message.to_string())
    }

    /// Wraps a store error, keeping an anyhow context chain if present.
    pub fn ledger(err: impl std::fmt::Display) -> Self {
        Self::Ledger(format!("{:#}", err))
    }

    pub fn index_store(err: impl std::fmt::Display) -> Self {
        Self::IndexStore(format!("{:#}", err))
    }

    /// Whether another attempt at the same fetch or batch may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientIo(_)
                | Self::Ledger(_)
                | Self::IndexStore(_)
                | Self::LedgerInconsistency { .. }
        )
    }

    /// Boundary representation of this error.
    pub fn status(&self) -> StatusError {
        let http_status_like = match self {
            Self::SourceUnavailable { .. } | Self::ConfigurationMissing(_) => 400,
            Self::NormalizationUnsupported { .. } | Self::Normalization { .. } => 422,
            Self::TransientIo(_) => 503,
            _ => 500,
        };
        StatusError {
            http_status_like,
            message: self.to_string(),
        }
    }
}

impl From<std::io::Error> for IngestError {
    fn from(err: std::io::Error) -> Self {
        Self::TransientIo(err.to_string())
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        Self::TransientIo(err.to_string())
    }
}

/// Structured error returned to callers when a request cannot be served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusError {
    pub http_status_like: u16,
    pub message: String,
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.http_status_like, self.message)
    }
}

impl std::error::Error for StatusError {}
