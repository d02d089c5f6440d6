//! Index store abstraction.
//!
//! The [`IndexStore`] trait is the collaborator the pipeline writes
//! documents into and the retrieval path searches. Records are keyed by a
//! deterministic uid (see [`record_uid`]) so that re-writing a document after
//! a failed ledger update overwrites the same record instead of duplicating
//! it.
//!
//! Implementations must be `Send + Sync`; writes within a batch run
//! concurrently.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::models::Metadata;

/// Deterministic index key: UUID v5 of `"{namespace}\n{source_id}"`.
pub fn record_uid(namespace: &str, source_id: &str) -> String {
    let name = format!("{}\n{}", namespace, source_id);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// An embedding vector and the model that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub model: String,
    pub values: Vec<f32>,
}

/// A document as stored in the index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub uid: String,
    pub namespace: String,
    pub source_id: String,
    pub content: String,
    pub metadata: Metadata,
    pub embedding: Option<Embedding>,
}

impl IndexRecord {
    /// Upload id the record was generated from, if any.
    pub fn internal_id(&self) -> Option<&str> {
        self.metadata.get("internal_id").and_then(|v| v.as_text())
    }
}

/// A search candidate with its backend score (BM25-derived or cosine).
#[derive(Debug, Clone, Serialize)]
pub struct Hit {
    pub uid: String,
    pub source_id: String,
    pub text: String,
    pub raw_score: f64,
}

#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Insert or overwrite the record with `record.uid`.
    ///
    /// A record written without an embedding drops any vector stored for
    /// the same uid, since it no longer matches the content.
    async fn upsert(&self, record: &IndexRecord) -> Result<()>;

    /// Returns the number of records removed. Unknown uids are ignored.
    async fn delete(&self, uids: &[String]) -> Result<usize>;

    /// Remove every record generated from upload `internal_id`, returning
    /// their uids.
    async fn delete_by_internal_id(&self, internal_id: &str) -> Result<Vec<String>>;

    async fn get(&self, uid: &str) -> Result<Option<IndexRecord>>;

    async fn count(&self) -> Result<usize>;

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<Hit>>;

    async fn vector_search(&self, query: &[f32], limit: usize) -> Result<Vec<Hit>>;
}
