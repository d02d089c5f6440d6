//! Core data models that flow through the ingestion pipeline.
//!
//! Adapters produce [`RawRecord`]s, the normalizer turns them into
//! [`Document`]s, and every write path reports back through
//! [`IndexWriteResult`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tempfile::NamedTempFile;

/// A metadata value: documents only carry strings and integers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Text(String),
    Number(i64),
}

impl MetaValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetaValue::Text(s) => Some(s),
            MetaValue::Number(_) => None,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Text(s) => f.write_str(s),
            MetaValue::Number(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Text(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Text(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Number(value)
    }
}

impl From<usize> for MetaValue {
    fn from(value: usize) -> Self {
        MetaValue::Number(value as i64)
    }
}

/// Sorted so that serialization, and therefore hashing, is stable.
pub type Metadata = BTreeMap<String, MetaValue>;

/// Canonical unit of indexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    pub metadata: Metadata,
    pub source_id: String,
}

impl Document {
    pub fn new(source_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: Metadata::new(),
            source_id: source_id.into(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// SHA-256 over the content and the serialized metadata.
    ///
    /// Metadata participates so that a changed description or page number
    /// is treated as an update even when the text is identical.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.content.as_bytes());
        hasher.update([0u8]);
        hasher.update(serde_json::to_string(&self.metadata).unwrap_or_default());
        format!("{:x}", hasher.finalize())
    }

    pub fn meta_text(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(MetaValue::as_text)
    }
}

/// The kinds of origin the pipeline can ingest from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Azure,
    S3,
    Notion,
    NoSql,
}

impl SourceKind {
    pub const ALL: [SourceKind; 5] = [
        SourceKind::File,
        SourceKind::Azure,
        SourceKind::S3,
        SourceKind::Notion,
        SourceKind::NoSql,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::File => "file",
            SourceKind::Azure => "azure",
            SourceKind::S3 => "s3",
            SourceKind::Notion => "notion",
            SourceKind::NoSql => "nosql",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" | "files" | "filesystem" => Ok(SourceKind::File),
            "azure" | "azure-blob" => Ok(SourceKind::Azure),
            "s3" => Ok(SourceKind::S3),
            "notion" => Ok(SourceKind::Notion),
            "nosql" | "mongo" | "mongodb" => Ok(SourceKind::NoSql),
            other => Err(format!(
                "unknown source kind '{}'. Must be file, azure, s3, notion, or nosql.",
                other
            )),
        }
    }
}

/// Where an ingestion run reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// A single uploaded file or a directory to walk.
    File {
        path: PathBuf,
        internal_id: Option<String>,
        description: Option<String>,
    },
    /// A container (Azure) or bucket (S3).
    Blob {
        container: String,
        prefix: Option<String>,
        blob_name: Option<String>,
    },
    Notion {
        page_id: String,
    },
    NoSql {
        database: String,
        collection: String,
    },
}

impl Origin {
    /// The part of the ledger namespace that identifies this origin.
    ///
    /// Narrow selections (one blob, one prefix) get their own scope so that
    /// sweeping them never touches entries owned by a wider selection.
    pub fn scope(&self) -> String {
        match self {
            Origin::File {
                internal_id: Some(id),
                ..
            } => id.clone(),
            Origin::File { path, .. } => path.display().to_string(),
            Origin::Blob {
                container,
                prefix,
                blob_name,
            } => {
                let mut scope = container.clone();
                for part in [prefix, blob_name].into_iter().flatten() {
                    let part = part.trim_matches('/');
                    if !part.is_empty() {
                        scope.push('/');
                        scope.push_str(part);
                    }
                }
                scope
            }
            Origin::Notion { page_id } => page_id.clone(),
            Origin::NoSql {
                database,
                collection,
            } => format!("{}.{}", database, collection),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.scope())
    }
}

/// A cheap handle on one record of an origin; no payload yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// File path relative to the walk root, blob name, page id or
    /// collection name.
    pub key: String,
    pub origin: Origin,
}

/// A rendered Notion page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotionPage {
    pub id: String,
    pub title: String,
    pub lines: Vec<String>,
}

/// Origin-specific payload of a fetched record.
#[derive(Debug)]
pub enum RawPayload {
    /// A file already on local disk.
    LocalFile(PathBuf),
    /// A downloaded blob. The file is removed when the payload is dropped.
    Scratch(NamedTempFile),
    /// A Notion page tree, root first.
    NotionPages(Vec<NotionPage>),
    /// Every row of a collection.
    Rows(Vec<serde_json::Value>),
}

/// Output of [`SourceAdapter::fetch`](crate::traits::SourceAdapter::fetch).
#[derive(Debug)]
pub struct RawRecord {
    pub kind: SourceKind,
    pub identity: Identity,
    /// Display name used for `sourceId`s and the `source` metadata field.
    pub name: String,
    pub payload: RawPayload,
}

/// How a run treats entries already in the namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Purge the namespace, then write everything as new.
    Full,
    /// Write what changed and sweep what disappeared.
    #[default]
    Incremental,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Full => "full",
            Strategy::Incremental => "incremental",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One invocation of the pipeline for one origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexingRun {
    pub namespace: String,
    pub run_id: String,
    pub strategy: Strategy,
}

impl IndexingRun {
    pub fn start(namespace: impl Into<String>, strategy: Strategy) -> Self {
        Self {
            namespace: namespace.into(),
            run_id: uuid::Uuid::new_v4().to_string(),
            strategy,
        }
    }
}

/// A record, batch or source that could not be indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentError {
    /// Record name, batch label or origin scope.
    pub target: String,
    pub source_id: Option<String>,
    pub message: String,
}

impl DocumentError {
    pub fn new(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            source_id: None,
            message: message.into(),
        }
    }

    pub fn for_document(
        source_id: impl Into<String>,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            source_id: Some(source_id.into()),
            message: message.into(),
        }
    }
}

/// Counts reported by every write path, summed across batches and sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexWriteResult {
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub errors: Vec<DocumentError>,
}

impl IndexWriteResult {
    pub fn merge(&mut self, other: IndexWriteResult) {
        self.added += other.added;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.deleted += other.deleted;
        self.errors.extend(other.errors);
    }

    /// Documents that reached the writer (deletions excluded).
    pub fn documents(&self) -> usize {
        self.added + self.updated + self.skipped
    }
}

impl std::ops::AddAssign for IndexWriteResult {
    fn add_assign(&mut self, rhs: Self) {
        self.merge(rhs);
    }
}
