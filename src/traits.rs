//! The source adapter extension point.
//!
//! Every origin the pipeline can read from is a [`SourceAdapter`]. The
//! orchestrator only talks to adapters through this trait, so tests (and
//! embedders of the library) can register their own implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               AdapterRegistry                │
//! │  ┌──────┐ ┌──────────────┐ ┌──────┐ ┌─────┐  │
//! │  │ file │ │ azure / s3   │ │notion│ │nosql│  │
//! │  │      │ │ (BlobAdapter)│ │      │ │     │  │
//! │  └──────┘ └──────────────┘ └──────┘ └─────┘  │
//! └──────────────────────┬───────────────────────┘
//!                        ▼
//!        Pipeline::ingest() → normalize → batch → ledger → writer
//! ```
//!
//! # Usage
//!
//! ```rust
//! use content_indexer::traits::AdapterRegistry;
//!
//! let adapters = AdapterRegistry::new();
//! // adapters.register(Arc::new(MyAdapter::new()));
//! assert!(adapters.is_empty());
//! ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::blob::BlobAdapter;
use crate::config::Config;
use crate::connector_azure::AzureBlobStore;
use crate::connector_fs::FileAdapter;
use crate::connector_notion::NotionAdapter;
use crate::connector_nosql::NoSqlAdapter;
use crate::connector_s3::S3BlobStore;
use crate::error::IngestResult;
use crate::models::{Identity, Origin, RawRecord, SourceKind};

// ═══════════════════════════════════════════════════════════════════════
// Adapter Trait
// ═══════════════════════════════════════════════════════════════════════

/// An origin of raw records.
///
/// # Lifecycle
///
/// 1. The adapter is registered via [`AdapterRegistry::register`].
/// 2. [`unavailable_reason`](SourceAdapter::unavailable_reason) is checked
///    before every request; `Some` short-circuits the request with
///    `SourceUnavailable`.
/// 3. [`list_identities`](SourceAdapter::list_identities) resolves an
///    [`Origin`] into cheap identities.
/// 4. [`fetch`](SourceAdapter::fetch) is called for each identity, with
///    bounded concurrency.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use content_indexer::error::IngestResult;
/// use content_indexer::models::{Identity, Origin, RawPayload, RawRecord, SourceKind};
/// use content_indexer::traits::SourceAdapter;
///
/// struct FixtureAdapter;
///
/// #[async_trait]
/// impl SourceAdapter for FixtureAdapter {
///     fn kind(&self) -> SourceKind { SourceKind::NoSql }
///     fn description(&self) -> &str { "Fixed rows for tests" }
///
///     async fn list_identities(&self, origin: &Origin) -> IngestResult<Vec<Identity>> {
///         Ok(vec![Identity { key: "rows".into(), origin: origin.clone() }])
///     }
///
///     async fn fetch(&self, identity: &Identity) -> IngestResult<RawRecord> {
///         Ok(RawRecord {
///             kind: SourceKind::NoSql,
///             identity: identity.clone(),
///             name: identity.key.clone(),
///             payload: RawPayload::Rows(vec![]),
///         })
///     }
/// }
/// ```
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// The source kind this adapter serves. One adapter per kind.
    fn kind(&self) -> SourceKind;

    /// One-line description, shown by `cix sources`.
    fn description(&self) -> &str;

    /// Why the backing service cannot be used, or `None` when it can.
    ///
    /// Adapters without credentials or endpoints report a reason here
    /// instead of failing later inside a fetch.
    fn unavailable_reason(&self) -> Option<String> {
        None
    }

    fn is_available(&self) -> bool {
        self.unavailable_reason().is_none()
    }

    /// Resolve an origin into record identities without fetching payloads.
    async fn list_identities(&self, origin: &Origin) -> IngestResult<Vec<Identity>>;

    /// Fetch the payload of one identity.
    async fn fetch(&self, identity: &Identity) -> IngestResult<RawRecord>;
}

// ═══════════════════════════════════════════════════════════════════════
// Adapter Registry
// ═══════════════════════════════════════════════════════════════════════

/// Adapters keyed by the source kind they serve.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: BTreeMap<&'static str, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry of built-in adapters from configuration.
    ///
    /// Credentials are read from the environment here; adapters whose
    /// credentials are missing are still registered and report themselves
    /// unavailable.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(FileAdapter::new(&config.connectors.files)?));
        registry.register(Arc::new(BlobAdapter::new(
            SourceKind::Azure,
            AzureBlobStore::from_env()?,
        )));
        registry.register(Arc::new(BlobAdapter::new(
            SourceKind::S3,
            S3BlobStore::from_env(&config.connectors.s3)?,
        )));
        registry.register(Arc::new(NotionAdapter::from_env(&config.connectors.notion)?));
        registry.register(Arc::new(NoSqlAdapter::from_env(&config.connectors.nosql)?));
        Ok(registry)
    }

    /// Register an adapter, replacing any previous adapter of the same kind.
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.kind().as_str(), adapter);
    }

    pub fn get(&self, kind: SourceKind) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(kind.as_str()).cloned()
    }

    /// All adapters, ordered by kind name.
    pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn SourceAdapter>> {
        self.adapters.values()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
