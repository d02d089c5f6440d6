//! End-to-end pipeline behavior over in-memory stores and fixture adapters.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use content_indexer::blob::{BlobAdapter, BlobObject, BlobStore};
use content_indexer::config::Config;
use content_indexer::connector_fs::FileAdapter;
use content_indexer::embedding::DisabledEmbedder;
use content_indexer::error::{IngestError, IngestResult};
use content_indexer::ledger::{LedgerEntry, LedgerStore, RunStatus, RunSummary};
use content_indexer::models::{Identity, Origin, RawPayload, RawRecord, SourceKind, Strategy};
use content_indexer::pipeline::{IngestRequest, Pipeline};
use content_indexer::progress::{PipelineState, ProgressEvent, ProgressReporter, RecordingProgress};
use content_indexer::store::memory::{InMemoryIndexStore, InMemoryLedgerStore};
use content_indexer::store::{Hit, IndexRecord, IndexStore};
use content_indexer::traits::{AdapterRegistry, SourceAdapter};
use content_indexer::uploads::ContentFile;

// ============ Fixtures ============

/// Collections of rows, editable between runs.
#[derive(Default)]
struct FixtureRows {
    collections: Mutex<HashMap<String, Vec<Value>>>,
    broken: Mutex<HashSet<String>>,
}

impl FixtureRows {
    fn set(&self, collection: &str, rows: Vec<Value>) {
        self.collections
            .lock()
            .unwrap()
            .insert(collection.to_string(), rows);
    }

    fn break_collection(&self, collection: &str) {
        self.broken.lock().unwrap().insert(collection.to_string());
    }
}

#[async_trait]
impl SourceAdapter for FixtureRows {
    fn kind(&self) -> SourceKind {
        SourceKind::NoSql
    }

    fn description(&self) -> &str {
        "fixture rows"
    }

    async fn list_identities(&self, origin: &Origin) -> IngestResult<Vec<Identity>> {
        let Origin::NoSql { collection, .. } = origin else {
            return Err(IngestError::ConfigurationMissing("not a collection".into()));
        };
        Ok(vec![Identity {
            key: collection.clone(),
            origin: origin.clone(),
        }])
    }

    async fn fetch(&self, identity: &Identity) -> IngestResult<RawRecord> {
        if self.broken.lock().unwrap().contains(&identity.key) {
            return Err(IngestError::normalization(&identity.key, "cursor was killed"));
        }
        let rows = self
            .collections
            .lock()
            .unwrap()
            .get(&identity.key)
            .cloned()
            .unwrap_or_default();
        Ok(RawRecord {
            kind: SourceKind::NoSql,
            identity: identity.clone(),
            name: identity.key.clone(),
            payload: RawPayload::Rows(rows),
        })
    }
}

/// Adapter that is registered but has no credentials.
struct Offline;

#[async_trait]
impl SourceAdapter for Offline {
    fn kind(&self) -> SourceKind {
        SourceKind::Notion
    }
    fn description(&self) -> &str {
        "offline"
    }
    fn unavailable_reason(&self) -> Option<String> {
        Some("NOTION_INTEGRATION_TOKEN is not set".into())
    }
    async fn list_identities(&self, _origin: &Origin) -> IngestResult<Vec<Identity>> {
        panic!("unavailable adapter must not be listed");
    }
    async fn fetch(&self, _identity: &Identity) -> IngestResult<RawRecord> {
        panic!("unavailable adapter must not be fetched");
    }
}

/// Blobs held in memory; counts listing calls.
#[derive(Default)]
struct MemoryBlobs {
    blobs: HashMap<String, Vec<u8>>,
    list_calls: Arc<AtomicUsize>,
    downloads: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl BlobStore for MemoryBlobs {
    fn unavailable_reason(&self) -> Option<String> {
        None
    }

    async fn list(&self, _container: &str, prefix: Option<&str>) -> IngestResult<Vec<BlobObject>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .blobs
            .iter()
            .filter(|(name, _)| prefix.map_or(true, |p| name.starts_with(p)))
            .map(|(name, bytes)| BlobObject {
                name: name.clone(),
                size: bytes.len() as u64,
            })
            .collect())
    }

    async fn download_to(
        &self,
        _container: &str,
        name: &str,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> IngestResult<u64> {
        self.downloads.lock().unwrap().push(name.to_string());
        let bytes = self
            .blobs
            .get(name)
            .ok_or_else(|| IngestError::ConfigurationMissing(format!("no blob {}", name)))?;
        writer.write_all(bytes).await?;
        Ok(bytes.len() as u64)
    }
}

/// Index store whose first `failures` upserts fail.
struct FlakyIndex {
    inner: InMemoryIndexStore,
    failures: AtomicUsize,
}

#[async_trait]
impl IndexStore for FlakyIndex {
    async fn upsert(&self, record: &IndexRecord) -> Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("search service busy");
        }
        self.inner.upsert(record).await
    }
    async fn delete(&self, uids: &[String]) -> Result<usize> {
        self.inner.delete(uids).await
    }
    async fn delete_by_internal_id(&self, internal_id: &str) -> Result<Vec<String>> {
        self.inner.delete_by_internal_id(internal_id).await
    }
    async fn get(&self, uid: &str) -> Result<Option<IndexRecord>> {
        self.inner.get(uid).await
    }
    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }
    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<Hit>> {
        self.inner.keyword_search(query, limit).await
    }
    async fn vector_search(&self, query: &[f32], limit: usize) -> Result<Vec<Hit>> {
        self.inner.vector_search(query, limit).await
    }
}

/// Ledger store whose next `failures` upserts fail.
struct FlakyLedger {
    inner: InMemoryLedgerStore,
    failures: AtomicUsize,
}

impl FlakyLedger {
    fn new(failures: usize) -> Self {
        Self {
            inner: InMemoryLedgerStore::new(),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl LedgerStore for FlakyLedger {
    async fn get(&self, namespace: &str, source_id: &str) -> Result<Option<LedgerEntry>> {
        self.inner.get(namespace, source_id).await
    }
    async fn upsert(&self, entry: &LedgerEntry) -> Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("database is locked");
        }
        self.inner.upsert(entry).await
    }
    async fn touch(&self, namespace: &str, source_id: &str, run_id: &str) -> Result<()> {
        self.inner.touch(namespace, source_id, run_id).await
    }
    async fn unseen(&self, namespace: &str, run_id: &str) -> Result<Vec<LedgerEntry>> {
        self.inner.unseen(namespace, run_id).await
    }
    async fn entries(&self, namespace: &str) -> Result<Vec<LedgerEntry>> {
        self.inner.entries(namespace).await
    }
    async fn remove(&self, namespace: &str, source_ids: &[String]) -> Result<usize> {
        self.inner.remove(namespace, source_ids).await
    }
    async fn remove_by_uids(&self, uids: &[String]) -> Result<usize> {
        self.inner.remove_by_uids(uids).await
    }
    async fn record_run(&self, run: &RunSummary) -> Result<()> {
        self.inner.record_run(run).await
    }
    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        self.inner.recent_runs(limit).await
    }
    async fn record_upload(&self, file: &ContentFile) -> Result<()> {
        self.inner.record_upload(file).await
    }
    async fn uploads(&self) -> Result<Vec<ContentFile>> {
        self.inner.uploads().await
    }
    async fn forget_upload(&self, internal_id: &str) -> Result<bool> {
        self.inner.forget_upload(internal_id).await
    }
}

/// Cancels the token as soon as the first batch starts.
struct CancelOnFirstBatch(CancellationToken);

impl ProgressReporter for CancelOnFirstBatch {
    fn report(&self, event: &ProgressEvent) {
        if matches!(event.state, PipelineState::Indexing { batch: 1, .. }) {
            self.0.cancel();
        }
    }
}

struct Harness {
    pipeline: Pipeline,
    index: Arc<InMemoryIndexStore>,
    ledger: Arc<InMemoryLedgerStore>,
}

fn test_config() -> Config {
    let mut config = Config::minimal("/tmp/unused.sqlite");
    config.pipeline.batch_count = 2;
    config.pipeline.retry_backoff_ms = 1;
    config
}

fn harness(config: &Config, adapter: Arc<dyn SourceAdapter>) -> Harness {
    let mut adapters = AdapterRegistry::new();
    adapters.register(adapter);
    let index = Arc::new(InMemoryIndexStore::new());
    let ledger = Arc::new(InMemoryLedgerStore::new());
    let pipeline = Pipeline::new(
        config,
        adapters,
        index.clone(),
        ledger.clone(),
        Arc::new(DisabledEmbedder),
    );
    Harness {
        pipeline,
        index,
        ledger,
    }
}

fn orders() -> Vec<Value> {
    vec![
        json!({"_id": "o1", "total": 10}),
        json!({"_id": "o2", "total": 20}),
        json!({"_id": "o3", "total": 30}),
    ]
}

fn orders_request() -> IngestRequest {
    IngestRequest::NoSql {
        database: Some("shop".into()),
        collections: Some("orders".into()),
    }
}

const ORDERS_NS: &str = "content:nosql:shop.orders";

// ============ Change tracking ============

#[tokio::test]
async fn test_second_run_over_unchanged_source_skips_everything() {
    let rows = Arc::new(FixtureRows::default());
    rows.set("orders", orders());
    let h = harness(&test_config(), rows.clone());

    let first = h.pipeline.ingest(&orders_request()).await.unwrap();
    assert_eq!(first.totals.added, 3);
    assert!(first.is_complete());

    let second = h.pipeline.ingest(&orders_request()).await.unwrap();
    assert_eq!(second.totals.added, 0);
    assert_eq!(second.totals.updated, 0);
    assert_eq!(second.totals.skipped, 3);
    assert_eq!(second.totals.deleted, 0);
    assert_eq!(h.index.records().len(), 3);
}

#[tokio::test]
async fn test_changed_row_is_updated() {
    let rows = Arc::new(FixtureRows::default());
    rows.set("orders", orders());
    let h = harness(&test_config(), rows.clone());
    h.pipeline.ingest(&orders_request()).await.unwrap();

    let mut changed = orders();
    changed[1] = json!({"_id": "o2", "total": 25});
    rows.set("orders", changed);

    let report = h.pipeline.ingest(&orders_request()).await.unwrap();
    assert_eq!(report.totals.updated, 1);
    assert_eq!(report.totals.skipped, 2);
    assert_eq!(report.totals.added, 0);

    let updated = h
        .index
        .records()
        .into_iter()
        .find(|r| r.source_id == "o2")
        .unwrap();
    assert!(updated.content.contains("25"));
}

#[tokio::test]
async fn test_removed_row_is_swept() {
    let rows = Arc::new(FixtureRows::default());
    rows.set("orders", orders());
    let h = harness(&test_config(), rows.clone());
    h.pipeline.ingest(&orders_request()).await.unwrap();

    rows.set("orders", orders().into_iter().take(2).collect());
    let report = h.pipeline.ingest(&orders_request()).await.unwrap();
    assert_eq!(report.totals.deleted, 1);
    assert_eq!(report.totals.skipped, 2);

    assert!(h.ledger.get(ORDERS_NS, "o3").await.unwrap().is_none());
    assert_eq!(h.ledger.entries(ORDERS_NS).await.unwrap().len(), 2);
    let ids: Vec<String> = h.index.records().into_iter().map(|r| r.source_id).collect();
    assert_eq!(ids, vec!["o1", "o2"]);
}

#[tokio::test]
async fn test_full_strategy_purges_then_recreates() {
    let rows = Arc::new(FixtureRows::default());
    rows.set("orders", orders());
    let h = harness(&test_config(), rows.clone());
    h.pipeline.ingest(&orders_request()).await.unwrap();

    let report = h
        .pipeline
        .ingest_with(&orders_request(), Strategy::Full)
        .await
        .unwrap();
    assert_eq!(report.totals.added, 3);
    assert_eq!(report.totals.deleted, 3);
    assert_eq!(report.totals.skipped, 0);
    assert_eq!(h.index.records().len(), 3);
    assert_eq!(h.ledger.entries(ORDERS_NS).await.unwrap().len(), 3);
}

// ============ Multiple origins ============

#[tokio::test]
async fn test_failing_collection_does_not_stop_the_others() {
    let rows = Arc::new(FixtureRows::default());
    rows.set("coll1", vec![json!({"_id": "a", "v": 1}), json!({"_id": "b", "v": 2})]);
    rows.set("coll2", vec![json!({"_id": "c", "v": 3})]);
    rows.set("coll3", vec![json!({"_id": "d", "v": 4})]);
    rows.break_collection("coll2");
    let h = harness(&test_config(), rows.clone());

    let report = h
        .pipeline
        .ingest(&IngestRequest::NoSql {
            database: Some("app".into()),
            collections: Some("coll1,coll2,coll3".into()),
        })
        .await
        .unwrap();

    assert_eq!(report.sources.len(), 3);
    let statuses: Vec<RunStatus> = report.sources.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![RunStatus::Done, RunStatus::Failed, RunStatus::Done]
    );
    let added: usize = report.sources.iter().map(|s| s.result.added).sum();
    assert_eq!(added, report.totals.added);
    assert_eq!(report.totals.added, 3);
    assert_eq!(report.totals.errors.len(), 1);
    assert!(!report.is_complete());
    assert_eq!(h.index.records().len(), 3);
}

#[tokio::test]
async fn test_unavailable_source_is_rejected_up_front() {
    let h = harness(&test_config(), Arc::new(Offline));
    let err = h
        .pipeline
        .ingest(&IngestRequest::Notion {
            page_ids: Some("p1".into()),
        })
        .await
        .unwrap_err();
    assert_eq!(err.http_status_like, 400);
    assert!(err.message.contains("NOTION_INTEGRATION_TOKEN"));
}

// ============ Batches ============

#[tokio::test]
async fn test_transient_write_failures_are_retried() {
    let rows = Arc::new(FixtureRows::default());
    rows.set("orders", orders());
    let mut adapters = AdapterRegistry::new();
    adapters.register(rows);
    let index = Arc::new(FlakyIndex {
        inner: InMemoryIndexStore::new(),
        failures: AtomicUsize::new(2),
    });
    let pipeline = Pipeline::new(
        &test_config(),
        adapters,
        index.clone(),
        Arc::new(InMemoryLedgerStore::new()),
        Arc::new(DisabledEmbedder),
    );

    let report = pipeline.ingest(&orders_request()).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.totals.added, 3);
    assert!(report.totals.errors.is_empty());
    assert_eq!(index.count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_run_without_sweeping() {
    let rows = Arc::new(FixtureRows::default());
    rows.set("orders", orders());
    let mut config = test_config();
    config.pipeline.max_batch_retries = 1;
    let mut adapters = AdapterRegistry::new();
    adapters.register(rows);
    let index = Arc::new(FlakyIndex {
        inner: InMemoryIndexStore::new(),
        failures: AtomicUsize::new(usize::MAX),
    });
    let pipeline = Pipeline::new(
        &config,
        adapters,
        index,
        Arc::new(InMemoryLedgerStore::new()),
        Arc::new(DisabledEmbedder),
    );

    let report = pipeline.ingest(&orders_request()).await.unwrap();
    assert_eq!(report.sources[0].status, RunStatus::Failed);
    assert_eq!(report.totals.added, 0);
    assert_eq!(report.totals.deleted, 0);
    assert_eq!(report.totals.errors.len(), 1);
}

#[tokio::test]
async fn test_ledger_failure_after_index_write_is_healed_by_rerun() {
    let rows = Arc::new(FixtureRows::default());
    rows.set("orders", orders());
    let mut config = test_config();
    config.pipeline.max_batch_retries = 0;
    let mut adapters = AdapterRegistry::new();
    adapters.register(rows);
    let index = Arc::new(InMemoryIndexStore::new());
    let ledger = Arc::new(FlakyLedger::new(usize::MAX));
    let pipeline = Pipeline::new(
        &config,
        adapters,
        index.clone(),
        ledger.clone(),
        Arc::new(DisabledEmbedder),
    );

    // First batch reaches the index, but nothing is committed to the ledger
    let first = pipeline.ingest(&orders_request()).await.unwrap();
    assert_eq!(first.sources[0].status, RunStatus::Failed);
    assert_eq!(first.totals.added, 0);
    assert_eq!(first.totals.errors.len(), 1);
    assert!(first.totals.errors[0]
        .message
        .contains("ledger and index disagree"));
    assert_eq!(index.records().len(), 2);
    assert!(ledger.entries(ORDERS_NS).await.unwrap().is_empty());

    ledger.failures.store(0, Ordering::SeqCst);
    let second = pipeline.ingest(&orders_request()).await.unwrap();
    assert!(second.is_complete());
    assert_eq!(second.totals.added, 3);
    assert_eq!(second.totals.deleted, 0);
    assert_eq!(index.records().len(), 3);
    assert_eq!(ledger.entries(ORDERS_NS).await.unwrap().len(), 3);

    let third = pipeline.ingest(&orders_request()).await.unwrap();
    assert_eq!(third.totals.skipped, 3);
    assert_eq!(third.totals.added, 0);
}

#[tokio::test]
async fn test_ledger_failure_is_retried_within_the_run() {
    let rows = Arc::new(FixtureRows::default());
    rows.set("orders", orders());
    let mut adapters = AdapterRegistry::new();
    adapters.register(rows);
    let index = Arc::new(InMemoryIndexStore::new());
    let ledger = Arc::new(FlakyLedger::new(1));
    let pipeline = Pipeline::new(
        &test_config(),
        adapters,
        index.clone(),
        ledger.clone(),
        Arc::new(DisabledEmbedder),
    );

    let report = pipeline.ingest(&orders_request()).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.totals.added, 3);
    assert!(report.totals.errors.is_empty());
    assert_eq!(index.records().len(), 3);
    assert_eq!(ledger.entries(ORDERS_NS).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_cancellation_stops_before_next_batch() {
    let rows = Arc::new(FixtureRows::default());
    rows.set(
        "orders",
        (0..4).map(|i| json!({"_id": format!("o{}", i)})).collect(),
    );
    rows.set("returns", vec![json!({"_id": "r1"})]);
    let token = CancellationToken::new();
    let h = harness(&test_config(), rows);
    let pipeline = h
        .pipeline
        .with_progress(Arc::new(CancelOnFirstBatch(token.clone())))
        .with_cancellation(token);

    let report = pipeline
        .ingest(&IngestRequest::NoSql {
            database: Some("shop".into()),
            collections: Some("orders,returns".into()),
        })
        .await
        .unwrap();

    // First batch of two finishes; the second batch and second collection never start.
    assert_eq!(report.sources.len(), 1);
    assert_eq!(report.sources[0].status, RunStatus::Cancelled);
    assert_eq!(report.totals.added, 2);
    assert_eq!(report.totals.errors.len(), 1);
    assert_eq!(report.totals.errors[0].message, "ingestion cancelled");
    assert_eq!(h.index.records().len(), 2);
}

#[tokio::test]
async fn test_state_transitions_are_reported() {
    let rows = Arc::new(FixtureRows::default());
    rows.set("orders", orders());
    let recorder = Arc::new(RecordingProgress::new());
    let h = harness(&test_config(), rows);
    let pipeline = h.pipeline.with_progress(recorder.clone());

    pipeline.ingest(&orders_request()).await.unwrap();
    assert_eq!(
        recorder.states(ORDERS_NS),
        vec![
            "idle",
            "loading",
            "normalizing",
            "batching",
            "indexing",
            "indexing",
            "cleanup",
            "done"
        ]
    );
}

// ============ Files and blobs ============

#[tokio::test]
async fn test_unsupported_extension_yields_no_documents() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("notes.docx"), b"PK\x03\x04").unwrap();

    let config = test_config();
    let adapter = FileAdapter::new(&config.connectors.files).unwrap();
    let h = harness(&config, Arc::new(adapter));

    let report = h
        .pipeline
        .ingest(&IngestRequest::Files {
            path: dir.path().join("notes.docx"),
            internal_id: None,
            description: None,
        })
        .await
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.totals.added, 0);
    assert!(report.totals.errors.is_empty());
}

#[tokio::test]
async fn test_blob_name_skips_listing() {
    let mut store = MemoryBlobs::default();
    store
        .blobs
        .insert("a/b/c.json".into(), br#"{"q": "refunds?", "a": "5 days"}"#.to_vec());
    store.blobs.insert("a/b/d.json".into(), br#"{"q": "other"}"#.to_vec());
    let list_calls = store.list_calls.clone();
    let downloads = store.downloads.clone();
    let h = harness(&test_config(), Arc::new(BlobAdapter::new(SourceKind::S3, store)));

    let report = h
        .pipeline
        .ingest(&IngestRequest::S3 {
            bucket: Some("docs".into()),
            prefix: Some("a/b".into()),
            blob_name: Some("c.json".into()),
        })
        .await
        .unwrap();
    assert_eq!(list_calls.load(Ordering::SeqCst), 0);
    assert_eq!(*downloads.lock().unwrap(), vec!["a/b/c.json"]);
    assert_eq!(report.totals.added, 2);
    assert_eq!(report.sources[0].namespace, "content:s3:docs/a/b/c.json");
}

#[tokio::test]
async fn test_bucket_without_selectors_lists_everything() {
    let mut store = MemoryBlobs::default();
    store.blobs.insert("one.json".into(), br#"["x"]"#.to_vec());
    store.blobs.insert("nested/two.json".into(), br#"["y"]"#.to_vec());
    let list_calls = store.list_calls.clone();
    let h = harness(&test_config(), Arc::new(BlobAdapter::new(SourceKind::S3, store)));

    let report = h
        .pipeline
        .ingest(&IngestRequest::S3 {
            bucket: Some("docs".into()),
            prefix: None,
            blob_name: None,
        })
        .await
        .unwrap();
    assert_eq!(list_calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.totals.added, 2);
    let sources: Vec<String> = h.index.records().into_iter().map(|r| r.source_id).collect();
    assert_eq!(sources, vec!["nested/two.json-0", "one.json-0"]);
}

// ============ Uploads ============

#[tokio::test]
async fn test_upload_then_delete_content() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config();
    config.storage.upload_dir = dir.path().to_path_buf();
    let adapter = FileAdapter::new(&config.connectors.files).unwrap();
    let h = harness(&config, Arc::new(adapter));

    let (file, report) = h
        .pipeline
        .ingest_upload(
            "people.csv",
            b"name,city\nAda,London\nLinus,Helsinki\n",
            Some("staff list".into()),
        )
        .await
        .unwrap();
    assert_eq!(report.totals.added, 2);
    let namespace = format!("content:file:{}", file.id);
    assert_eq!(report.sources[0].namespace, namespace);
    for record in h.index.records() {
        assert_eq!(record.internal_id(), Some(file.id.as_str()));
    }

    let listed = h.pipeline.list_uploads().await.unwrap();
    assert_eq!(listed, vec![file.clone()]);
    assert_eq!(listed[0].description.as_deref(), Some("staff list"));

    let removed = h.pipeline.delete_content(&file.id).await.unwrap();
    assert_eq!(removed, 2);
    assert!(h.index.records().is_empty());
    assert!(h.ledger.entries(&namespace).await.unwrap().is_empty());
    assert!(!file.path.exists());
    assert!(h.pipeline.list_uploads().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_upload_is_not_kept() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config();
    config.storage.upload_dir = dir.path().to_path_buf();
    // No file adapter registered: the request is refused before loading
    let h = harness(&config, Arc::new(FixtureRows::default()));

    let err = h
        .pipeline
        .ingest_upload("people.csv", b"name\nAda\n", None)
        .await
        .unwrap_err();
    assert_eq!(err.http_status_like, 400);
    assert!(h.pipeline.list_uploads().await.unwrap().is_empty());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
