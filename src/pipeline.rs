//! Pipeline orchestrator.
//!
//! Wires adapters → normalizer → batcher → ledger → writer for one
//! ingestion request and aggregates the counts.
//!
//! A request selects one source kind and resolves into one or more
//! [`Origin`]s (several collections, several Notion pages). Each origin is
//! an independent *source run* with its own ledger namespace
//! `{base}:{kind}:{scope}` and its own run id:
//!
//! 1. **Loading**: list identities, fetch payloads with bounded concurrency
//!    (transient failures retried).
//! 2. **Normalizing**: records → documents on the blocking pool. A scratch
//!    file is deleted as soon as its record is normalized.
//! 3. **Batching**: under `full`, purge the namespace first; then split
//!    the documents into `batch_count` even slices.
//! 4. **Indexing**: write batches in order, retrying a failed batch with
//!    only its uncommitted documents. Cancellation is checked before each
//!    batch.
//! 5. **Cleanup**: under `incremental`, sweep entries this run did not see.
//!    Skipped when any record failed to load, since its entries would be
//!    swept by mistake.
//!
//! A failing source never aborts the others of the same request.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::split_even;
use crate::config::{ChunkingConfig, Config, ConnectorsConfig, PipelineConfig};
use crate::embedding::Embedder;
use crate::error::{IngestError, IngestResult, StatusError};
use crate::ledger::{ChangeTracker, LedgerStore, RunStatus, RunSummary};
use crate::models::{
    Document, DocumentError, Identity, IndexWriteResult, IndexingRun, Origin, RawRecord,
    SourceKind, Strategy,
};
use crate::normalize::Normalizer;
use crate::progress::{NoProgress, PipelineState, ProgressEvent, ProgressReporter};
use crate::store::IndexStore;
use crate::traits::{AdapterRegistry, SourceAdapter};
use crate::uploads::{self, ContentFile};
use crate::writer::IndexWriter;

/// What to ingest. Unset fields fall back to `[connectors.*]` defaults.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestRequest {
    Files {
        path: PathBuf,
        internal_id: Option<String>,
        description: Option<String>,
    },
    AzureBlob {
        container: Option<String>,
        prefix: Option<String>,
        blob_name: Option<String>,
    },
    S3 {
        bucket: Option<String>,
        prefix: Option<String>,
        blob_name: Option<String>,
    },
    Notion {
        /// Comma-separated.
        page_ids: Option<String>,
    },
    NoSql {
        database: Option<String>,
        /// Comma-separated.
        collections: Option<String>,
    },
}

impl IngestRequest {
    pub fn kind(&self) -> SourceKind {
        match self {
            IngestRequest::Files { .. } => SourceKind::File,
            IngestRequest::AzureBlob { .. } => SourceKind::Azure,
            IngestRequest::S3 { .. } => SourceKind::S3,
            IngestRequest::Notion { .. } => SourceKind::Notion,
            IngestRequest::NoSql { .. } => SourceKind::NoSql,
        }
    }

    /// Ingest a stored upload.
    pub fn upload(file: &ContentFile) -> Self {
        IngestRequest::Files {
            path: file.path.clone(),
            internal_id: Some(file.id.clone()),
            description: file.description.clone(),
        }
    }
}

/// Outcome of one source run.
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub namespace: String,
    pub run_id: String,
    pub status: RunStatus,
    pub result: IndexWriteResult,
}

/// Outcome of a request: per-source reports and their sum.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub totals: IndexWriteResult,
    pub sources: Vec<SourceReport>,
}

impl IngestReport {
    pub fn is_complete(&self) -> bool {
        self.sources.iter().all(|s| s.status == RunStatus::Done)
    }
}

pub struct Pipeline {
    base_namespace: String,
    options: PipelineConfig,
    normalizer_config: ChunkingConfig,
    connectors: ConnectorsConfig,
    upload_dir: PathBuf,
    adapters: AdapterRegistry,
    writer: IndexWriter,
    progress: Arc<dyn ProgressReporter>,
    cancel: CancellationToken,
}

/// Result of the loading and normalizing phases.
struct Loaded {
    documents: Vec<Document>,
    errors: Vec<DocumentError>,
}

impl Pipeline {
    /// Build a pipeline over explicitly provided stores and adapters.
    pub fn new(
        config: &Config,
        adapters: AdapterRegistry,
        index: Arc<dyn IndexStore>,
        ledger: Arc<dyn LedgerStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let tracker = Arc::new(ChangeTracker::new(ledger));
        Self {
            base_namespace: config.index.namespace.clone(),
            options: config.pipeline.clone(),
            normalizer_config: config.chunking.clone(),
            connectors: config.connectors.clone(),
            upload_dir: config.storage.upload_dir.clone(),
            adapters,
            writer: IndexWriter::new(index, tracker, embedder, config.pipeline.write_concurrency),
            progress: Arc::new(NoProgress),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Cancelling `token` lets in-flight work finish but starts no further
    /// batches or sources.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    pub fn writer(&self) -> &IndexWriter {
        &self.writer
    }

    pub fn namespace_for(&self, kind: SourceKind, origin: &Origin) -> String {
        format!("{}:{}:{}", self.base_namespace, kind, origin.scope())
    }

    /// Run a request with the configured strategy.
    pub async fn ingest(&self, request: &IngestRequest) -> Result<IngestReport, StatusError> {
        self.ingest_with(request, self.options.strategy).await
    }

    /// Run a request.
    ///
    /// Returns `Err` only when nothing could start: the adapter is
    /// unavailable, the request lacks an origin with no configured default,
    /// or every origin was rejected by its service. Otherwise the report
    /// carries per-source statuses and errors.
    pub async fn ingest_with(
        &self,
        request: &IngestRequest,
        strategy: Strategy,
    ) -> Result<IngestReport, StatusError> {
        let kind = request.kind();
        let origins = self.resolve_origins(request).map_err(|e| e.status())?;

        let adapter = self.adapters.get(kind).ok_or_else(|| {
            IngestError::ConfigurationMissing(format!("no adapter registered for {}", kind))
                .status()
        })?;
        if let Some(reason) = adapter.unavailable_reason() {
            warn!(kind = %kind, reason = %reason, "Source unavailable");
            return Err(IngestError::unavailable(kind.as_str(), reason).status());
        }

        let mut report = IngestReport::default();
        let mut rejected = Vec::new();
        for origin in origins {
            if self.cancel.is_cancelled() {
                info!(origin = %origin, "Cancelled before source started");
                break;
            }
            let (source, rejection) = self.run_source(adapter.as_ref(), &origin, strategy).await;
            if let Some(err) = rejection {
                rejected.push(err);
            }
            report.totals.merge(source.result.clone());
            report.sources.push(source);
        }

        // Every origin was turned away before loading anything
        if !report.sources.is_empty() && rejected.len() == report.sources.len() {
            if let Some(err) = rejected.into_iter().next() {
                return Err(err.status());
            }
        }
        Ok(report)
    }

    /// Store an upload under a new internal id and add it to the upload
    /// catalog. Ingest it with [`IngestRequest::upload`].
    pub async fn store_upload(
        &self,
        file_name: &str,
        bytes: &[u8],
        description: Option<String>,
    ) -> IngestResult<ContentFile> {
        let file = uploads::save_upload(&self.upload_dir, file_name, bytes, description)
            .await
            .map_err(|e| IngestError::transient(format!("{:#}", e)))?;
        let store = self.writer.tracker().store();
        if let Err(err) = store.record_upload(&file).await {
            if let Err(cleanup) = uploads::remove_upload(&self.upload_dir, &file.id).await {
                warn!(
                    internal_id = %file.id,
                    error = %format!("{:#}", cleanup),
                    "Failed to remove upload"
                );
            }
            return Err(IngestError::ledger(err));
        }
        info!(internal_id = %file.id, file_name = %file.file_name, "Stored upload");
        Ok(file)
    }

    /// Store an upload and ingest it. When the request is rejected outright
    /// nothing was indexed, so the stored file and its catalog row are
    /// removed again.
    pub async fn ingest_upload(
        &self,
        file_name: &str,
        bytes: &[u8],
        description: Option<String>,
    ) -> Result<(ContentFile, IngestReport), StatusError> {
        let file = self
            .store_upload(file_name, bytes, description)
            .await
            .map_err(|e| e.status())?;
        match self.ingest(&IngestRequest::upload(&file)).await {
            Ok(report) => Ok((file, report)),
            Err(err) => {
                if let Err(cleanup) = self.delete_content(&file.id).await {
                    warn!(
                        internal_id = %file.id,
                        error = %cleanup,
                        "Failed to remove rejected upload"
                    );
                }
                Err(err)
            }
        }
    }

    /// Stored uploads, newest first.
    pub async fn list_uploads(&self) -> IngestResult<Vec<ContentFile>> {
        self.writer
            .tracker()
            .store()
            .uploads()
            .await
            .map_err(IngestError::ledger)
    }

    /// Remove everything generated from upload `internal_id`: index
    /// records, their ledger entries, the stored file and its catalog row.
    /// Returns the number of index records removed.
    pub async fn delete_content(&self, internal_id: &str) -> IngestResult<usize> {
        let uids = self
            .writer
            .index()
            .delete_by_internal_id(internal_id)
            .await
            .map_err(IngestError::index_store)?;
        let forgotten = self.writer.tracker().forget_uids(&uids).await?;
        let removed_dir = uploads::remove_upload(&self.upload_dir, internal_id)
            .await
            .map_err(|e| IngestError::transient(format!("{:#}", e)))?;
        let removed_row = self
            .writer
            .tracker()
            .store()
            .forget_upload(internal_id)
            .await
            .map_err(IngestError::ledger)?;
        info!(
            internal_id = %internal_id,
            records = uids.len(),
            ledger_entries = forgotten,
            upload_removed = removed_dir || removed_row,
            "Deleted content"
        );
        Ok(uids.len())
    }

    /// Turn a request into origins, applying configured defaults.
    pub fn resolve_origins(&self, request: &IngestRequest) -> IngestResult<Vec<Origin>> {
        match request {
            IngestRequest::Files {
                path,
                internal_id,
                description,
            } => Ok(vec![Origin::File {
                path: path.clone(),
                internal_id: internal_id.clone(),
                description: description.clone(),
            }]),
            IngestRequest::AzureBlob {
                container,
                prefix,
                blob_name,
            } => {
                let container = pick(container, &self.connectors.azure.container)
                    .ok_or_else(|| missing("container", "[connectors.azure] container"))?;
                Ok(vec![Origin::Blob {
                    container,
                    prefix: prefix.clone(),
                    blob_name: blob_name.clone(),
                }])
            }
            IngestRequest::S3 {
                bucket,
                prefix,
                blob_name,
            } => {
                let bucket = pick(bucket, &self.connectors.s3.bucket)
                    .ok_or_else(|| missing("bucket", "[connectors.s3] bucket"))?;
                Ok(vec![Origin::Blob {
                    container: bucket,
                    prefix: prefix.clone(),
                    blob_name: blob_name.clone(),
                }])
            }
            IngestRequest::Notion { page_ids } => {
                let ids = split_list(page_ids, &self.connectors.notion.page_ids);
                if ids.is_empty() {
                    return Err(missing("page id", "[connectors.notion] page_ids"));
                }
                Ok(ids
                    .into_iter()
                    .map(|page_id| Origin::Notion { page_id })
                    .collect())
            }
            IngestRequest::NoSql {
                database,
                collections,
            } => {
                let database = pick(database, &self.connectors.nosql.database)
                    .ok_or_else(|| missing("database", "[connectors.nosql] database"))?;
                let collections = split_list(collections, &self.connectors.nosql.collections);
                if collections.is_empty() {
                    return Err(missing("collection", "[connectors.nosql] collections"));
                }
                Ok(collections
                    .into_iter()
                    .map(|collection| Origin::NoSql {
                        database: database.clone(),
                        collection,
                    })
                    .collect())
            }
        }
    }

    fn transition(&self, namespace: &str, state: PipelineState) {
        debug!(namespace = %namespace, state = state.name(), "Pipeline state");
        self.progress.report(&ProgressEvent {
            namespace: namespace.to_string(),
            state,
        });
    }

    /// One source run. The second value is set when the origin was
    /// rejected before anything was loaded.
    async fn run_source(
        &self,
        adapter: &dyn SourceAdapter,
        origin: &Origin,
        strategy: Strategy,
    ) -> (SourceReport, Option<IngestError>) {
        let kind = adapter.kind();
        let run = IndexingRun::start(self.namespace_for(kind, origin), strategy);
        let started_at = Utc::now().timestamp();
        let mut result = IndexWriteResult::default();
        let mut rejection = None;

        self.transition(&run.namespace, PipelineState::Idle);
        info!(
            namespace = %run.namespace,
            run_id = %run.run_id,
            strategy = %strategy,
            "Starting source run"
        );

        let status = match self.load(adapter, origin, &run).await {
            Err(err) => {
                warn!(namespace = %run.namespace, error = %err, "Failed to list source");
                result
                    .errors
                    .push(DocumentError::new(origin.to_string(), err.to_string()));
                if matches!(
                    err,
                    IngestError::SourceUnavailable { .. } | IngestError::ConfigurationMissing(_)
                ) {
                    rejection = Some(err);
                }
                RunStatus::Failed
            }
            Ok(loaded) => {
                let blocked = !loaded.errors.is_empty();
                result.errors.extend(loaded.errors);
                self.index(&run, loaded.documents, blocked, &mut result).await
            }
        };

        let final_state = match status {
            RunStatus::Done => PipelineState::Done,
            RunStatus::Failed | RunStatus::Cancelled => PipelineState::Failed {
                reason: result
                    .errors
                    .last()
                    .map(|e| e.message.clone())
                    .unwrap_or_default(),
            },
        };
        self.transition(&run.namespace, final_state);

        let summary = RunSummary {
            run_id: run.run_id.clone(),
            namespace: run.namespace.clone(),
            kind: kind.as_str().to_string(),
            strategy,
            status,
            started_at,
            finished_at: Utc::now().timestamp(),
            added: result.added,
            updated: result.updated,
            skipped: result.skipped,
            deleted: result.deleted,
            errors: result.errors.len(),
        };
        if let Err(err) = self.writer.tracker().store().record_run(&summary).await {
            warn!(run_id = %run.run_id, error = %format!("{:#}", err), "Failed to record run");
        }

        info!(
            namespace = %run.namespace,
            run_id = %run.run_id,
            status = status.as_str(),
            added = result.added,
            updated = result.updated,
            skipped = result.skipped,
            deleted = result.deleted,
            errors = result.errors.len(),
            "Source run finished"
        );

        (
            SourceReport {
                namespace: run.namespace,
                run_id: run.run_id,
                status,
                result,
            },
            rejection,
        )
    }

    /// Loading and normalizing. `Err` only when the origin cannot be listed;
    /// per-record failures land in `Loaded::errors`.
    async fn load(
        &self,
        adapter: &dyn SourceAdapter,
        origin: &Origin,
        run: &IndexingRun,
    ) -> IngestResult<Loaded> {
        self.transition(&run.namespace, PipelineState::Loading);
        let identities = adapter.list_identities(origin).await?;
        debug!(namespace = %run.namespace, identities = identities.len(), "Listed identities");

        let fetched: Vec<(Identity, IngestResult<RawRecord>)> = stream::iter(identities)
            .map(|identity| async move {
                let record = self.fetch_with_retry(adapter, &identity).await;
                (identity, record)
            })
            .buffered(self.options.fetch_concurrency.max(1))
            .collect()
            .await;

        self.transition(
            &run.namespace,
            PipelineState::Normalizing {
                records: fetched.len(),
            },
        );
        let normalizer = Normalizer::for_kind(adapter.kind(), &self.normalizer_config);
        let mut documents = Vec::new();
        let mut errors = Vec::new();
        for (identity, record) in fetched {
            let outcome = match record {
                Ok(record) => normalize_blocking(normalizer, record).await,
                Err(err) => Err(err),
            };
            match outcome {
                Ok(docs) => documents.extend(docs),
                Err(err) => {
                    warn!(
                        namespace = %run.namespace,
                        record = %identity.key,
                        error = %err,
                        "Record skipped"
                    );
                    errors.push(DocumentError::for_document(
                        identity.key.clone(),
                        origin.to_string(),
                        err.to_string(),
                    ));
                }
            }
        }

        Ok(Loaded { documents, errors })
    }

    async fn fetch_with_retry(
        &self,
        adapter: &dyn SourceAdapter,
        identity: &Identity,
    ) -> IngestResult<RawRecord> {
        let mut attempt = 0u32;
        loop {
            match adapter.fetch(identity).await {
                Ok(record) => return Ok(record),
                Err(err) if err.is_retryable() && attempt < self.options.max_batch_retries => {
                    attempt += 1;
                    debug!(record = %identity.key, attempt, error = %err, "Retrying fetch");
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(6);
        Duration::from_millis(self.options.retry_backoff_ms.saturating_mul(factor))
    }

    /// Batching, indexing and cleanup. Counts accumulate into `result`.
    async fn index(
        &self,
        run: &IndexingRun,
        documents: Vec<Document>,
        blocked: bool,
        result: &mut IndexWriteResult,
    ) -> RunStatus {
        self.transition(
            &run.namespace,
            PipelineState::Batching {
                documents: documents.len(),
            },
        );

        if run.strategy == Strategy::Full {
            if blocked {
                warn!(
                    namespace = %run.namespace,
                    "Records failed to load, keeping existing entries instead of purging"
                );
            } else {
                match self.purge(run).await {
                    Ok(deleted) => result.deleted += deleted,
                    Err(err) => {
                        result
                            .errors
                            .push(DocumentError::new(run.namespace.clone(), err.to_string()));
                        return RunStatus::Failed;
                    }
                }
            }
        }

        let batches: Vec<&[Document]> = split_even(&documents, self.options.batch_count)
            .into_iter()
            .filter(|b| !b.is_empty())
            .collect();
        let total = batches.len();

        for (i, batch) in batches.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(namespace = %run.namespace, batch = i + 1, "Cancelled, no further batches");
                result.errors.push(DocumentError::new(
                    format!("{} batch {}/{}", run.namespace, i + 1, total),
                    IngestError::Cancelled.to_string(),
                ));
                return RunStatus::Cancelled;
            }
            self.transition(&run.namespace, PipelineState::Indexing { batch: i + 1, total });

            let (committed, failure) = self.write_with_retry(run, batch).await;
            result.merge(committed);
            if let Some(err) = failure {
                warn!(namespace = %run.namespace, batch = i + 1, error = %err, "Batch failed");
                result.errors.push(DocumentError::new(
                    format!("{} batch {}/{}", run.namespace, i + 1, total),
                    err.to_string(),
                ));
                return RunStatus::Failed;
            }
        }

        self.transition(&run.namespace, PipelineState::Cleanup);
        if run.strategy == Strategy::Incremental {
            if blocked {
                warn!(namespace = %run.namespace, "Records failed to load, skipping sweep");
                return RunStatus::Failed;
            }
            match self.sweep(run).await {
                Ok(deleted) => result.deleted += deleted,
                Err(err) => {
                    result
                        .errors
                        .push(DocumentError::new(run.namespace.clone(), err.to_string()));
                    return RunStatus::Failed;
                }
            }
        }

        if blocked {
            RunStatus::Failed
        } else {
            RunStatus::Done
        }
    }

    /// Write a batch; a failed attempt is retried with its uncommitted
    /// documents only. Returns the committed counts and the final error.
    async fn write_with_retry(
        &self,
        run: &IndexingRun,
        batch: &[Document],
    ) -> (IndexWriteResult, Option<IngestError>) {
        let mut committed = IndexWriteResult::default();
        let mut pending = batch.to_vec();
        let mut attempt = 0u32;

        loop {
            match self.writer.write_batch(run, &pending).await {
                Ok(result) => {
                    committed.merge(result);
                    return (committed, None);
                }
                Err(failure) => {
                    committed.merge(failure.committed);
                    if !failure.error.is_retryable() || attempt >= self.options.max_batch_retries {
                        return (committed, Some(failure.error));
                    }
                    attempt += 1;
                    debug!(
                        namespace = %run.namespace,
                        attempt,
                        pending = failure.pending.len(),
                        error = %failure.error,
                        "Retrying batch"
                    );
                    pending = failure.pending;
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
            }
        }
    }

    async fn purge(&self, run: &IndexingRun) -> IngestResult<usize> {
        let entries = self.writer.tracker().purge_candidates(&run.namespace).await?;
        let deleted = self.writer.delete(&run.namespace, &entries).await?;
        if deleted > 0 {
            info!(namespace = %run.namespace, deleted, "Purged namespace for full run");
        }
        Ok(deleted)
    }

    async fn sweep(&self, run: &IndexingRun) -> IngestResult<usize> {
        let stale = self.writer.tracker().sweep_candidates(run).await?;
        let deleted = self.writer.delete(&run.namespace, &stale).await?;
        if deleted > 0 {
            info!(namespace = %run.namespace, deleted, "Swept entries not seen by this run");
        }
        Ok(deleted)
    }
}

/// Normalize on the blocking pool. The record, and any scratch file it
/// owns, is dropped there once normalization returns.
async fn normalize_blocking(normalizer: Normalizer, record: RawRecord) -> IngestResult<Vec<Document>> {
    let name = record.name.clone();
    tokio::task::spawn_blocking(move || normalizer.normalize(&record))
        .await
        .map_err(|e| IngestError::normalization(name, format!("normalizer task failed: {}", e)))?
}

fn pick(requested: &Option<String>, fallback: &Option<String>) -> Option<String> {
    [requested, fallback]
        .into_iter()
        .flatten()
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

/// Comma-separated request values, or the configured list when none given.
/// Order is kept and duplicates dropped.
fn split_list(requested: &Option<String>, fallback: &[String]) -> Vec<String> {
    let mut values: Vec<String> = requested
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect();
    if values.is_empty() {
        values = fallback
            .iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
    }
    let mut seen = std::collections::HashSet::new();
    values.retain(|v| seen.insert(v.clone()));
    values
}

fn missing(what: &str, setting: &str) -> IngestError {
    IngestError::ConfigurationMissing(format!(
        "no {} given and no {} configured",
        what, setting
    ))
}
