//! Index writer: executes a batch's write plan.
//!
//! For every document of a batch the writer asks the [`ChangeTracker`] for
//! a decision, embeds what must be (re)written, upserts the index records
//! concurrently and then commits each document to the ledger. The ledger
//! lock of a document is held from planning until its commit.
//!
//! # Dual-write ordering
//!
//! The index is written first and the ledger second. If the ledger commit
//! fails after the index write succeeded, the document is reported as a
//! [`IngestError::LedgerInconsistency`]. Re-running heals it: the index uid
//! is deterministic and the stale ledger hash turns the document into an
//! update.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::embedding::Embedder;
use crate::error::{IngestError, IngestResult};
use crate::ledger::{ChangeTracker, Decision, LedgerEntry, PlannedWrite};
use crate::models::{Document, IndexWriteResult, IndexingRun};
use crate::store::{Embedding, IndexRecord, IndexStore};

/// A batch that did not fully commit.
#[derive(Debug)]
pub struct BatchFailure {
    /// Counts of the documents that did commit.
    pub committed: IndexWriteResult,
    /// Documents still to write, for a retry.
    pub pending: Vec<Document>,
    /// First error encountered.
    pub error: IngestError,
}

pub struct IndexWriter {
    index: Arc<dyn IndexStore>,
    tracker: Arc<ChangeTracker>,
    embedder: Arc<dyn Embedder>,
    write_concurrency: usize,
}

impl IndexWriter {
    pub fn new(
        index: Arc<dyn IndexStore>,
        tracker: Arc<ChangeTracker>,
        embedder: Arc<dyn Embedder>,
        write_concurrency: usize,
    ) -> Self {
        Self {
            index,
            tracker,
            embedder,
            write_concurrency: write_concurrency.max(1),
        }
    }

    pub fn index(&self) -> &Arc<dyn IndexStore> {
        &self.index
    }

    pub fn tracker(&self) -> &Arc<ChangeTracker> {
        &self.tracker
    }

    /// Plan, write and commit one batch.
    ///
    /// Duplicate `sourceId`s inside the batch count as skipped.
    pub async fn write_batch(
        &self,
        run: &IndexingRun,
        documents: &[Document],
    ) -> Result<IndexWriteResult, BatchFailure> {
        let plan = match self.tracker.plan(run, documents).await {
            Ok(plan) => plan,
            Err(error) => {
                return Err(BatchFailure {
                    committed: IndexWriteResult::default(),
                    pending: documents.to_vec(),
                    error,
                })
            }
        };

        let mut result = IndexWriteResult {
            skipped: plan.duplicates.len(),
            ..Default::default()
        };

        let vectors = match self.embed_changed(&plan.writes).await {
            Ok(vectors) => vectors,
            Err(error) => {
                return Err(BatchFailure {
                    committed: result,
                    pending: plan.writes.iter().map(|w| w.document.clone()).collect(),
                    error,
                })
            }
        };

        let outcomes: Vec<(Decision, Document, IngestResult<()>)> =
            stream::iter(plan.writes.into_iter().zip(vectors))
                .map(|(write, vector)| self.apply(run, write, vector))
                .buffer_unordered(self.write_concurrency)
                .collect()
                .await;

        let mut pending = Vec::new();
        let mut first_error = None;
        for (decision, document, outcome) in outcomes {
            match outcome {
                Ok(()) => match decision {
                    Decision::Insert => result.added += 1,
                    Decision::Update => result.updated += 1,
                    Decision::Skip => result.skipped += 1,
                },
                Err(err) => {
                    warn!(
                        namespace = %run.namespace,
                        source_id = %document.source_id,
                        error = %err,
                        "Document write failed"
                    );
                    pending.push(document);
                    first_error.get_or_insert(err);
                }
            }
        }

        debug!(
            namespace = %run.namespace,
            added = result.added,
            updated = result.updated,
            skipped = result.skipped,
            failed = pending.len(),
            "Batch written"
        );

        match first_error {
            None => Ok(result),
            Some(error) => {
                // Keep the caller's order so a retry batches the same way
                pending.sort_by_key(|d| {
                    documents
                        .iter()
                        .position(|o| o.source_id == d.source_id)
                        .unwrap_or(usize::MAX)
                });
                Err(BatchFailure {
                    committed: result,
                    pending,
                    error,
                })
            }
        }
    }

    /// Vectors for inserted and updated documents, `None` for skips or when
    /// embeddings are disabled.
    async fn embed_changed(&self, writes: &[PlannedWrite]) -> IngestResult<Vec<Option<Vec<f32>>>> {
        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; writes.len()];
        if !self.embedder.is_enabled() {
            return Ok(vectors);
        }

        let changed: Vec<usize> = writes
            .iter()
            .enumerate()
            .filter(|(_, w)| w.decision != Decision::Skip)
            .map(|(i, _)| i)
            .collect();
        if changed.is_empty() {
            return Ok(vectors);
        }

        let texts: Vec<String> = changed
            .iter()
            .map(|&i| writes[i].document.content.clone())
            .collect();
        let embedded = self
            .embedder
            .embed(&texts)
            .await
            .map_err(|e| IngestError::transient(format!("embedding failed: {:#}", e)))?;
        if embedded.len() != changed.len() {
            return Err(IngestError::transient(format!(
                "embedder returned {} vectors for {} texts",
                embedded.len(),
                changed.len()
            )));
        }

        for (i, vector) in changed.into_iter().zip(embedded) {
            vectors[i] = Some(vector);
        }
        Ok(vectors)
    }

    /// Write one planned document. The ledger lock is released when `write`
    /// drops at the end of this call.
    async fn apply(
        &self,
        run: &IndexingRun,
        write: PlannedWrite,
        vector: Option<Vec<f32>>,
    ) -> (Decision, Document, IngestResult<()>) {
        let decision = write.decision;

        if decision != Decision::Skip {
            let record = IndexRecord {
                uid: write.uid.clone(),
                namespace: run.namespace.clone(),
                source_id: write.document.source_id.clone(),
                content: write.document.content.clone(),
                metadata: write.document.metadata.clone(),
                embedding: vector.map(|values| Embedding {
                    model: self.embedder.model_name().to_string(),
                    values,
                }),
            };
            if let Err(err) = self.index.upsert(&record).await {
                return (decision, write.document.clone(), Err(IngestError::index_store(err)));
            }
        }

        let outcome = match self.tracker.commit(run, &write).await {
            Ok(()) => Ok(()),
            Err(err) if decision != Decision::Skip => Err(IngestError::LedgerInconsistency {
                source_id: write.document.source_id.clone(),
                message: err.to_string(),
            }),
            Err(err) => Err(err),
        };
        (decision, write.document.clone(), outcome)
    }

    /// Remove ledger entries and their index records.
    ///
    /// Index records go first, so a failure leaves entries that the next
    /// sweep will find again.
    pub async fn delete(&self, namespace: &str, entries: &[LedgerEntry]) -> IngestResult<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let uids: Vec<String> = entries.iter().map(|e| e.uid.clone()).collect();
        self.index
            .delete(&uids)
            .await
            .map_err(IngestError::index_store)?;

        let source_ids: Vec<String> = entries.iter().map(|e| e.source_id.clone()).collect();
        let removed = self.tracker.forget(namespace, &source_ids).await?;
        debug!(namespace = %namespace, removed, "Deleted stale entries");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DisabledEmbedder;
    use crate::models::Strategy;
    use crate::store::memory::{InMemoryIndexStore, InMemoryLedgerStore};
    use crate::store::Hit;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Index store that refuses writes for selected source ids.
    struct FlakyIndex {
        inner: InMemoryIndexStore,
        failing: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl IndexStore for FlakyIndex {
        async fn upsert(&self, record: &IndexRecord) -> anyhow::Result<()> {
            if self.failing.lock().unwrap().contains(&record.source_id) {
                anyhow::bail!("connection reset");
            }
            self.inner.upsert(record).await
        }
        async fn delete(&self, uids: &[String]) -> anyhow::Result<usize> {
            self.inner.delete(uids).await
        }
        async fn delete_by_internal_id(&self, id: &str) -> anyhow::Result<Vec<String>> {
            self.inner.delete_by_internal_id(id).await
        }
        async fn get(&self, uid: &str) -> anyhow::Result<Option<IndexRecord>> {
            self.inner.get(uid).await
        }
        async fn count(&self) -> anyhow::Result<usize> {
            self.inner.count().await
        }
        async fn keyword_search(&self, q: &str, limit: usize) -> anyhow::Result<Vec<Hit>> {
            self.inner.keyword_search(q, limit).await
        }
        async fn vector_search(&self, v: &[f32], limit: usize) -> anyhow::Result<Vec<Hit>> {
            self.inner.vector_search(v, limit).await
        }
    }

    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn docs(contents: &[(&str, &str)]) -> Vec<Document> {
        contents.iter().map(|(id, c)| Document::new(*id, *c)).collect()
    }

    fn writer_with(index: Arc<dyn IndexStore>, embedder: Arc<dyn Embedder>) -> IndexWriter {
        let tracker = Arc::new(ChangeTracker::new(Arc::new(InMemoryLedgerStore::new())));
        IndexWriter::new(index, tracker, embedder, 4)
    }

    #[tokio::test]
    async fn test_insert_then_skip_with_duplicates() {
        let index = Arc::new(InMemoryIndexStore::new());
        let writer = writer_with(index.clone(), Arc::new(DisabledEmbedder));

        let batch = docs(&[("a", "one"), ("b", "two"), ("a", "dup")]);
        let run = IndexingRun::start("ns", Strategy::Incremental);
        let first = writer.write_batch(&run, &batch).await.unwrap();
        assert_eq!((first.added, first.skipped), (2, 1));
        assert_eq!(index.count().await.unwrap(), 2);

        let run = IndexingRun::start("ns", Strategy::Incremental);
        let second = writer.write_batch(&run, &batch).await.unwrap();
        assert_eq!((second.added, second.updated, second.skipped), (0, 0, 3));
    }

    #[tokio::test]
    async fn test_changed_content_is_updated_in_place() {
        let index = Arc::new(InMemoryIndexStore::new());
        let writer = writer_with(index.clone(), Arc::new(DisabledEmbedder));

        let run = IndexingRun::start("ns", Strategy::Incremental);
        writer.write_batch(&run, &docs(&[("a", "one")])).await.unwrap();
        let run = IndexingRun::start("ns", Strategy::Incremental);
        let result = writer.write_batch(&run, &docs(&[("a", "uno")])).await.unwrap();
        assert_eq!(result.updated, 1);

        let records = index.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "uno");
    }

    #[tokio::test]
    async fn test_failed_index_write_leaves_pending_documents() {
        let index = Arc::new(FlakyIndex {
            inner: InMemoryIndexStore::new(),
            failing: Mutex::new(HashSet::from(["b".to_string()])),
        });
        let writer = writer_with(index.clone(), Arc::new(DisabledEmbedder));
        let run = IndexingRun::start("ns", Strategy::Incremental);
        let batch = docs(&[("a", "one"), ("b", "two"), ("c", "three")]);

        let failure = writer.write_batch(&run, &batch).await.unwrap_err();
        assert_eq!(failure.committed.added, 2);
        assert_eq!(failure.pending.len(), 1);
        assert_eq!(failure.pending[0].source_id, "b");
        assert!(matches!(failure.error, IngestError::IndexStore(_)));
        assert!(failure.error.is_retryable());

        // The retry only carries what did not commit
        index.failing.lock().unwrap().clear();
        let retried = writer.write_batch(&run, &failure.pending).await.unwrap();
        assert_eq!(retried.added, 1);
        assert_eq!(index.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_embeddings_only_for_changed_documents() {
        let index = Arc::new(InMemoryIndexStore::new());
        let writer = writer_with(index.clone(), Arc::new(FixedEmbedder));
        let run = IndexingRun::start("ns", Strategy::Incremental);
        writer.write_batch(&run, &docs(&[("a", "four")])).await.unwrap();

        let record = &index.records()[0];
        let embedding = record.embedding.as_ref().unwrap();
        assert_eq!(embedding.model, "fixed");
        assert_eq!(embedding.values, vec![4.0, 1.0]);
    }

    #[tokio::test]
    async fn test_delete_removes_records_and_entries() {
        let index = Arc::new(InMemoryIndexStore::new());
        let writer = writer_with(index.clone(), Arc::new(DisabledEmbedder));
        let run = IndexingRun::start("ns", Strategy::Incremental);
        writer
            .write_batch(&run, &docs(&[("a", "one"), ("b", "two")]))
            .await
            .unwrap();

        let entries = writer.tracker().purge_candidates("ns").await.unwrap();
        let stale: Vec<LedgerEntry> = entries.into_iter().filter(|e| e.source_id == "a").collect();
        assert_eq!(writer.delete("ns", &stale).await.unwrap(), 1);
        assert_eq!(index.count().await.unwrap(), 1);
        assert_eq!(writer.tracker().purge_candidates("ns").await.unwrap().len(), 1);
    }
}
