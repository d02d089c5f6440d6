//! Change-tracking ledger.
//!
//! The ledger remembers, per `(namespace, source_id)`, the content hash
//! last written to the index and the run that last saw the document. It is
//! the only persisted state the pipeline owns.
//!
//! # Mark and sweep
//!
//! ```text
//!  batch 1 ─┐
//!  batch 2 ─┼─ plan ─▶ index write ─▶ commit (mark: last_seen_run_id = run)
//!  batch n ─┘
//!                     ── barrier: all batches committed ──
//!  sweep: entries of the namespace whose last_seen_run_id != run
//! ```
//!
//! Skipped documents are marked too; otherwise every unchanged document
//! would be swept on the next run.
//!
//! Each `(namespace, source_id)` has its own async lock. [`ChangeTracker::plan`]
//! takes the locks of every document in the batch and the returned
//! [`WritePlan`] holds them until it is dropped, which the writer does only
//! after committing the ledger. Lookup-then-write is therefore a single-writer
//! critical section per document.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

use crate::error::{IngestError, IngestResult};
use crate::models::{Document, IndexingRun, Strategy};
use crate::store::record_uid;
use crate::uploads::ContentFile;

/// Persisted state for one indexed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub namespace: String,
    pub source_id: String,
    pub content_hash: String,
    pub last_seen_run_id: String,
    /// Key of the record in the index store.
    pub uid: String,
}

/// Final state of a source run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Done,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "done" => RunStatus::Done,
            "cancelled" => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        }
    }
}

/// A row of run history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub namespace: String,
    pub kind: String,
    pub strategy: Strategy,
    pub status: RunStatus,
    pub started_at: i64,
    pub finished_at: i64,
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub errors: usize,
}

/// Durable storage for ledger entries, run history and stored uploads.
///
/// Only [`ChangeTracker`] and the pipeline's bookkeeping call this trait;
/// every other component goes through them.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get(&self, namespace: &str, source_id: &str) -> Result<Option<LedgerEntry>>;

    /// Insert or replace the entry keyed by `(namespace, source_id)`.
    async fn upsert(&self, entry: &LedgerEntry) -> Result<()>;

    /// Advance `last_seen_run_id` without touching the hash.
    async fn touch(&self, namespace: &str, source_id: &str, run_id: &str) -> Result<()>;

    /// Entries of `namespace` not seen by `run_id`.
    async fn unseen(&self, namespace: &str, run_id: &str) -> Result<Vec<LedgerEntry>>;

    async fn entries(&self, namespace: &str) -> Result<Vec<LedgerEntry>>;

    /// Returns the number of entries removed.
    async fn remove(&self, namespace: &str, source_ids: &[String]) -> Result<usize>;

    /// Remove entries by index uid, across namespaces.
    async fn remove_by_uids(&self, uids: &[String]) -> Result<usize>;

    async fn record_run(&self, run: &RunSummary) -> Result<()>;

    /// Most recent runs first.
    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>>;

    async fn record_upload(&self, file: &ContentFile) -> Result<()>;

    /// Every stored upload, newest first.
    async fn uploads(&self) -> Result<Vec<ContentFile>>;

    /// Returns `false` when no upload has this id.
    async fn forget_upload(&self, internal_id: &str) -> Result<bool>;
}

/// What the writer must do with one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Insert,
    Update,
    Skip,
}

/// One document of a batch with its decision and its held lock.
#[derive(Debug)]
pub struct PlannedWrite {
    pub document: Document,
    pub decision: Decision,
    pub uid: String,
    pub content_hash: String,
    _guard: OwnedMutexGuard<()>,
}

/// The ledger's decisions for a batch.
#[derive(Debug, Default)]
pub struct WritePlan {
    pub writes: Vec<PlannedWrite>,
    /// `source_id`s that appeared more than once; only the first was planned.
    pub duplicates: Vec<String>,
}

impl WritePlan {
    pub fn count(&self, decision: Decision) -> usize {
        self.writes.iter().filter(|w| w.decision == decision).count()
    }
}

/// Keys tracked before [`KeyedLocks`] first prunes released entries.
const PRUNE_MIN: usize = 64;

/// Per-key async locks.
///
/// Entries nobody holds are pruned once the table reaches a threshold that
/// doubles with the number of held keys, so acquiring is amortized O(1) even
/// while a plan holds a whole batch.
pub struct KeyedLocks {
    table: Mutex<LockTable>,
}

struct LockTable {
    locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    prune_at: usize,
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self {
            table: Mutex::new(LockTable {
                locks: HashMap::new(),
                prune_at: PRUNE_MIN,
            }),
        }
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            if table.locks.len() >= table.prune_at {
                table.locks.retain(|_, l| Arc::strong_count(l) > 1);
                table.prune_at = (table.locks.len() * 2).max(PRUNE_MIN);
            }
            table
                .locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .locks
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_key(namespace: &str, source_id: &str) -> String {
    format!("{}\n{}", namespace, source_id)
}

/// Decides insert/update/skip per document and computes sweep sets.
pub struct ChangeTracker {
    store: Arc<dyn LedgerStore>,
    locks: KeyedLocks,
}

impl ChangeTracker {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Compute the write plan for a batch.
    ///
    /// Locks are taken in sorted key order so that two plans over
    /// overlapping documents cannot deadlock.
    pub async fn plan(&self, run: &IndexingRun, documents: &[Document]) -> IngestResult<WritePlan> {
        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(documents.len());
        let mut duplicates = Vec::new();
        for doc in documents {
            if seen.insert(doc.source_id.as_str()) {
                unique.push(doc);
            } else {
                tracing::warn!(
                    namespace = %run.namespace,
                    source_id = %doc.source_id,
                    "duplicate source id in batch, keeping first occurrence"
                );
                duplicates.push(doc.source_id.clone());
            }
        }

        let keys: BTreeSet<&str> = unique.iter().map(|d| d.source_id.as_str()).collect();
        let mut guards = HashMap::with_capacity(keys.len());
        for source_id in keys {
            let guard = self.locks.acquire(&lock_key(&run.namespace, source_id)).await;
            guards.insert(source_id.to_string(), guard);
        }

        let mut writes = Vec::with_capacity(unique.len());
        for doc in unique {
            let content_hash = doc.content_hash();
            let existing = self
                .store
                .get(&run.namespace, &doc.source_id)
                .await
                .map_err(IngestError::ledger)?;

            let (decision, uid) = match existing {
                None => (Decision::Insert, record_uid(&run.namespace, &doc.source_id)),
                Some(entry) if entry.content_hash != content_hash => (Decision::Update, entry.uid),
                Some(entry) => (Decision::Skip, entry.uid),
            };

            let guard = guards.remove(&doc.source_id).ok_or_else(|| {
                IngestError::Ledger(format!("no lock held for {}", doc.source_id))
            })?;
            writes.push(PlannedWrite {
                document: doc.clone(),
                decision,
                uid,
                content_hash,
                _guard: guard,
            });
        }

        Ok(WritePlan { writes, duplicates })
    }

    /// Record a planned write as seen by `run`.
    ///
    /// Inserts and updates store the new hash; skips only advance the run
    /// marker.
    pub async fn commit(&self, run: &IndexingRun, write: &PlannedWrite) -> IngestResult<()> {
        let result = match write.decision {
            Decision::Insert | Decision::Update => {
                self.store
                    .upsert(&LedgerEntry {
                        namespace: run.namespace.clone(),
                        source_id: write.document.source_id.clone(),
                        content_hash: write.content_hash.clone(),
                        last_seen_run_id: run.run_id.clone(),
                        uid: write.uid.clone(),
                    })
                    .await
            }
            Decision::Skip => {
                self.store
                    .touch(&run.namespace, &write.document.source_id, &run.run_id)
                    .await
            }
        };
        result.map_err(IngestError::ledger)
    }

    /// Entries the sweep of an incremental run should delete.
    pub async fn sweep_candidates(&self, run: &IndexingRun) -> IngestResult<Vec<LedgerEntry>> {
        self.store
            .unseen(&run.namespace, &run.run_id)
            .await
            .map_err(IngestError::ledger)
    }

    /// Every entry of the namespace, for the purge that opens a full run.
    pub async fn purge_candidates(&self, namespace: &str) -> IngestResult<Vec<LedgerEntry>> {
        self.store
            .entries(namespace)
            .await
            .map_err(IngestError::ledger)
    }

    /// Drop entries whose index records are gone.
    pub async fn forget(&self, namespace: &str, source_ids: &[String]) -> IngestResult<usize> {
        if source_ids.is_empty() {
            return Ok(0);
        }
        self.store
            .remove(namespace, source_ids)
            .await
            .map_err(IngestError::ledger)
    }

    /// Drop entries by index uid, whatever their namespace.
    pub async fn forget_uids(&self, uids: &[String]) -> IngestResult<usize> {
        if uids.is_empty() {
            return Ok(0);
        }
        self.store
            .remove_by_uids(uids)
            .await
            .map_err(IngestError::ledger)
    }
}
