//! In-memory [`IndexStore`] and [`LedgerStore`] implementations for tests.
//!
//! Both use `HashMap`s behind `std::sync::RwLock`. Keyword search counts
//! matching query terms; vector search is brute-force cosine similarity.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use anyhow::Result;
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::ledger::{LedgerEntry, LedgerStore, RunSummary};
use crate::uploads::ContentFile;

use super::{Hit, IndexRecord, IndexStore};

/// In-memory index store.
#[derive(Default)]
pub struct InMemoryIndexStore {
    records: RwLock<HashMap<String, IndexRecord>>,
}

impl InMemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record, sorted by source id.
    pub fn records(&self) -> Vec<IndexRecord> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<IndexRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        all
    }
}

fn rank(mut hits: Vec<Hit>, limit: usize) -> Vec<Hit> {
    hits.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.source_id.cmp(&b.source_id))
    });
    hits.truncate(limit);
    hits
}

#[async_trait]
impl IndexStore for InMemoryIndexStore {
    async fn upsert(&self, record: &IndexRecord) -> Result<()> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.insert(record.uid.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, uids: &[String]) -> Result<usize> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        Ok(uids.iter().filter(|uid| records.remove(*uid).is_some()).count())
    }

    async fn delete_by_internal_id(&self, internal_id: &str) -> Result<Vec<String>> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let uids: Vec<String> = records
            .values()
            .filter(|r| r.internal_id() == Some(internal_id))
            .map(|r| r.uid.clone())
            .collect();
        for uid in &uids {
            records.remove(uid);
        }
        Ok(uids)
    }

    async fn get(&self, uid: &str) -> Result<Option<IndexRecord>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(uid).cloned())
    }

    async fn count(&self) -> Result<usize> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records.len())
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<Hit>> {
        let query_lower = query.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let hits = records
            .values()
            .filter_map(|r| {
                let text_lower = r.content.to_lowercase();
                let matches = terms.iter().filter(|t| text_lower.contains(*t)).count();
                (matches > 0).then(|| Hit {
                    uid: r.uid.clone(),
                    source_id: r.source_id.clone(),
                    text: r.content.clone(),
                    raw_score: matches as f64,
                })
            })
            .collect();
        Ok(rank(hits, limit))
    }

    async fn vector_search(&self, query: &[f32], limit: usize) -> Result<Vec<Hit>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let hits = records
            .values()
            .filter_map(|r| {
                r.embedding.as_ref().map(|e| Hit {
                    uid: r.uid.clone(),
                    source_id: r.source_id.clone(),
                    text: r.content.clone(),
                    raw_score: cosine_similarity(query, &e.values) as f64,
                })
            })
            .collect();
        Ok(rank(hits, limit))
    }
}

/// In-memory ledger store.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    entries: RwLock<HashMap<(String, String), LedgerEntry>>,
    runs: RwLock<Vec<RunSummary>>,
    uploads: RwLock<Vec<ContentFile>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted(mut entries: Vec<LedgerEntry>) -> Vec<LedgerEntry> {
    entries.sort_by(|a, b| a.source_id.cmp(&b.source_id));
    entries
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn get(&self, namespace: &str, source_id: &str) -> Result<Option<LedgerEntry>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .get(&(namespace.to_string(), source_id.to_string()))
            .cloned())
    }

    async fn upsert(&self, entry: &LedgerEntry) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            (entry.namespace.clone(), entry.source_id.clone()),
            entry.clone(),
        );
        Ok(())
    }

    async fn touch(&self, namespace: &str, source_id: &str, run_id: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&(namespace.to_string(), source_id.to_string())) {
            entry.last_seen_run_id = run_id.to_string();
        }
        Ok(())
    }

    async fn unseen(&self, namespace: &str, run_id: &str) -> Result<Vec<LedgerEntry>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(sorted(
            entries
                .values()
                .filter(|e| e.namespace == namespace && e.last_seen_run_id != run_id)
                .cloned()
                .collect(),
        ))
    }

    async fn entries(&self, namespace: &str) -> Result<Vec<LedgerEntry>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(sorted(
            entries
                .values()
                .filter(|e| e.namespace == namespace)
                .cloned()
                .collect(),
        ))
    }

    async fn remove(&self, namespace: &str, source_ids: &[String]) -> Result<usize> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Ok(source_ids
            .iter()
            .filter(|id| {
                entries
                    .remove(&(namespace.to_string(), id.to_string()))
                    .is_some()
            })
            .count())
    }

    async fn remove_by_uids(&self, uids: &[String]) -> Result<usize> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, e| !uids.contains(&e.uid));
        Ok(before - entries.len())
    }

    async fn record_run(&self, run: &RunSummary) -> Result<()> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        runs.push(run.clone());
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(runs.iter().rev().take(limit).cloned().collect())
    }

    async fn record_upload(&self, file: &ContentFile) -> Result<()> {
        let mut uploads = self.uploads.write().unwrap_or_else(PoisonError::into_inner);
        uploads.retain(|u| u.id != file.id);
        uploads.push(file.clone());
        Ok(())
    }

    async fn uploads(&self) -> Result<Vec<ContentFile>> {
        let uploads = self.uploads.read().unwrap_or_else(PoisonError::into_inner);
        Ok(uploads.iter().rev().cloned().collect())
    }

    async fn forget_upload(&self, internal_id: &str) -> Result<bool> {
        let mut uploads = self.uploads.write().unwrap_or_else(PoisonError::into_inner);
        let before = uploads.len();
        uploads.retain(|u| u.id != internal_id);
        Ok(uploads.len() < before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Metadata, MetaValue};
    use crate::store::Embedding;

    fn record(uid: &str, content: &str, internal_id: Option<&str>) -> IndexRecord {
        let mut metadata = Metadata::new();
        if let Some(id) = internal_id {
            metadata.insert("internal_id".into(), MetaValue::from(id));
        }
        IndexRecord {
            uid: uid.into(),
            namespace: "ns".into(),
            source_id: format!("src-{}", uid),
            content: content.into(),
            metadata,
            embedding: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_overwrites_same_uid() {
        let store = InMemoryIndexStore::new();
        store.upsert(&record("1", "old", None)).await.unwrap();
        store.upsert(&record("1", "new", None)).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.get("1").await.unwrap().unwrap().content, "new");
    }

    #[tokio::test]
    async fn test_delete_by_internal_id() {
        let store = InMemoryIndexStore::new();
        store.upsert(&record("1", "a", Some("up-1"))).await.unwrap();
        store.upsert(&record("2", "b", Some("up-1"))).await.unwrap();
        store.upsert(&record("3", "c", Some("up-2"))).await.unwrap();
        let mut removed = store.delete_by_internal_id("up-1").await.unwrap();
        removed.sort();
        assert_eq!(removed, vec!["1".to_string(), "2".to_string()]);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_keyword_search_ranks_by_matching_terms() {
        let store = InMemoryIndexStore::new();
        store.upsert(&record("1", "deploy the service", None)).await.unwrap();
        store.upsert(&record("2", "deploy service rollback", None)).await.unwrap();
        store.upsert(&record("3", "unrelated", None)).await.unwrap();
        let hits = store.keyword_search("service rollback", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].uid, "2");
    }

    #[tokio::test]
    async fn test_vector_search_skips_records_without_embedding() {
        let store = InMemoryIndexStore::new();
        let mut with = record("1", "a", None);
        with.embedding = Some(Embedding {
            model: "m".into(),
            values: vec![1.0, 0.0],
        });
        store.upsert(&with).await.unwrap();
        store.upsert(&record("2", "b", None)).await.unwrap();
        let hits = store.vector_search(&[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].raw_score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_ledger_remove_by_uids() {
        let store = InMemoryLedgerStore::new();
        for (sid, uid) in [("a", "u1"), ("b", "u2")] {
            store
                .upsert(&LedgerEntry {
                    namespace: "ns".into(),
                    source_id: sid.into(),
                    content_hash: "h".into(),
                    last_seen_run_id: "r".into(),
                    uid: uid.into(),
                })
                .await
                .unwrap();
        }
        assert_eq!(store.remove_by_uids(&["u1".to_string()]).await.unwrap(), 1);
        assert_eq!(store.entries("ns").await.unwrap().len(), 1);
    }
}
