//! SQLite-backed [`IndexStore`] and [`LedgerStore`] implementations.
//!
//! Both wrap a shared [`SqlitePool`] and assume the schema created by
//! [`migrate::migrate_pool`](crate::migrate::migrate_pool):
//! `index_records` + `index_fts` + `index_vectors` for the index, and
//! `ledger_entries` + `indexing_runs` + `uploads` for the ledger.

use anyhow::{Context, Result};
use chrono::DateTime;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::ledger::{LedgerEntry, LedgerStore, RunStatus, RunSummary};
use crate::models::{Metadata, Strategy};
use crate::store::{Embedding, Hit, IndexRecord, IndexStore};
use crate::uploads::ContentFile;

/// SQLite implementation of [`IndexStore`].
///
/// Keyword search goes through FTS5 (`bm25` rank, negated so that higher
/// is better); vector search is brute-force cosine over every stored blob.
#[derive(Clone)]
pub struct SqliteIndexStore {
    pool: SqlitePool,
}

impl SqliteIndexStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Turn free text into an FTS5 query: every term quoted, any term may match.
fn fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn record_from_row(row: &SqliteRow) -> IndexRecord {
    let metadata_json: String = row.get("metadata_json");
    let metadata: Metadata = serde_json::from_str(&metadata_json).unwrap_or_default();
    let model: Option<String> = row.get("model");
    let vector: Option<Vec<u8>> = row.get("vector");
    let embedding = match (model, vector) {
        (Some(model), Some(blob)) => Some(Embedding {
            model,
            values: blob_to_vec(&blob),
        }),
        _ => None,
    };
    IndexRecord {
        uid: row.get("uid"),
        namespace: row.get("namespace"),
        source_id: row.get("source_id"),
        content: row.get("content"),
        metadata,
        embedding,
    }
}

#[async_trait]
impl IndexStore for SqliteIndexStore {
    async fn upsert(&self, record: &IndexRecord) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let metadata_json = serde_json::to_string(&record.metadata)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO index_records (uid, namespace, source_id, content, metadata_json,
                                       internal_id, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(uid) DO UPDATE SET
                namespace = excluded.namespace,
                source_id = excluded.source_id,
                content = excluded.content,
                metadata_json = excluded.metadata_json,
                internal_id = excluded.internal_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.uid)
        .bind(&record.namespace)
        .bind(&record.source_id)
        .bind(&record.content)
        .bind(&metadata_json)
        .bind(record.internal_id())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM index_fts WHERE uid = ?")
            .bind(&record.uid)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO index_fts (uid, content) VALUES (?, ?)")
            .bind(&record.uid)
            .bind(&record.content)
            .execute(&mut *tx)
            .await?;

        match &record.embedding {
            Some(embedding) => {
                sqlx::query(
                    r#"
                    INSERT INTO index_vectors (uid, model, dims, vector)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(uid) DO UPDATE SET
                        model = excluded.model,
                        dims = excluded.dims,
                        vector = excluded.vector
                    "#,
                )
                .bind(&record.uid)
                .bind(&embedding.model)
                .bind(embedding.values.len() as i64)
                .bind(vec_to_blob(&embedding.values))
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM index_vectors WHERE uid = ?")
                    .bind(&record.uid)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, uids: &[String]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0u64;
        for uid in uids {
            sqlx::query("DELETE FROM index_fts WHERE uid = ?")
                .bind(uid)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM index_vectors WHERE uid = ?")
                .bind(uid)
                .execute(&mut *tx)
                .await?;
            removed += sqlx::query("DELETE FROM index_records WHERE uid = ?")
                .bind(uid)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed as usize)
    }

    async fn delete_by_internal_id(&self, internal_id: &str) -> Result<Vec<String>> {
        let uids: Vec<String> =
            sqlx::query_scalar("SELECT uid FROM index_records WHERE internal_id = ? ORDER BY uid")
                .bind(internal_id)
                .fetch_all(&self.pool)
                .await?;
        self.delete(&uids).await?;
        Ok(uids)
    }

    async fn get(&self, uid: &str) -> Result<Option<IndexRecord>> {
        let row = sqlx::query(
            r#"
            SELECT r.uid, r.namespace, r.source_id, r.content, r.metadata_json,
                   v.model, v.vector
            FROM index_records r
            LEFT JOIN index_vectors v ON v.uid = r.uid
            WHERE r.uid = ?
            "#,
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(record_from_row))
    }

    async fn count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<Hit>> {
        let fts = fts_query(query);
        if fts.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT index_fts.uid AS uid, r.source_id AS source_id, r.content AS content,
                   index_fts.rank AS rank
            FROM index_fts
            JOIN index_records r ON r.uid = index_fts.uid
            WHERE index_fts MATCH ?
            ORDER BY index_fts.rank
            LIMIT ?
            "#,
        )
        .bind(&fts)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("keyword search failed for query: {}", query))?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                Hit {
                    uid: row.get("uid"),
                    source_id: row.get("source_id"),
                    text: row.get("content"),
                    raw_score: -rank,
                }
            })
            .collect())
    }

    async fn vector_search(&self, query: &[f32], limit: usize) -> Result<Vec<Hit>> {
        let rows = sqlx::query(
            r#"
            SELECT v.uid, v.vector, r.source_id, r.content
            FROM index_vectors v
            JOIN index_records r ON r.uid = v.uid
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<Hit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vector");
                Hit {
                    uid: row.get("uid"),
                    source_id: row.get("source_id"),
                    text: row.get("content"),
                    raw_score: cosine_similarity(query, &blob_to_vec(&blob)) as f64,
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

/// SQLite implementation of [`LedgerStore`].
#[derive(Clone)]
pub struct SqliteLedgerStore {
    pool: SqlitePool,
}

impl SqliteLedgerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn entry_from_row(row: &SqliteRow) -> LedgerEntry {
    LedgerEntry {
        namespace: row.get("namespace"),
        source_id: row.get("source_id"),
        content_hash: row.get("content_hash"),
        last_seen_run_id: row.get("last_seen_run_id"),
        uid: row.get("uid"),
    }
}

fn run_from_row(row: &SqliteRow) -> RunSummary {
    let strategy: String = row.get("strategy");
    let status: String = row.get("status");
    let count = |name: &str| row.get::<i64, _>(name) as usize;
    RunSummary {
        run_id: row.get("run_id"),
        namespace: row.get("namespace"),
        kind: row.get("kind"),
        strategy: if strategy == "full" {
            Strategy::Full
        } else {
            Strategy::Incremental
        },
        status: RunStatus::parse(&status),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        added: count("added"),
        updated: count("updated"),
        skipped: count("skipped"),
        deleted: count("deleted"),
        errors: count("errors"),
    }
}

fn upload_from_row(row: &SqliteRow) -> ContentFile {
    let path: String = row.get("path");
    let created_at: i64 = row.get("created_at");
    ContentFile {
        id: row.get("id"),
        file_name: row.get("file_name"),
        path: path.into(),
        description: row.get("description"),
        created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_default(),
    }
}

const ENTRY_COLUMNS: &str = "namespace, source_id, content_hash, last_seen_run_id, uid";

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn get(&self, namespace: &str, source_id: &str) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries WHERE namespace = ? AND source_id = ?",
            ENTRY_COLUMNS
        ))
        .bind(namespace)
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(entry_from_row))
    }

    async fn upsert(&self, entry: &LedgerEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (namespace, source_id, content_hash, last_seen_run_id,
                                        uid, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(namespace, source_id) DO UPDATE SET
                content_hash = excluded.content_hash,
                last_seen_run_id = excluded.last_seen_run_id,
                uid = excluded.uid,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&entry.namespace)
        .bind(&entry.source_id)
        .bind(&entry.content_hash)
        .bind(&entry.last_seen_run_id)
        .bind(&entry.uid)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch(&self, namespace: &str, source_id: &str, run_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE ledger_entries SET last_seen_run_id = ? WHERE namespace = ? AND source_id = ?",
        )
        .bind(run_id)
        .bind(namespace)
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unseen(&self, namespace: &str, run_id: &str) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries WHERE namespace = ? AND last_seen_run_id != ? ORDER BY source_id",
            ENTRY_COLUMNS
        ))
        .bind(namespace)
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(entry_from_row).collect())
    }

    async fn entries(&self, namespace: &str) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries WHERE namespace = ? ORDER BY source_id",
            ENTRY_COLUMNS
        ))
        .bind(namespace)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(entry_from_row).collect())
    }

    async fn remove(&self, namespace: &str, source_ids: &[String]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0u64;
        for source_id in source_ids {
            removed += sqlx::query(
                "DELETE FROM ledger_entries WHERE namespace = ? AND source_id = ?",
            )
            .bind(namespace)
            .bind(source_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(removed as usize)
    }

    async fn remove_by_uids(&self, uids: &[String]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0u64;
        for uid in uids {
            removed += sqlx::query("DELETE FROM ledger_entries WHERE uid = ?")
                .bind(uid)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed as usize)
    }

    async fn record_run(&self, run: &RunSummary) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO indexing_runs (run_id, namespace, kind, strategy, status,
                                                  started_at, finished_at, added, updated,
                                                  skipped, deleted, errors)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.namespace)
        .bind(&run.kind)
        .bind(run.strategy.as_str())
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.added as i64)
        .bind(run.updated as i64)
        .bind(run.skipped as i64)
        .bind(run.deleted as i64)
        .bind(run.errors as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, namespace, kind, strategy, status, started_at, finished_at,
                   added, updated, skipped, deleted, errors
            FROM indexing_runs
            ORDER BY started_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(run_from_row).collect())
    }

    async fn record_upload(&self, file: &ContentFile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO uploads (id, file_name, path, description, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&file.id)
        .bind(&file.file_name)
        .bind(file.path.to_string_lossy().to_string())
        .bind(&file.description)
        .bind(file.created_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn uploads(&self) -> Result<Vec<ContentFile>> {
        let rows = sqlx::query(
            r#"
            SELECT id, file_name, path, description, created_at
            FROM uploads
            ORDER BY created_at DESC, rowid DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(upload_from_row).collect())
    }

    async fn forget_upload(&self, internal_id: &str) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM uploads WHERE id = ?")
            .bind(internal_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }
}
