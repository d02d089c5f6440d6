//! Command-line entry points for ingestion.
//!
//! Builds a [`Pipeline`] over the SQLite stores and the built-in adapters,
//! runs it, and prints a per-source summary:
//!
//! ```text
//! sync nosql
//!   shop.orders  done  added: 12  updated: 0  skipped: 3  deleted: 1
//!   total  added: 12  updated: 0  skipped: 3  deleted: 1  errors: 0
//! ok
//! ```

use anyhow::{anyhow, bail, Context, Result};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::ledger::LedgerStore;
use crate::models::{SourceKind, Strategy};
use crate::pipeline::{IngestReport, IngestRequest, Pipeline};
use crate::progress::{format_number, ProgressMode};
use crate::sqlite_store::{SqliteIndexStore, SqliteLedgerStore};
use crate::traits::AdapterRegistry;

/// Origin selectors given on the command line. Which ones apply depends on
/// the source kind; the rest are ignored.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub path: Option<PathBuf>,
    pub description: Option<String>,
    pub container: Option<String>,
    pub bucket: Option<String>,
    pub prefix: Option<String>,
    pub blob_name: Option<String>,
    pub page_ids: Option<String>,
    pub database: Option<String>,
    pub collections: Option<String>,
}

/// Turn a kind name and selectors into a request.
pub fn build_request(kind: &str, options: SyncOptions) -> Result<IngestRequest> {
    let kind: SourceKind = kind.parse().map_err(|e: String| anyhow!(e))?;
    let request = match kind {
        SourceKind::File => IngestRequest::Files {
            path: options
                .path
                .ok_or_else(|| anyhow!("--path is required for file sources"))?,
            internal_id: None,
            description: options.description,
        },
        SourceKind::Azure => IngestRequest::AzureBlob {
            container: options.container,
            prefix: options.prefix,
            blob_name: options.blob_name,
        },
        SourceKind::S3 => IngestRequest::S3 {
            bucket: options.bucket,
            prefix: options.prefix,
            blob_name: options.blob_name,
        },
        SourceKind::Notion => IngestRequest::Notion {
            page_ids: options.page_ids,
        },
        SourceKind::NoSql => IngestRequest::NoSql {
            database: options.database,
            collections: options.collections,
        },
    };
    Ok(request)
}

/// Pipeline over the configured database. The pool is returned so the
/// caller can close it once done.
pub async fn open_pipeline(
    config: &Config,
    progress: ProgressMode,
    cancel: CancellationToken,
) -> Result<(Pipeline, SqlitePool)> {
    let pool = db::connect(config).await?;
    let adapters = AdapterRegistry::from_config(config)?;
    let embedder = embedding::create_embedder(&config.embedding)?;

    let pipeline = Pipeline::new(
        config,
        adapters,
        Arc::new(SqliteIndexStore::new(pool.clone())),
        Arc::new(SqliteLedgerStore::new(pool.clone())),
        embedder,
    )
    .with_progress(Arc::from(progress.reporter()))
    .with_cancellation(cancel);

    Ok((pipeline, pool))
}

/// `cix sync <kind>`.
pub async fn run_sync(
    config: &Config,
    kind: &str,
    options: SyncOptions,
    full: bool,
    progress: ProgressMode,
    cancel: CancellationToken,
) -> Result<()> {
    let request = build_request(kind, options)?;
    let strategy = if full {
        Strategy::Full
    } else {
        config.pipeline.strategy
    };

    let (pipeline, pool) = open_pipeline(config, progress, cancel).await?;
    let outcome = pipeline.ingest_with(&request, strategy).await;
    pool.close().await;

    let report = outcome?;
    print_report(&format!("sync {}", request.kind()), &report);
    if !report.is_complete() {
        bail!("sync {} finished with errors", request.kind());
    }
    Ok(())
}

/// `cix upload <files...>`: store each file and ingest it under its own
/// internal id.
pub async fn run_upload(
    config: &Config,
    files: &[PathBuf],
    description: Option<String>,
    progress: ProgressMode,
    cancel: CancellationToken,
) -> Result<()> {
    if files.is_empty() {
        bail!("No files given");
    }
    let (pipeline, pool) = open_pipeline(config, progress, cancel).await?;

    let mut failed = 0usize;
    for file in files {
        match upload_one(&pipeline, file, description.clone()).await {
            Ok(true) => {}
            Ok(false) => failed += 1,
            Err(err) => {
                eprintln!("upload {}: {:#}", file.display(), err);
                failed += 1;
            }
        }
    }
    pool.close().await;

    if failed > 0 {
        bail!("{} of {} uploads failed", failed, files.len());
    }
    Ok(())
}

async fn upload_one(
    pipeline: &Pipeline,
    file: &Path,
    description: Option<String>,
) -> Result<bool> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let name = file.to_string_lossy();
    let (stored, report) = pipeline.ingest_upload(&name, &bytes, description).await?;
    print_report(&format!("upload {} ({})", stored.file_name, stored.id), &report);
    Ok(report.is_complete())
}

/// `cix uploads`: the upload catalog, newest first.
pub async fn run_uploads(config: &Config) -> Result<()> {
    let (pipeline, pool) =
        open_pipeline(config, ProgressMode::Off, CancellationToken::new()).await?;
    let listed = pipeline.list_uploads().await;
    pool.close().await;
    let files = listed.map_err(|e| e.status())?;

    if files.is_empty() {
        println!("No uploads stored.");
        return Ok(());
    }

    println!("{:<36}  {:<20}  {:<24}  DESCRIPTION", "ID", "CREATED", "FILE");
    for file in files {
        println!(
            "{:<36}  {:<20}  {:<24}  {}",
            file.id,
            file.created_at.format("%Y-%m-%d %H:%M:%S"),
            file.file_name,
            file.description.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

/// `cix delete <internal_id>`.
pub async fn run_delete(config: &Config, internal_id: &str) -> Result<()> {
    let (pipeline, pool) =
        open_pipeline(config, ProgressMode::Off, CancellationToken::new()).await?;
    let outcome = pipeline.delete_content(internal_id).await;
    pool.close().await;

    let removed = outcome.map_err(|e| e.status())?;
    println!("delete {}", internal_id);
    println!("  records removed: {}", format_number(removed));
    println!("ok");
    Ok(())
}

/// `cix runs`: recent run history, newest first.
pub async fn run_runs(config: &Config, limit: usize) -> Result<()> {
    let pool = db::connect(config).await?;
    let ledger = SqliteLedgerStore::new(pool.clone());
    let runs = ledger.recent_runs(limit).await;
    pool.close().await;
    let runs = runs?;

    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }

    println!(
        "{:<20} {:<10} {:<12} {:>7} {:>7} {:>7} {:>7} {:>6}  NAMESPACE",
        "STARTED", "STATUS", "STRATEGY", "ADDED", "UPDATED", "SKIPPED", "DELETED", "ERRORS"
    );
    for run in runs {
        let started = chrono::DateTime::from_timestamp(run.started_at, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| run.started_at.to_string());
        println!(
            "{:<20} {:<10} {:<12} {:>7} {:>7} {:>7} {:>7} {:>6}  {}",
            started,
            run.status.as_str(),
            run.strategy.as_str(),
            run.added,
            run.updated,
            run.skipped,
            run.deleted,
            run.errors,
            run.namespace
        );
    }
    Ok(())
}

fn print_report(label: &str, report: &IngestReport) {
    println!("{}", label);
    for source in &report.sources {
        let r = &source.result;
        println!(
            "  {}  {}  added: {}  updated: {}  skipped: {}  deleted: {}",
            source.namespace,
            source.status.as_str(),
            format_number(r.added),
            format_number(r.updated),
            format_number(r.skipped),
            format_number(r.deleted)
        );
        for error in &r.errors {
            match &error.source_id {
                Some(id) => println!("    error: {} ({}): {}", error.target, id, error.message),
                None => println!("    error: {}: {}", error.target, error.message),
            }
        }
    }
    let t = &report.totals;
    println!(
        "  total  added: {}  updated: {}  skipped: {}  deleted: {}  errors: {}",
        format_number(t.added),
        format_number(t.updated),
        format_number(t.skipped),
        format_number(t.deleted),
        t.errors.len()
    );
    if report.is_complete() {
        println!("ok");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_per_kind() {
        let request = build_request(
            "s3",
            SyncOptions {
                bucket: Some("docs".into()),
                container: Some("ignored".into()),
                prefix: Some("reports/".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(
            request,
            IngestRequest::S3 {
                bucket: Some("docs".into()),
                prefix: Some("reports/".into()),
                blob_name: None,
            }
        );

        let request = build_request(
            "mongo",
            SyncOptions {
                collections: Some("a,b".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(request.kind(), SourceKind::NoSql);
    }

    #[test]
    fn test_build_request_rejects_unknown_kind() {
        let err = build_request("ftp", SyncOptions::default()).unwrap_err();
        assert!(err.to_string().contains("unknown source kind"));
    }

    #[test]
    fn test_file_sync_requires_path() {
        assert!(build_request("file", SyncOptions::default()).is_err());
        let request = build_request(
            "file",
            SyncOptions {
                path: Some(PathBuf::from("./docs")),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(request.kind(), SourceKind::File);
    }
}
