//! # Content Indexer CLI (`cix`)
//!
//! The `cix` binary drives ingestion, deletion, search and answers over
//! the index described by a TOML configuration file.
//!
//! ## Usage
//!
//! ```bash
//! cix --config ./config/cix.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cix init` | Create the SQLite database and run schema migrations |
//! | `cix sources` | List source kinds and whether they are usable |
//! | `cix sync <kind>` | Ingest one source (file, azure, s3, notion, nosql) |
//! | `cix upload <files...>` | Store files and ingest each under a new internal id |
//! | `cix uploads` | List stored uploads with their internal ids |
//! | `cix delete <internal_id>` | Remove an upload and everything indexed from it |
//! | `cix search "<term>"` | Search indexed documents |
//! | `cix ask "<prompt>"` | Answer a prompt from retrieved context |
//! | `cix runs` | Show recent source runs |
//!
//! ## Examples
//!
//! ```bash
//! # Index a bucket prefix, replacing what was indexed before
//! cix sync s3 --bucket docs --prefix handbook/ --full
//!
//! # Index two collections as independent runs
//! cix sync nosql --database shop --collections orders,customers
//!
//! # Hybrid search (keyword + semantic)
//! cix search "deployment" --mode hybrid
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`
//! (default `content_indexer=info`).

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use content_indexer::ingest::{self, SyncOptions};
use content_indexer::progress::ProgressMode;
use content_indexer::{answer, config, migrate, search, sources};

/// Content Indexer CLI: incremental ingestion of files, blobs, Notion pages
/// and NoSQL collections into a searchable index.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/cix.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "cix",
    about = "Content Indexer: incremental content ingestion for retrieval-augmented answers",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/cix.toml`.
    #[arg(long, global = true, default_value = "./config/cix.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file with the ledger, run history and
    /// index tables. Running it again is a no-op.
    Init,

    /// List source kinds and their availability.
    ///
    /// Kinds whose credentials or endpoints are missing are shown with the
    /// reason. Requests against them fail before any work starts.
    Sources,

    /// Ingest one source.
    ///
    /// Kind is one of `file`, `azure`, `s3`, `notion` or `nosql`. Origin
    /// selectors that are not given fall back to `[connectors.<kind>]`.
    Sync {
        /// Source kind.
        kind: String,

        /// File or directory to ingest (`file` only).
        #[arg(long)]
        path: Option<PathBuf>,

        /// Description stored with file documents.
        #[arg(long)]
        description: Option<String>,

        /// Azure container.
        #[arg(long)]
        container: Option<String>,

        /// S3 bucket.
        #[arg(long)]
        bucket: Option<String>,

        /// Only blobs under this prefix (Azure, S3).
        #[arg(long)]
        prefix: Option<String>,

        /// A single blob (Azure, S3).
        #[arg(long)]
        blob_name: Option<String>,

        /// Comma-separated Notion page ids; each is its own run.
        #[arg(long)]
        page_ids: Option<String>,

        /// NoSQL database.
        #[arg(long)]
        database: Option<String>,

        /// Comma-separated collections; each is its own run.
        #[arg(long)]
        collections: Option<String>,

        /// Purge the source's namespace and re-ingest everything.
        #[arg(long)]
        full: bool,

        /// Progress output on stderr. Defaults to `human` on a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Store files and ingest each one.
    ///
    /// Every file gets a fresh internal id, printed in the summary; pass it
    /// to `cix delete` to remove the file and its documents.
    Upload {
        /// Files to upload.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Description stored with the documents of every file.
        #[arg(long)]
        description: Option<String>,

        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// List stored uploads, newest first.
    ///
    /// Shows the internal id that `cix delete` takes.
    Uploads,

    /// Remove an upload and every document generated from it.
    Delete {
        /// Internal id printed by `cix upload` and `cix uploads`.
        internal_id: String,
    },

    /// Search indexed documents.
    Search {
        /// The search term.
        term: String,

        /// Search mode: `keyword`, `semantic`, or `hybrid`.
        /// Semantic and hybrid modes require an embedding provider.
        #[arg(long)]
        mode: Option<String>,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Answer a prompt with retrieved documents as context.
    ///
    /// Requires an `[llm]` provider.
    Ask {
        prompt: String,

        /// Prompt template with `{question}` and `{context}` placeholders.
        #[arg(long)]
        template: Option<String>,

        /// Send the prompt as is, without retrieval.
        #[arg(long)]
        no_context: bool,
    },

    /// Show recent source runs, newest first.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

fn progress_mode(arg: Option<ProgressArg>) -> ProgressMode {
    match arg {
        Some(ProgressArg::Off) => ProgressMode::Off,
        Some(ProgressArg::Human) => ProgressMode::Human,
        Some(ProgressArg::Json) => ProgressMode::Json,
        None => ProgressMode::default_for_tty(),
    }
}

/// Cancelled on Ctrl-C. Running batches finish; nothing new starts.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing in-flight work");
            child.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("content_indexer=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Sync {
            kind,
            path,
            description,
            container,
            bucket,
            prefix,
            blob_name,
            page_ids,
            database,
            collections,
            full,
            progress,
        } => {
            let options = SyncOptions {
                path,
                description,
                container,
                bucket,
                prefix,
                blob_name,
                page_ids,
                database,
                collections,
            };
            ingest::run_sync(
                &cfg,
                &kind,
                options,
                full,
                progress_mode(progress),
                cancel_on_ctrl_c(),
            )
            .await?;
        }
        Commands::Upload {
            files,
            description,
            progress,
        } => {
            ingest::run_upload(
                &cfg,
                &files,
                description,
                progress_mode(progress),
                cancel_on_ctrl_c(),
            )
            .await?;
        }
        Commands::Uploads => {
            ingest::run_uploads(&cfg).await?;
        }
        Commands::Delete { internal_id } => {
            ingest::run_delete(&cfg, &internal_id).await?;
        }
        Commands::Search { term, mode, limit } => {
            let mode = mode.unwrap_or_else(|| cfg.retrieval.mode.clone());
            search::run_search(&cfg, &term, &mode, limit).await?;
        }
        Commands::Ask {
            prompt,
            template,
            no_context,
        } => {
            answer::run_ask(&cfg, &prompt, template, no_context).await?;
        }
        Commands::Runs { limit } => {
            ingest::run_runs(&cfg, limit).await?;
        }
    }

    Ok(())
}
