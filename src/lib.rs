//! # Content Indexer
//!
//! Incremental ingestion of heterogeneous content into a search index.
//!
//! Content comes from uploaded files, Azure Blob containers, S3 buckets,
//! Notion page trees and NoSQL collections. Every source run is normalized
//! into documents, split into batches and written through a change-tracking
//! ledger, so re-running a source only touches what changed and removes
//! what disappeared. The index serves keyword, semantic and hybrid search
//! and retrieval-augmented answers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────┐   ┌─────────┐   ┌──────────┐
//! │   Adapters   │──▶│ Normalizer │──▶│ Batcher │──▶│  Writer  │
//! │ file/azure/  │   │ pdf/csv/   │   └─────────┘   │ + Ledger │
//! │ s3/notion/   │   │ json/lines │                 └────┬─────┘
//! │ nosql        │   └────────────┘                      │
//! └──────────────┘                                       ▼
//!                                               ┌─────────────────┐
//!                           search / ask  ◀─────│ SQLite FTS5+Vec │
//!                                               └─────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cix init                                   # create database
//! cix upload ./reports/q1.pdf                # store and index a file
//! cix sync s3 --bucket docs --prefix faq/    # index part of a bucket
//! cix sync nosql --collections orders,users  # one run per collection
//! cix search "refund policy" --mode hybrid
//! cix ask "How long do refunds take?"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed pipeline errors and status mapping |
//! | [`traits`] | Source adapter trait and registry |
//! | [`connector_fs`] | Local files and uploads |
//! | [`blob`] | Shared blob listing and download |
//! | [`connector_azure`] | Azure Blob Storage |
//! | [`connector_s3`] | Amazon S3 |
//! | [`connector_notion`] | Notion page trees |
//! | [`connector_nosql`] | NoSQL collections over a data API |
//! | [`normalize`] | Raw records to documents |
//! | [`chunk`] | Line-preserving text chunking |
//! | [`batch`] | Even batch splitting |
//! | [`ledger`] | Change tracking and mark-and-sweep |
//! | [`writer`] | Batch writes to index and ledger |
//! | [`pipeline`] | Orchestration and run reports |
//! | [`progress`] | Pipeline state reporting |
//! | [`store`] | Index store trait and in-memory stores |
//! | [`sqlite_store`] | SQLite index and ledger stores |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`search`] | Keyword, semantic, and hybrid search |
//! | [`answer`] | Retrieval-augmented answers |
//! | [`uploads`] | Upload storage; the catalog lives in the ledger store |
//! | [`ingest`] | Command-line ingestion entry points |
//! | [`sources`] | Source availability listing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod answer;
pub mod batch;
pub mod blob;
pub mod chunk;
pub mod config;
pub mod connector_azure;
pub mod connector_fs;
pub mod connector_notion;
pub mod connector_nosql;
pub mod connector_s3;
pub mod db;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod progress;
pub mod search;
pub mod sources;
pub mod sqlite_store;
pub mod store;
pub mod traits;
pub mod uploads;
pub mod writer;
