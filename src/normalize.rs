//! Turns fetched [`RawRecord`]s into [`Document`]s.
//!
//! One [`Normalizer`] variant per family of source kinds:
//!
//! | Variant  | Kinds           | Fan-out                               |
//! |----------|-----------------|---------------------------------------|
//! | `Files`  | file, azure, s3 | pdf page, csv row, json string leaf   |
//! | `Notion` | notion          | line-range chunk of each page         |
//! | `NoSql`  | nosql           | one document per row                  |
//!
//! Normalization is synchronous and deterministic: the same record always
//! yields the same documents in the same order with the same `sourceId`s.
//! The pipeline runs it on the blocking pool since PDF extraction is CPU
//! bound.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, warn};

use crate::chunk::chunk_lines;
use crate::config::ChunkingConfig;
use crate::error::{IngestError, IngestResult};
use crate::models::{Document, Metadata, NotionPage, Origin, RawPayload, RawRecord, SourceKind};

/// Per-kind normalization strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalizer {
    Files,
    Notion { max_chars: usize },
    NoSql,
}

/// Handlers for file-like payloads, picked by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileHandler {
    Pdf,
    Csv,
    Json,
}

impl FileHandler {
    fn for_name(name: &str) -> IngestResult<Self> {
        let extension = Path::new(name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "pdf" => Ok(FileHandler::Pdf),
            "csv" => Ok(FileHandler::Csv),
            "json" => Ok(FileHandler::Json),
            _ => Err(IngestError::unsupported(name, extension)),
        }
    }
}

impl Normalizer {
    pub fn for_kind(kind: SourceKind, chunking: &ChunkingConfig) -> Self {
        match kind {
            SourceKind::File | SourceKind::Azure | SourceKind::S3 => Normalizer::Files,
            SourceKind::Notion => Normalizer::Notion {
                max_chars: chunking.max_chars,
            },
            SourceKind::NoSql => Normalizer::NoSql,
        }
    }

    /// Documents for one record.
    ///
    /// An unrecognized file extension is not an error: it is logged and
    /// produces no documents.
    pub fn normalize(&self, record: &RawRecord) -> IngestResult<Vec<Document>> {
        let base = base_metadata(record);
        let documents = match (self, &record.payload) {
            (Normalizer::Files, RawPayload::LocalFile(path)) => {
                normalize_file(&record.name, path, &base)
            }
            (Normalizer::Files, RawPayload::Scratch(file)) => {
                normalize_file(&record.name, file.path(), &base)
            }
            (Normalizer::Notion { max_chars }, RawPayload::NotionPages(pages)) => {
                Ok(normalize_notion(pages, *max_chars, &base))
            }
            (Normalizer::NoSql, RawPayload::Rows(rows)) => {
                Ok(normalize_rows(&record.identity.origin, rows, &base))
            }
            (normalizer, payload) => Err(IngestError::normalization(
                &record.name,
                format!("{:?} normalizer cannot read {} payload", normalizer, payload_name(payload)),
            )),
        };

        match documents {
            Err(IngestError::NormalizationUnsupported { name, extension }) => {
                warn!(name = %name, extension = %extension, "Unsupported file type, skipping");
                Ok(Vec::new())
            }
            Ok(documents) => {
                debug!(name = %record.name, documents = documents.len(), "Normalized record");
                Ok(documents)
            }
            Err(err) => Err(err),
        }
    }
}

fn payload_name(payload: &RawPayload) -> &'static str {
    match payload {
        RawPayload::LocalFile(_) => "local file",
        RawPayload::Scratch(_) => "scratch file",
        RawPayload::NotionPages(_) => "notion",
        RawPayload::Rows(_) => "rows",
    }
}

/// Metadata every document of `record` carries.
fn base_metadata(record: &RawRecord) -> Metadata {
    let mut meta = Metadata::new();
    meta.insert("source".into(), record.name.as_str().into());
    meta.insert("source_kind".into(), record.kind.as_str().into());
    match &record.identity.origin {
        Origin::Blob { container, .. } => {
            meta.insert("container".into(), container.as_str().into());
        }
        Origin::File {
            internal_id,
            description,
            ..
        } => {
            if let Some(id) = internal_id {
                meta.insert("internal_id".into(), id.as_str().into());
            }
            if let Some(description) = description {
                meta.insert("description".into(), description.as_str().into());
            }
        }
        Origin::Notion { .. } | Origin::NoSql { .. } => {}
    }
    meta
}

fn document(source_id: String, content: String, base: &Metadata) -> Document {
    let mut doc = Document::new(source_id, content);
    doc.metadata.extend(base.iter().map(|(k, v)| (k.clone(), v.clone())));
    doc
}

// ============ Files ============

fn normalize_file(name: &str, path: &Path, base: &Metadata) -> IngestResult<Vec<Document>> {
    let handler = FileHandler::for_name(name)?;
    let bytes = std::fs::read(path)?;

    match handler {
        FileHandler::Pdf => {
            let pages = pdf_extract::extract_text_from_mem_by_pages(&bytes)
                .map_err(|e| IngestError::normalization(name, e.to_string()))?;
            Ok(pages
                .into_iter()
                .enumerate()
                .filter(|(_, text)| !text.trim().is_empty())
                .map(|(i, text)| {
                    document(format!("{}-{}", name, i), text.trim().to_string(), base)
                        .with_meta("page", i + 1)
                })
                .collect())
        }
        FileHandler::Csv => csv_documents(name, &bytes, base),
        FileHandler::Json => {
            let value: Value = serde_json::from_slice(&bytes)
                .map_err(|e| IngestError::normalization(name, e.to_string()))?;
            let mut leaves = Vec::new();
            collect_string_leaves(&value, String::new(), &mut leaves);
            Ok(leaves
                .into_iter()
                .enumerate()
                .map(|(i, (pointer, text))| {
                    document(format!("{}-{}", name, i), text, base).with_meta("json_pointer", pointer)
                })
                .collect())
        }
    }
}

/// One document per data row, content as `column: value` lines.
fn csv_documents(name: &str, bytes: &[u8], base: &Metadata) -> IngestResult<Vec<Document>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|e| IngestError::normalization(name, e.to_string()))?
        .clone();

    let mut documents = Vec::new();
    for (i, row) in reader.records().enumerate() {
        let row = row.map_err(|e| IngestError::normalization(name, e.to_string()))?;
        if row.iter().all(|v| v.trim().is_empty()) {
            continue;
        }
        let content = row
            .iter()
            .enumerate()
            .map(|(col, value)| {
                let column = headers.get(col).unwrap_or("");
                format!("{}: {}", column, value.trim())
            })
            .collect::<Vec<_>>()
            .join("\n");
        documents.push(document(format!("{}-{}", name, i), content, base).with_meta("line", i + 1));
    }
    Ok(documents)
}

/// Depth-first string leaves with their JSON pointers, in document order.
fn collect_string_leaves(value: &Value, pointer: String, out: &mut Vec<(String, String)>) {
    match value {
        Value::String(s) if !s.trim().is_empty() => out.push((pointer, s.clone())),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                collect_string_leaves(item, format!("{}/{}", pointer, i), out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                let escaped = key.replace('~', "~0").replace('/', "~1");
                collect_string_leaves(item, format!("{}/{}", pointer, escaped), out);
            }
        }
        _ => {}
    }
}

// ============ Notion ============

fn normalize_notion(pages: &[NotionPage], max_chars: usize, base: &Metadata) -> Vec<Document> {
    pages
        .iter()
        .flat_map(|page| {
            chunk_lines(&page.lines, max_chars)
                .into_iter()
                .map(move |chunk| {
                    document(
                        format!("{}-{}-{}", page.id, chunk.line_from, chunk.line_to),
                        chunk.text,
                        base,
                    )
                    .with_meta("page_id", page.id.as_str())
                    .with_meta("title", page.title.as_str())
                    .with_meta("line_from", chunk.line_from)
                    .with_meta("line_to", chunk.line_to)
                })
        })
        .collect()
}

// ============ NoSQL ============

fn normalize_rows(origin: &Origin, rows: &[Value], base: &Metadata) -> Vec<Document> {
    let (database, collection) = match origin {
        Origin::NoSql {
            database,
            collection,
        } => (database.as_str(), collection.as_str()),
        _ => ("", ""),
    };

    rows.iter()
        .map(|row| {
            let content = serde_json::to_string(row).unwrap_or_default();
            let source_id = row_id(row).unwrap_or_else(|| {
                let digest = hex::encode(Sha256::digest(content.as_bytes()));
                format!("{}-{}", collection, &digest[..16])
            });
            document(source_id, content, base)
                .with_meta("database", database)
                .with_meta("collection", collection)
        })
        .collect()
}

/// The row's `_id` as a string: plain string, `{"$oid": ...}` or number.
fn row_id(row: &Value) -> Option<String> {
    match &row["_id"] {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map
            .get("$oid")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Identity, MetaValue};
    use serde_json::json;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn file_record(dir: &TempDir, name: &str, contents: &str) -> RawRecord {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        RawRecord {
            kind: SourceKind::File,
            identity: Identity {
                key: name.into(),
                origin: Origin::File {
                    path: path.clone(),
                    internal_id: Some("u-1".into()),
                    description: Some("quarterly".into()),
                },
            },
            name: name.into(),
            payload: RawPayload::LocalFile(path),
        }
    }

    #[test]
    fn test_csv_row_per_document() {
        let dir = TempDir::new().unwrap();
        let record = file_record(&dir, "people.csv", "name,city\nAda,London\n,\nLin,Oslo\n");
        let docs = Normalizer::Files.normalize(&record).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].source_id, "people.csv-0");
        assert_eq!(docs[0].content, "name: Ada\ncity: London");
        assert_eq!(docs[1].source_id, "people.csv-2");
        assert_eq!(docs[1].metadata["line"], MetaValue::Number(3));
        assert_eq!(docs[0].meta_text("internal_id"), Some("u-1"));
        assert_eq!(docs[0].meta_text("description"), Some("quarterly"));
        assert_eq!(docs[0].meta_text("source_kind"), Some("file"));
    }

    #[test]
    fn test_json_string_leaves_in_order() {
        let dir = TempDir::new().unwrap();
        let record = file_record(
            &dir,
            "faq.json",
            r#"{"z": "last key first", "items": [{"q": "why?", "n": 3}, "plain"], "a/b": "slash"}"#,
        );
        let docs = Normalizer::Files.normalize(&record).unwrap();
        let pointers: Vec<&str> = docs.iter().map(|d| d.meta_text("json_pointer").unwrap()).collect();
        assert_eq!(pointers, vec!["/z", "/items/0/q", "/items/1", "/a~1b"]);
        assert_eq!(docs[1].content, "why?");
        assert_eq!(docs[3].source_id, "faq.json-3");
    }

    #[test]
    fn test_unsupported_extension_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let record = file_record(&dir, "report.docx", "binary");
        assert!(Normalizer::Files.normalize(&record).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        let dir = TempDir::new().unwrap();
        let record = file_record(&dir, "bad.json", "{not json");
        let err = Normalizer::Files.normalize(&record).unwrap_err();
        assert!(matches!(err, IngestError::Normalization { .. }));
    }

    #[test]
    fn test_blob_scratch_carries_container() {
        let mut scratch = NamedTempFile::new().unwrap();
        scratch.write_all(b"[\"hello\"]").unwrap();
        let record = RawRecord {
            kind: SourceKind::Azure,
            identity: Identity {
                key: "a/b/c.json".into(),
                origin: Origin::Blob {
                    container: "docs".into(),
                    prefix: Some("a/b".into()),
                    blob_name: Some("c.json".into()),
                },
            },
            name: "a/b/c.json".into(),
            payload: RawPayload::Scratch(scratch),
        };
        let docs = Normalizer::Files.normalize(&record).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source_id, "a/b/c.json-0");
        assert_eq!(docs[0].meta_text("container"), Some("docs"));
        assert_eq!(docs[0].meta_text("source_kind"), Some("azure"));
    }

    #[test]
    fn test_notion_chunks_by_line_range() {
        let record = RawRecord {
            kind: SourceKind::Notion,
            identity: Identity {
                key: "root".into(),
                origin: Origin::Notion {
                    page_id: "root".into(),
                },
            },
            name: "root".into(),
            payload: RawPayload::NotionPages(vec![
                NotionPage {
                    id: "root".into(),
                    title: "Handbook".into(),
                    lines: vec!["aaaa".into(), "bbbb".into(), "cccc".into()],
                },
                NotionPage {
                    id: "child".into(),
                    title: "Child".into(),
                    lines: vec!["dddd".into()],
                },
            ]),
        };
        let docs = Normalizer::Notion { max_chars: 10 }.normalize(&record).unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.source_id.as_str()).collect();
        assert_eq!(ids, vec!["root-1-2", "root-3-3", "child-1-1"]);
        assert_eq!(docs[2].meta_text("title"), Some("Child"));
        assert_eq!(docs[0].metadata["line_to"], MetaValue::Number(2));
    }

    #[test]
    fn test_nosql_row_ids() {
        let rows = vec![
            json!({"_id": {"$oid": "65a1"}, "name": "a"}),
            json!({"_id": 7, "name": "b"}),
            json!({"name": "c"}),
        ];
        let record = RawRecord {
            kind: SourceKind::NoSql,
            identity: Identity {
                key: "orders".into(),
                origin: Origin::NoSql {
                    database: "shop".into(),
                    collection: "orders".into(),
                },
            },
            name: "orders".into(),
            payload: RawPayload::Rows(rows),
        };
        let docs = Normalizer::NoSql.normalize(&record).unwrap();
        assert_eq!(docs[0].source_id, "65a1");
        assert_eq!(docs[1].source_id, "7");
        assert!(docs[2].source_id.starts_with("orders-"));
        assert_eq!(docs[2].source_id.len(), "orders-".len() + 16);
        assert_eq!(docs[2].content, r#"{"name":"c"}"#);
        assert_eq!(docs[0].meta_text("database"), Some("shop"));

        // Fallback ids are stable across runs
        let again = Normalizer::NoSql.normalize(&record).unwrap();
        assert_eq!(docs, again);
    }

    #[test]
    fn test_payload_mismatch_is_an_error() {
        let record = RawRecord {
            kind: SourceKind::NoSql,
            identity: Identity {
                key: "p".into(),
                origin: Origin::Notion {
                    page_id: "p".into(),
                },
            },
            name: "p".into(),
            payload: RawPayload::NotionPages(vec![]),
        };
        assert!(Normalizer::NoSql.normalize(&record).is_err());
    }

    #[test]
    fn test_for_kind() {
        let chunking = ChunkingConfig::default();
        assert_eq!(Normalizer::for_kind(SourceKind::S3, &chunking), Normalizer::Files);
        assert_eq!(
            Normalizer::for_kind(SourceKind::Notion, &chunking),
            Normalizer::Notion {
                max_chars: chunking.max_chars
            }
        );
    }
}
