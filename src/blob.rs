//! Cloud blob storage: the [`BlobStore`] capability and the generic
//! [`BlobAdapter`] that turns any store into a [`SourceAdapter`].
//!
//! Azure Blob Storage and S3 differ only in how they sign and page their
//! REST calls; identity resolution and scratch-file handling live here once.
//!
//! # Identity resolution
//!
//! In priority order:
//!
//! 1. blob name given → exactly one identity (`prefix/name` when a prefix is
//!    also given); no listing call is made
//! 2. prefix only → every blob under the prefix
//! 3. neither → every blob in the container or bucket
//!
//! # Scratch files
//!
//! [`BlobAdapter::fetch`] streams the blob into a [`NamedTempFile`] that
//! travels inside the [`RawRecord`]. The file is removed when the record is
//! dropped, whether normalization succeeded or not.

use async_trait::async_trait;
use futures::StreamExt;
use tempfile::NamedTempFile;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{IngestError, IngestResult};
use crate::models::{Identity, Origin, RawPayload, RawRecord, SourceKind};
use crate::traits::SourceAdapter;

/// A listed blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobObject {
    pub name: String,
    pub size: u64,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Why the store cannot be reached, or `None` when credentials are set.
    fn unavailable_reason(&self) -> Option<String>;

    /// Every blob in `container` whose name starts with `prefix`.
    async fn list(&self, container: &str, prefix: Option<&str>) -> IngestResult<Vec<BlobObject>>;

    /// Stream one blob into `writer`, returning the number of bytes written.
    async fn download_to(
        &self,
        container: &str,
        name: &str,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> IngestResult<u64>;
}

/// Join a prefix and a blob name with exactly one `/`.
pub fn join_blob_path(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Resolve the blob names selected by `prefix` and `blob_name`.
pub async fn resolve_blob_names(
    store: &dyn BlobStore,
    container: &str,
    prefix: &Option<String>,
    blob_name: &Option<String>,
) -> IngestResult<Vec<String>> {
    if let Some(name) = non_empty(blob_name) {
        let full = match non_empty(prefix) {
            Some(prefix) => join_blob_path(prefix, name),
            None => name.to_string(),
        };
        return Ok(vec![full]);
    }

    let mut names: Vec<String> = store
        .list(container, non_empty(prefix))
        .await?
        .into_iter()
        .map(|object| object.name)
        .filter(|name| !name.ends_with('/'))
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}

/// Copy an HTTP response body into `writer` chunk by chunk.
pub(crate) async fn stream_body_to(
    response: reqwest::Response,
    writer: &mut (dyn AsyncWrite + Unpin + Send),
) -> IngestResult<u64> {
    let mut written = 0u64;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        writer.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    writer.flush().await?;
    Ok(written)
}

/// Map a non-success HTTP status to the error taxonomy.
pub(crate) fn http_error(service: &str, status: reqwest::StatusCode, body: &str) -> IngestError {
    let message = format!(
        "{} request failed (HTTP {}): {}",
        service,
        status,
        body.chars().take(500).collect::<String>()
    );
    match status.as_u16() {
        401 | 403 => IngestError::unavailable(service, message),
        429 => IngestError::TransientIo(message),
        s if s >= 500 => IngestError::TransientIo(message),
        // Unknown container, bad prefix and similar caller mistakes
        _ => IngestError::ConfigurationMissing(message),
    }
}

/// Source adapter over any [`BlobStore`].
pub struct BlobAdapter<S> {
    kind: SourceKind,
    store: S,
}

impl<S: BlobStore> BlobAdapter<S> {
    pub fn new(kind: SourceKind, store: S) -> Self {
        Self { kind, store }
    }
}

#[async_trait]
impl<S: BlobStore> SourceAdapter for BlobAdapter<S> {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn description(&self) -> &str {
        match self.kind {
            SourceKind::Azure => "Blobs from an Azure Storage container",
            _ => "Objects from an S3 bucket",
        }
    }

    fn unavailable_reason(&self) -> Option<String> {
        self.store.unavailable_reason()
    }

    async fn list_identities(&self, origin: &Origin) -> IngestResult<Vec<Identity>> {
        let Origin::Blob {
            container,
            prefix,
            blob_name,
        } = origin
        else {
            return Err(IngestError::ConfigurationMissing(format!(
                "{} adapter cannot read origin {}",
                self.kind, origin
            )));
        };

        let names = resolve_blob_names(&self.store, container, prefix, blob_name).await?;
        tracing::debug!(kind = %self.kind, %container, count = names.len(), "resolved blobs");
        Ok(names
            .into_iter()
            .map(|key| Identity {
                key,
                origin: origin.clone(),
            })
            .collect())
    }

    async fn fetch(&self, identity: &Identity) -> IngestResult<RawRecord> {
        let Origin::Blob { container, .. } = &identity.origin else {
            return Err(IngestError::ConfigurationMissing(format!(
                "{} adapter cannot read origin {}",
                self.kind, identity.origin
            )));
        };

        let scratch = NamedTempFile::new()?;
        let mut file = tokio::fs::File::from_std(scratch.reopen()?);
        let bytes = self
            .store
            .download_to(container, &identity.key, &mut file)
            .await?;
        file.sync_all().await?;
        tracing::debug!(kind = %self.kind, blob = %identity.key, bytes, "downloaded blob");

        Ok(RawRecord {
            kind: self.kind,
            identity: identity.clone(),
            name: identity.key.clone(),
            payload: RawPayload::Scratch(scratch),
        })
    }
}

// ============ XML helpers (shared by the Azure and S3 listings) ============

/// Text content of the first `<tag>` element, entity-unescaped.
pub(crate) fn xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    let raw = &xml[start..start + end];
    Some(
        quick_xml::escape::unescape(raw)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| raw.to_string()),
    )
}

/// Inner text of every `<tag>...</tag>` block, in document order.
pub(crate) fn xml_blocks<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut blocks = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find(&open) {
        let block_start = start + open.len();
        match remaining[block_start..].find(&close) {
            Some(end) => {
                blocks.push(&remaining[block_start..block_start + end]);
                remaining = &remaining[block_start + end + close.len()..];
            }
            None => break,
        }
    }
    blocks
}
