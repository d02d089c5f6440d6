//! File intake for uploaded content.
//!
//! Each upload gets a fresh internal id (UUID v4) and is stored as
//! `<upload_dir>/<internal_id>/<file_name>`. Documents generated from it
//! carry the internal id so that [`Pipeline::delete_content`] can find
//! them again.
//!
//! [`Pipeline::delete_content`]: crate::pipeline::Pipeline::delete_content

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A stored upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentFile {
    pub id: String,
    pub file_name: String,
    pub path: PathBuf,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Store `bytes` under a new internal id.
///
/// Only the final path component of `file_name` is kept.
pub async fn save_upload(
    upload_dir: &Path,
    file_name: &str,
    bytes: &[u8],
    description: Option<String>,
) -> Result<ContentFile> {
    let file_name = Path::new(file_name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.trim().is_empty())
        .with_context(|| format!("Invalid upload file name: '{}'", file_name))?;

    let id = Uuid::new_v4().to_string();
    let dir = upload_dir.join(&id);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to create upload directory: {}", dir.display()))?;

    let path = dir.join(&file_name);
    tokio::fs::write(&path, bytes)
        .await
        .with_context(|| format!("Failed to write upload: {}", path.display()))?;

    Ok(ContentFile {
        id,
        file_name,
        path,
        description: description.filter(|d| !d.trim().is_empty()),
        created_at: Utc::now(),
    })
}

/// Remove the directory of upload `internal_id`. Returns `false` when it
/// did not exist.
pub async fn remove_upload(upload_dir: &Path, internal_id: &str) -> Result<bool> {
    if Uuid::parse_str(internal_id).is_err() {
        bail!("Invalid internal id: '{}'", internal_id);
    }
    let dir = upload_dir.join(internal_id);
    if !dir.exists() {
        return Ok(false);
    }
    tokio::fs::remove_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to remove upload directory: {}", dir.display()))?;
    Ok(true)
}
