use anyhow::Result;
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::FilesConnectorConfig;
use crate::error::{IngestError, IngestResult};
use crate::models::{Identity, Origin, RawPayload, RawRecord, SourceKind};
use crate::traits::SourceAdapter;

/// Local files: a single uploaded file or a directory walk.
pub struct FileAdapter {
    include_set: GlobSet,
    exclude_set: GlobSet,
    follow_symlinks: bool,
}

impl FileAdapter {
    pub fn new(config: &FilesConnectorConfig) -> Result<Self> {
        let include_set = build_globset(&config.include_globs)?;

        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        default_excludes.extend(config.exclude_globs.clone());
        let exclude_set = build_globset(&default_excludes)?;

        Ok(Self {
            include_set,
            exclude_set,
            follow_symlinks: config.follow_symlinks,
        })
    }
}

#[async_trait]
impl SourceAdapter for FileAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::File
    }

    fn description(&self) -> &str {
        "Local files and directories (pdf, csv, json)"
    }

    async fn list_identities(&self, origin: &Origin) -> IngestResult<Vec<Identity>> {
        let Origin::File { path, .. } = origin else {
            return Err(IngestError::ConfigurationMissing(format!(
                "file adapter cannot read origin {}",
                origin
            )));
        };

        if path.is_file() {
            let key = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());
            return Ok(vec![Identity {
                key,
                origin: origin.clone(),
            }]);
        }
        if !path.is_dir() {
            return Err(IngestError::unavailable(
                SourceKind::File.as_str(),
                format!("path does not exist: {}", path.display()),
            ));
        }

        let keys = scan_directory(
            path,
            &self.include_set,
            &self.exclude_set,
            self.follow_symlinks,
        )?;
        Ok(keys
            .into_iter()
            .map(|key| Identity {
                key,
                origin: origin.clone(),
            })
            .collect())
    }

    async fn fetch(&self, identity: &Identity) -> IngestResult<RawRecord> {
        let Origin::File { path, .. } = &identity.origin else {
            return Err(IngestError::ConfigurationMissing(format!(
                "file adapter cannot read origin {}",
                identity.origin
            )));
        };
        let full_path = resolve_path(path, &identity.key);
        if !full_path.is_file() {
            return Err(IngestError::transient(format!(
                "file disappeared: {}",
                full_path.display()
            )));
        }
        Ok(RawRecord {
            kind: SourceKind::File,
            identity: identity.clone(),
            name: identity.key.clone(),
            payload: RawPayload::LocalFile(full_path),
        })
    }
}

fn resolve_path(root: &Path, key: &str) -> PathBuf {
    if root.is_dir() {
        root.join(key)
    } else {
        root.to_path_buf()
    }
}

/// Relative paths of every matching file under `root`, sorted.
fn scan_directory(
    root: &Path,
    include_set: &GlobSet,
    exclude_set: &GlobSet,
    follow_symlinks: bool,
) -> IngestResult<Vec<String>> {
    let mut keys = Vec::new();

    let walker = WalkDir::new(root).follow_links(follow_symlinks);
    for entry in walker {
        let entry = entry.map_err(IngestError::transient)?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        // Apply exclude patterns
        if exclude_set.is_match(&rel_str) {
            continue;
        }

        // Apply include patterns
        if !include_set.is_match(&rel_str) {
            continue;
        }

        keys.push(rel_str);
    }

    // Sort for deterministic ordering
    keys.sort();
    Ok(keys)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn origin(path: &Path) -> Origin {
        Origin::File {
            path: path.to_path_buf(),
            internal_id: None,
            description: None,
        }
    }

    fn setup_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::write(dir.path().join("b.csv"), "a,b\n1,2\n").unwrap();
        std::fs::write(dir.path().join("a.json"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "skip me").unwrap();
        std::fs::write(dir.path().join("nested/c.json"), "[]").unwrap();
        std::fs::write(dir.path().join("node_modules/pkg/d.json"), "{}").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_directory_walk_is_filtered_and_sorted() {
        let dir = setup_tree();
        let adapter = FileAdapter::new(&FilesConnectorConfig::default()).unwrap();
        let identities = adapter.list_identities(&origin(dir.path())).await.unwrap();
        let keys: Vec<&str> = identities.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["a.json", "b.csv", "nested/c.json"]);
    }

    #[tokio::test]
    async fn test_single_file_origin() {
        let dir = setup_tree();
        let adapter = FileAdapter::new(&FilesConnectorConfig::default()).unwrap();
        let file = dir.path().join("notes.txt");
        let identities = adapter.list_identities(&origin(&file)).await.unwrap();
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].key, "notes.txt");

        let record = adapter.fetch(&identities[0]).await.unwrap();
        match record.payload {
            RawPayload::LocalFile(path) => assert_eq!(path, file),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_path_is_unavailable() {
        let adapter = FileAdapter::new(&FilesConnectorConfig::default()).unwrap();
        let err = adapter
            .list_identities(&origin(Path::new("/definitely/not/here")))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::SourceUnavailable { .. }));
    }
}
