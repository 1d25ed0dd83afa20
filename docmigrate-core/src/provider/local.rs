//! Filesystem-backed workspace provider.
//!
//! Documents are plain files under a root directory and the document id is
//! the path relative to that root, always with `/` separators. Metadata lives
//! next to the body in a `<file>.meta.json` sidecar. Bodies are written to a
//! temporary file and renamed into place so a reader never sees a torn write.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs;
use tracing::trace;
use uuid::Uuid;
use walkdir::WalkDir;

use super::{DocumentMetadata, StorageAdapter, StorageError, StorageResult, StoredDocument};
use crate::digest::ContentDigest;
use crate::error::{MigrationError, Result};

const META_SUFFIX: &str = ".meta.json";
const TEMP_MARKER: &str = ".docmigrate-tmp-";

#[derive(Debug, Deserialize)]
struct LocalWorkspaceConfig {
    root: PathBuf,
    #[serde(default)]
    create: bool,
}

/// Provider over a directory tree.
#[derive(Debug, Clone)]
pub struct LocalWorkspaceAdapter {
    root: PathBuf,
}

impl LocalWorkspaceAdapter {
    /// Adapter rooted at `root`; the directory is not checked.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Build from a registration's JSON config: `{"root": "...", "create": bool}`.
    pub fn from_config(config: &serde_json::Value) -> Result<Self> {
        let parsed: LocalWorkspaceConfig =
            serde_json::from_value(config.clone()).map_err(|e| {
                MigrationError::InvalidConfiguration(format!(
                    "local workspace config is invalid: {e}"
                ))
            })?;

        if parsed.create {
            std::fs::create_dir_all(&parsed.root)?;
        } else if !parsed.root.is_dir() {
            return Err(MigrationError::InvalidConfiguration(format!(
                "local workspace root {} does not exist",
                parsed.root.display()
            )));
        }

        Ok(Self::new(parsed.root))
    }

    /// Workspace root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &str) -> StorageResult<PathBuf> {
        let invalid = |reason: &str| StorageError::InvalidId {
            id: id.to_string(),
            reason: reason.to_string(),
        };

        if id.is_empty() {
            return Err(invalid("empty id"));
        }
        if id.ends_with(META_SUFFIX) || id.contains(TEMP_MARKER) {
            return Err(invalid("reserved suffix"));
        }

        let relative = Path::new(id);
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(invalid("must be a relative path without '..'")),
            }
        }

        Ok(self.root.join(relative))
    }

    fn meta_path(path: &Path) -> PathBuf {
        let mut raw = path.as_os_str().to_os_string();
        raw.push(META_SUFFIX);
        PathBuf::from(raw)
    }

    fn map_not_found(id: &str, err: std::io::Error) -> StorageError {
        if err.kind() == ErrorKind::NotFound {
            StorageError::NotFound(id.to_string())
        } else {
            StorageError::Io(err)
        }
    }

    /// Document ids under `root` starting with `prefix`, sorted. A missing
    /// root lists as empty.
    fn walk(root: &Path, prefix: &str) -> StorageResult<Vec<String>> {
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|e| match e.into_io_error() {
                Some(io) => StorageError::Io(io),
                None => StorageError::Backend("filesystem loop while listing".into()),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            let id = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if id.ends_with(META_SUFFIX) || id.contains(TEMP_MARKER) {
                continue;
            }
            if id.starts_with(prefix) {
                ids.push(id);
            }
        }

        ids.sort();
        trace!(target: "migration::adapter", root = %root.display(), prefix, found = ids.len(), "workspace listed");
        Ok(ids)
    }

    async fn write_atomically(path: &Path, bytes: &[u8]) -> StorageResult<()> {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = path.with_file_name(format!("{file_name}{TEMP_MARKER}{}", Uuid::new_v4()));
        fs::write(&temp, bytes).await?;
        if let Err(err) = fs::rename(&temp, path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(StorageError::Io(err));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for LocalWorkspaceAdapter {
    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }

    async fn get(&self, id: &str) -> StorageResult<StoredDocument> {
        let path = self.path_for(id)?;
        let content = fs::read(&path)
            .await
            .map_err(|e| Self::map_not_found(id, e))?;

        let metadata = match fs::read(Self::meta_path(&path)).await {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| {
                StorageError::Backend(format!("corrupt metadata sidecar for {id}: {e}"))
            })?,
            Err(err) if err.kind() == ErrorKind::NotFound => DocumentMetadata::default(),
            Err(err) => return Err(StorageError::Io(err)),
        };

        Ok(StoredDocument { content, metadata })
    }

    async fn put(
        &self,
        id: &str,
        content: &[u8],
        metadata: &DocumentMetadata,
    ) -> StorageResult<ContentDigest> {
        let path = self.path_for(id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        Self::write_atomically(&path, content).await?;
        let meta = serde_json::to_vec_pretty(metadata)
            .map_err(|e| StorageError::Backend(format!("metadata encode failed: {e}")))?;
        Self::write_atomically(&Self::meta_path(&path), &meta).await?;

        trace!(target: "migration::adapter", path = %path.display(), bytes = content.len(), "document written");
        Ok(ContentDigest::of(content))
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        let path = self.path_for(id)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| Self::map_not_found(id, e))?;
        match fs::remove_file(Self::meta_path(&path)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || Self::walk(&root, &prefix))
            .await
            .map_err(|e| StorageError::Backend(format!("listing task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn adapter() -> (TempDir, LocalWorkspaceAdapter) {
        let dir = TempDir::new().expect("tempdir");
        let adapter = LocalWorkspaceAdapter::new(dir.path());
        (dir, adapter)
    }

    #[tokio::test]
    async fn put_get_round_trip_keeps_metadata_sidecar() {
        let (_dir, adapter) = adapter();
        let metadata = DocumentMetadata {
            name: Some("Design notes".into()),
            content_type: Some("text/markdown".into()),
            ..Default::default()
        };

        adapter
            .put("rfcs/rfc-001.md", b"# RFC 1", &metadata)
            .await
            .expect("put");
        let stored = adapter.get("rfcs/rfc-001.md").await.expect("get");

        assert_eq!(stored.content, b"# RFC 1");
        assert_eq!(stored.metadata, metadata);
    }

    #[tokio::test]
    async fn list_hides_sidecars_and_honours_prefix() {
        let (_dir, adapter) = adapter();
        let meta = DocumentMetadata::default();
        adapter.put("rfcs/b.md", b"b", &meta).await.unwrap();
        adapter.put("rfcs/a.md", b"a", &meta).await.unwrap();
        adapter.put("prds/c.md", b"c", &meta).await.unwrap();

        assert_eq!(
            adapter.list("").await.unwrap(),
            vec!["prds/c.md", "rfcs/a.md", "rfcs/b.md"]
        );
        assert_eq!(adapter.list("rfcs/").await.unwrap(), vec!["rfcs/a.md", "rfcs/b.md"]);
    }

    #[tokio::test]
    async fn list_skips_temp_files_and_tolerates_missing_root() {
        let (dir, adapter) = adapter();
        adapter
            .put("deep/nested/tree/doc.md", b"x", &DocumentMetadata::default())
            .await
            .unwrap();
        std::fs::write(dir.path().join(format!("doc.md{TEMP_MARKER}abc")), b"torn").unwrap();
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();

        assert_eq!(adapter.list("").await.unwrap(), vec!["deep/nested/tree/doc.md"]);
        assert!(adapter.list("other/").await.unwrap().is_empty());

        let missing = LocalWorkspaceAdapter::new(dir.path().join("missing"));
        assert!(missing.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_ids_escaping_the_root() {
        let (_dir, adapter) = adapter();
        let err = adapter.get("../etc/passwd").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidId { .. }));
        let err = adapter.get("/etc/passwd").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidId { .. }));
    }

    #[tokio::test]
    async fn delete_removes_body_and_sidecar() {
        let (dir, adapter) = adapter();
        adapter
            .put("doc.md", b"x", &DocumentMetadata::default())
            .await
            .unwrap();
        adapter.delete("doc.md").await.unwrap();
        assert!(!dir.path().join("doc.md").exists());
        assert!(!dir.path().join("doc.md.meta.json").exists());
        assert!(adapter.get("doc.md").await.unwrap_err().is_not_found());
    }

    #[test]
    fn from_config_requires_existing_root_unless_create() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing");
        let err = LocalWorkspaceAdapter::from_config(&serde_json::json!({ "root": missing }))
            .unwrap_err();
        assert!(err.is_configuration_error());

        let adapter =
            LocalWorkspaceAdapter::from_config(&serde_json::json!({ "root": missing, "create": true }))
                .expect("created");
        assert!(adapter.root().is_dir());
    }
}
