//! Directory-backed source and destination.
//!
//! The source walks a tree, typically an exported library, and identifies
//! assets by their path relative to the root. The destination keeps one copy
//! of each upload under `.library/` and materializes collections as
//! sub-directories.

use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use futures::StreamExt;
use walkdir::WalkDir;

use super::{
    AdapterError, CollectionHandle, DestinationAdapter, DiscoveredItem, ItemMetadata,
    ItemStream, SourceAdapter,
};
use crate::file_hash;

const LIBRARY_DIR: &str = ".library";

fn io_error(context: &str, error: io::Error) -> AdapterError {
    let message = format!("{context}: {error}");
    match error.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::InvalidInput => AdapterError::Permanent(message),
        _ => AdapterError::Transient(message),
    }
}

/// File or directory names the walk ignores (`.DS_Store`, `.library`, ...).
fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// Only plain relative paths without `..` may name assets.
fn relative_path(id: &str) -> Result<PathBuf, AdapterError> {
    let path = Path::new(id);
    let clean = !id.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if clean {
        Ok(path.to_path_buf())
    } else {
        Err(AdapterError::permanent(format!("Invalid item id: {id}")))
    }
}

pub struct LocalDirectorySource {
    root: PathBuf,
}

impl LocalDirectorySource {
    pub fn new(root: &Path) -> io::Result<Self> {
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a directory", root.display()),
            ));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn entry_to_item(root: &Path, entry: walkdir::DirEntry) -> Result<DiscoveredItem, AdapterError> {
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| AdapterError::permanent(e.to_string()))?;
        let source_id = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let metadata = entry
            .metadata()
            .map_err(|e| AdapterError::transient(format!("Failed to stat {source_id}: {e}")))?;
        let created_at = metadata
            .created()
            .or_else(|_| metadata.modified())
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .and_then(|elapsed| i64::try_from(elapsed.as_secs()).ok());

        Ok(DiscoveredItem {
            file_name: Some(entry.file_name().to_string_lossy().into_owned()),
            size_bytes: i64::try_from(metadata.len()).ok(),
            created_at,
            source_id,
        })
    }
}

#[async_trait::async_trait]
impl SourceAdapter for LocalDirectorySource {
    fn list_items(&self) -> ItemStream {
        let root = self.root.clone();
        let walk = WalkDir::new(&root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !is_hidden(entry.file_name()));

        futures::stream::iter(walk)
            .filter_map(move |entry| {
                let item = match entry {
                    Ok(entry) if entry.file_type().is_file() => {
                        Some(Self::entry_to_item(&root, entry))
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(AdapterError::transient(format!("Walk failed: {e}")))),
                };
                futures::future::ready(item)
            })
            .boxed()
    }

    async fn fetch(&self, source_id: &str) -> Result<Vec<u8>, AdapterError> {
        let path = self.root.join(relative_path(source_id)?);
        tokio::fs::read(&path)
            .await
            .map_err(|e| io_error(&format!("Failed to read {source_id}"), e))
    }
}

pub struct LocalDirectoryDestination {
    root: PathBuf,
}

impl LocalDirectoryDestination {
    pub fn new(root: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(root.join(LIBRARY_DIR))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn library_path(&self, destination_id: &str) -> Result<PathBuf, AdapterError> {
        Ok(self.root.join(LIBRARY_DIR).join(relative_path(destination_id)?))
    }

    /// A collection name usable as a single directory name.
    fn collection_dir_name(name: &str) -> String {
        name.chars()
            .map(|c| match c {
                '/' | '\\' | '\0' => '_',
                c => c,
            })
            .collect::<String>()
            .trim_start_matches('.')
            .to_string()
    }
}

/// Write `bytes` to a private temp file next to `path` and move it into
/// place. Losing the rename to an identical upload is fine.
fn publish(path: &Path, bytes: &[u8]) -> Result<(), AdapterError> {
    let dir = path
        .parent()
        .ok_or_else(|| AdapterError::permanent(format!("No parent for {}", path.display())))?;
    let mut partial = tempfile::Builder::new()
        .prefix(".upload-")
        .tempfile_in(dir)
        .map_err(|e| io_error("Failed to create upload", e))?;
    partial
        .write_all(bytes)
        .and_then(|()| partial.as_file().sync_all())
        .map_err(|e| io_error("Failed to write upload", e))?;

    match partial.persist(path) {
        Ok(_) => Ok(()),
        Err(_) if path.exists() => Ok(()),
        Err(e) => Err(io_error("Failed to publish upload", e.error)),
    }
}

#[async_trait::async_trait]
impl DestinationAdapter for LocalDirectoryDestination {
    async fn upload(
        &self,
        bytes: Vec<u8>,
        metadata: &ItemMetadata,
    ) -> Result<String, AdapterError> {
        let file_name = Path::new(&metadata.file_name)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "item".to_string());
        let hash = file_hash::sha256_bytes(&bytes);
        // Content-addressed, so uploading the same asset again is a no-op.
        let destination_id = format!("{}-{}", &hash[..16], file_name);
        let path = self.library_path(&destination_id)?;

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(destination_id);
        }
        tokio::task::spawn_blocking(move || publish(&path, &bytes))
            .await
            .map_err(|e| AdapterError::transient(format!("Upload task failed: {e}")))??;

        tracing::debug!(%destination_id, source_id = %metadata.source_id, "Stored upload");
        Ok(destination_id)
    }

    async fn ensure_collection(&self, name: &str) -> Result<CollectionHandle, AdapterError> {
        let dir_name = Self::collection_dir_name(name);
        if dir_name.is_empty() {
            return Err(AdapterError::permanent(format!(
                "Unusable collection name: {name}"
            )));
        }
        tokio::fs::create_dir_all(self.root.join(&dir_name))
            .await
            .map_err(|e| io_error("Failed to create collection", e))?;
        Ok(CollectionHandle {
            id: dir_name,
            name: name.to_string(),
        })
    }

    async fn add_to_collection(
        &self,
        destination_id: &str,
        collection: &CollectionHandle,
    ) -> Result<(), AdapterError> {
        let source = self.library_path(destination_id)?;
        let target = self
            .root
            .join(relative_path(&collection.id)?)
            .join(relative_path(destination_id)?);

        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Ok(());
        }
        if tokio::fs::hard_link(&source, &target).await.is_err() {
            tokio::fs::copy(&source, &target)
                .await
                .map_err(|e| io_error("Failed to add to collection", e))?;
        }
        Ok(())
    }
}
