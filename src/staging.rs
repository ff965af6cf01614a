//! Local staging area for content between fetch and finalization.
//!
//! A staged file is named after its work item's row id and the claim that
//! fetched it. Two claims on one row never share a name, so a worker whose
//! lease was taken back can only touch its own file.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::file_hash;

#[derive(Debug, Clone)]
pub struct Staging {
    dir: PathBuf,
}

impl Staging {
    pub fn new(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `claim` identifies one lease on the row. The lease expiry works: a
    /// row is only claimed again after the previous expiry has passed.
    pub fn content_ref_for(item_id: i64, claim: i64) -> String {
        format!("{item_id}-{claim}.dat")
    }

    pub fn path_of(&self, content_ref: &str) -> io::Result<PathBuf> {
        let plain = Path::new(content_ref)
            .file_name()
            .is_some_and(|name| name == content_ref);
        if !plain {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Invalid content reference: {content_ref}"),
            ));
        }
        Ok(self.dir.join(content_ref))
    }

    /// Durably write `bytes`; the final name only appears once the data is
    /// flushed.
    pub async fn write(&self, content_ref: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = self.path_of(content_ref)?;
        let partial = self.partial_path(content_ref)?;

        let mut file = tokio::fs::File::create(&partial).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&partial, &path).await?;
        Ok(path)
    }

    pub async fn read(&self, content_ref: &str) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.path_of(content_ref)?).await
    }

    /// Hash the staged file as it is on disk now.
    pub async fn hash(&self, content_ref: &str) -> io::Result<String> {
        let path = self.path_of(content_ref)?;
        tokio::task::spawn_blocking(move || file_hash::compute_sha256(&path))
            .await
            .map_err(io::Error::other)?
    }

    /// Remove the staged file. Returns false when it was already gone.
    pub async fn remove(&self, content_ref: &str) -> io::Result<bool> {
        match tokio::fs::remove_file(self.path_of(content_ref)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Drop anything a failed attempt left for `content_ref`.
    pub async fn discard(&self, content_ref: &str) -> io::Result<()> {
        for path in [self.path_of(content_ref)?, self.partial_path(content_ref)?] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn partial_path(&self, content_ref: &str) -> io::Result<PathBuf> {
        Ok(self.path_of(content_ref)?.with_extension("partial"))
    }
}
