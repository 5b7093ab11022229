//! Lock storage backends
//!
//! The lock primitives only need a handful of operations on named entries:
//! atomic create-if-absent, age inspection, refresh, removal, and a small
//! key/value store for the reader counter. [`FileBackend`] implements them
//! over a fixed directory; a networked key-value store could implement the
//! same trait to coordinate across hosts.

use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Marker file signalling that lock state may be inconsistent and must be
/// cleared by an operator before reuse.
const DIRTY_MARKER: &str = "needs-cleanup";

/// Storage operations the lock primitives are built on.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Atomically create the named entry if absent. Returns `true` when this
    /// call created it, `false` when it already existed.
    async fn create_if_absent(&self, name: &str, holder: &str) -> Result<bool>;

    /// Time since the entry was last created or refreshed, `None` if absent.
    async fn age(&self, name: &str) -> Result<Option<Duration>>;

    /// Rewrite the entry's content and refresh timestamp. Returns `false`
    /// if the entry no longer exists.
    async fn refresh(&self, name: &str, holder: &str) -> Result<bool>;

    /// Remove the entry. Returns `false` if it was already gone.
    async fn remove(&self, name: &str) -> Result<bool>;

    async fn exists(&self, name: &str) -> Result<bool>;

    /// Small key/value store used for the persisted reader counter.
    async fn read_value(&self, key: &str) -> Result<Option<String>>;
    async fn write_value(&self, key: &str, value: &str) -> Result<()>;
    async fn remove_value(&self, key: &str) -> Result<()>;

    /// Dirty marker: set after an unrecoverable lock failure so later
    /// invocations know the lock state needs manual clearing.
    async fn set_dirty(&self) -> Result<()>;
    async fn is_dirty(&self) -> Result<bool>;
    async fn clear_dirty(&self) -> Result<()>;
}

/// Filesystem-based lock storage: one file per lock name under a fixed
/// directory, content = holder process id, mtime = last refresh.
///
/// Only coordinates processes sharing the directory's filesystem.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).await?;
            tracing::debug!("Created lock directory: {}", self.dir.display());
        }
        Ok(())
    }
}

#[async_trait]
impl LockBackend for FileBackend {
    async fn create_if_absent(&self, name: &str, holder: &str) -> Result<bool> {
        self.ensure_dir().await?;
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path(name))
            .await
        {
            Ok(mut file) => {
                file.write_all(holder.as_bytes()).await?;
                file.flush().await?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn age(&self, name: &str) -> Result<Option<Duration>> {
        match fs::metadata(self.path(name)).await {
            Ok(meta) => {
                let modified = meta.modified()?;
                // A clock step backwards reads as a brand-new lock.
                Ok(Some(modified.elapsed().unwrap_or(Duration::ZERO)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn refresh(&self, name: &str, holder: &str) -> Result<bool> {
        let path = self.path(name);
        if !path.exists() {
            return Ok(false);
        }
        fs::write(&path, holder.as_bytes()).await?;
        Ok(true)
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        match fs::remove_file(self.path(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.path(name).exists())
    }

    async fn read_value(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path(key)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_value(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_dir().await?;
        fs::write(self.path(key), value.as_bytes()).await?;
        Ok(())
    }

    async fn remove_value(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_dirty(&self) -> Result<()> {
        self.ensure_dir().await?;
        fs::write(self.path(DIRTY_MARKER), std::process::id().to_string()).await?;
        tracing::warn!("Lock state marked inconsistent; operator cleanup required");
        Ok(())
    }

    async fn is_dirty(&self) -> Result<bool> {
        Ok(self.path(DIRTY_MARKER).exists())
    }

    async fn clear_dirty(&self) -> Result<()> {
        self.remove_value(DIRTY_MARKER).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_create_if_absent_is_exclusive() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::new(dir.path());

        assert!(backend.create_if_absent("a", "1234").await.unwrap());
        assert!(!backend.create_if_absent("a", "5678").await.unwrap());

        let content = backend.read_value("a").await.unwrap().unwrap();
        assert_eq!(content, "1234");
    }

    #[tokio::test]
    async fn test_remove_reports_absence() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::new(dir.path());

        backend.create_if_absent("a", "1").await.unwrap();
        assert!(backend.remove("a").await.unwrap());
        assert!(!backend.remove("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_age_of_missing_entry() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::new(dir.path());
        assert!(backend.age("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dirty_marker_lifecycle() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::new(dir.path());

        assert!(!backend.is_dirty().await.unwrap());
        backend.set_dirty().await.unwrap();
        assert!(backend.is_dirty().await.unwrap());
        backend.clear_dirty().await.unwrap();
        assert!(!backend.is_dirty().await.unwrap());
    }
}
