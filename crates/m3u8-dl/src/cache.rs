// Per-batch scratch directory holding one file per downloaded segment.

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::playlist::SegmentDescriptor;

/// Default cache root, relative to the working directory.
pub const DEFAULT_CACHE_ROOT: &str = "cache";

#[derive(Debug, Clone)]
pub struct CacheArea {
    root: PathBuf,
    dir: PathBuf,
    id: String,
}

impl CacheArea {
    /// Creates `<root>/<id>/`, including missing parents.
    pub async fn create(root: impl Into<PathBuf>, id: impl Into<String>) -> io::Result<Self> {
        let root = root.into();
        let id = id.into();
        let dir = root.join(&id);
        tokio::fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "Created cache area");
        Ok(Self { root, dir, id })
    }

    /// Like [`CacheArea::create`] with a random identifier.
    pub async fn create_unique(root: impl Into<PathBuf>) -> io::Result<Self> {
        Self::create(root, uuid::Uuid::new_v4().to_string()).await
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn segment_path(&self, segment: &SegmentDescriptor) -> PathBuf {
        self.dir.join(segment.file_name())
    }

    /// Removes the batch directory and, when it is left empty, the root.
    ///
    /// Safe to call more than once.
    pub async fn cleanup(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => debug!(dir = %self.dir.display(), "Removed cache area"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        // Fails while other batches still use the root; that is fine.
        if let Err(e) = tokio::fs::remove_dir(&self.root).await {
            debug!(root = %self.root.display(), error = %e, "Cache root kept");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    #[tokio::test]
    async fn test_create_and_segment_path() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CacheArea::create(tmp.path().join("cache"), "batch-1")
            .await
            .unwrap();

        assert!(cache.dir().is_dir());
        assert_eq!(cache.id(), "batch-1");

        let segment = SegmentDescriptor::new(3, Url::parse("http://example.com/3.ts").unwrap());
        assert_eq!(
            cache.segment_path(&segment),
            tmp.path().join("cache").join("batch-1").join("000003.ts")
        );
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("cache");
        let cache = CacheArea::create_unique(&root).await.unwrap();
        tokio::fs::write(cache.dir().join("000001.ts"), b"x")
            .await
            .unwrap();

        cache.cleanup().await.unwrap();
        assert!(!cache.dir().exists());
        assert!(!root.exists());

        cache.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_keeps_shared_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("cache");
        let first = CacheArea::create(&root, "a").await.unwrap();
        let second = CacheArea::create(&root, "b").await.unwrap();

        first.cleanup().await.unwrap();
        assert!(root.exists());
        assert!(second.dir().exists());
    }
}
