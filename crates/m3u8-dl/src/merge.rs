// Reassembler: concatenates cached segments into the output file in playlist order.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use crate::DownloadError;
use crate::cache::CacheArea;
use crate::playlist::parse_segment_index;

/// Capacity of the output write buffer.
pub const MERGE_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub merged: usize,
    pub skipped: usize,
    pub bytes: u64,
}

enum AppendError {
    Read(io::Error),
    Write(io::Error),
}

/// Segment files in the cache directory, ordered by ordinal. Files whose name
/// is not a segment name are ignored, as are directories. Entries whose
/// metadata cannot be read (dangling links) are kept so the merge reports them
/// as skipped.
async fn list_segments(dir: &Path) -> io::Result<Vec<(usize, PathBuf)>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut segments = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if matches!(tokio::fs::metadata(&path).await, Ok(metadata) if metadata.is_dir()) {
            continue;
        }
        let Some(index) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(parse_segment_index)
        else {
            debug!(path = %path.display(), "Ignoring non-segment file in cache");
            continue;
        };
        segments.push((index, path));
    }

    segments.sort_unstable_by_key(|(index, _)| *index);
    Ok(segments)
}

/// Appends one segment to `writer`. The segment is read in full before
/// anything is written, so a read failure never leaves part of it in the output.
async fn append_segment<W>(path: &Path, writer: &mut W) -> Result<u64, AppendError>
where
    W: AsyncWrite + Unpin,
{
    let data = tokio::fs::read(path).await.map_err(AppendError::Read)?;
    writer.write_all(&data).await.map_err(AppendError::Write)?;
    Ok(data.len() as u64)
}

/// Writes every cached segment into `dest` in ordinal order, deleting each
/// consumed file, then removes the cache area.
///
/// Unreadable segments are skipped with a warning. Failing to create or write
/// `dest` is fatal.
pub async fn merge_segments(
    cache: &CacheArea,
    dest: impl AsRef<Path>,
) -> Result<MergeSummary, DownloadError> {
    let dest = dest.as_ref();
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = File::create(dest).await?;
    let mut writer = BufWriter::with_capacity(MERGE_BUFFER_SIZE, file);

    let segments = list_segments(cache.dir()).await?;
    debug!(count = segments.len(), dest = %dest.display(), "Merging segments");

    let mut summary = MergeSummary::default();

    for (index, path) in segments {
        match append_segment(&path, &mut writer).await {
            Ok(bytes) => {
                summary.merged += 1;
                summary.bytes += bytes;
            }
            Err(AppendError::Read(e)) => {
                warn!(index, path = %path.display(), error = %e, "Skipping unreadable segment");
                summary.skipped += 1;
                continue;
            }
            Err(AppendError::Write(e)) => return Err(e.into()),
        }

        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "Failed to remove merged segment");
        }
    }

    writer.flush().await?;
    writer.into_inner().sync_all().await?;

    cache.cleanup().await?;

    info!(
        dest = %dest.display(),
        merged = summary.merged,
        skipped = summary.skipped,
        bytes = summary.bytes,
        "Merge complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn cache_with(files: &[(&str, &str)]) -> (tempfile::TempDir, CacheArea) {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CacheArea::create(tmp.path().join("cache"), "merge").await.unwrap();
        for (name, body) in files {
            tokio::fs::write(cache.dir().join(name), body).await.unwrap();
        }
        (tmp, cache)
    }

    #[tokio::test]
    async fn test_merge_orders_by_ordinal() {
        let (tmp, cache) = cache_with(&[
            ("000010.ts", "J"),
            ("000002.ts", "B"),
            ("000001.ts", "A"),
        ])
        .await;
        let dest = tmp.path().join("out.ts");

        let summary = merge_segments(&cache, &dest).await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"ABJ");
        assert_eq!(
            summary,
            MergeSummary {
                merged: 3,
                skipped: 0,
                bytes: 3
            }
        );
        assert!(!cache.dir().exists());
        assert!(!tmp.path().join("cache").exists());
    }

    #[tokio::test]
    async fn test_merge_ignores_foreign_files() {
        let (tmp, cache) = cache_with(&[("000001.ts", "A"), ("notes.txt", "ignored")]).await;
        let dest = tmp.path().join("out.ts");

        let summary = merge_segments(&cache, &dest).await.unwrap();

        assert_eq!(summary.merged, 1);
        assert_eq!(std::fs::read(&dest).unwrap(), b"A");
    }

    #[tokio::test]
    async fn test_merge_creates_parent_directories() {
        let (tmp, cache) = cache_with(&[("000001.ts", "A")]).await;
        let dest = tmp.path().join("nested").join("dir").join("out.ts");

        merge_segments(&cache, &dest).await.unwrap();
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn test_merge_fails_when_dest_cannot_be_created() {
        let (tmp, cache) = cache_with(&[("000001.ts", "A")]).await;
        // A directory in place of the output file.
        let dest = tmp.path().join("taken");
        std::fs::create_dir(&dest).unwrap();

        let result = merge_segments(&cache, &dest).await;
        assert!(matches!(result, Err(DownloadError::Io(_))));
        assert!(cache.dir().join("000001.ts").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_merge_skips_unreadable_segment() {
        let (tmp, cache) = cache_with(&[("000001.ts", "A"), ("000003.ts", "C")]).await;
        // Dangling link: listed as a segment, fails to open.
        std::os::unix::fs::symlink(tmp.path().join("missing.ts"), cache.dir().join("000002.ts"))
            .unwrap();
        let dest = tmp.path().join("out.ts");

        let summary = merge_segments(&cache, &dest).await.unwrap();

        assert_eq!(
            summary,
            MergeSummary {
                merged: 2,
                skipped: 1,
                bytes: 2
            }
        );
        assert_eq!(std::fs::read(&dest).unwrap(), b"AC");
        assert!(!cache.dir().exists());
    }

    #[tokio::test]
    async fn test_merge_ignores_directories() {
        let (tmp, cache) = cache_with(&[("000001.ts", "A")]).await;
        std::fs::create_dir(cache.dir().join("000002.ts")).unwrap();
        let dest = tmp.path().join("out.ts");

        let summary = merge_segments(&cache, &dest).await.unwrap();

        assert_eq!(summary.merged, 1);
        assert_eq!(summary.skipped, 0);
        assert_eq!(std::fs::read(&dest).unwrap(), b"A");
    }

    #[tokio::test]
    async fn test_merge_empty_cache_produces_empty_file() {
        let (tmp, cache) = cache_with(&[]).await;
        let dest = tmp.path().join("out.ts");

        let summary = merge_segments(&cache, &dest).await.unwrap();
        assert_eq!(summary, MergeSummary::default());
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);
    }
}
