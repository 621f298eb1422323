//! Shared file system seam: the operations the master needs from the DFS
//! (atomic rename, durable writes, listing, safe-mode signalling), plus the
//! local-filesystem implementation used by tests and local mode, and the
//! on-disk layout version marker check.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::{self, Duration};

use crate::utils::RangemasterError;

/// Name of the layout version marker file under the root directory.
pub const VERSION_FILE_NAME: &str = "VERSION";

/// Layout version this build reads and writes.
pub const LAYOUT_VERSION: &str = "7";

/// Aggregate size information of a directory tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContentSummary {
    /// Number of regular files underneath.
    pub file_count: u64,

    /// Total bytes consumed by those files.
    pub space_bytes: u64,
}

/// Abstraction over the shared append-capable file system.
#[async_trait]
pub trait Dfs: Send + Sync {
    /// Whether a path exists.
    async fn exists(&self, path: &Path) -> Result<bool, RangemasterError>;

    /// Creates a directory and all parents.
    async fn mkdirs(&self, path: &Path) -> Result<(), RangemasterError>;

    /// Lists direct entries of a directory.
    async fn list_dir(
        &self,
        path: &Path,
    ) -> Result<Vec<PathBuf>, RangemasterError>;

    /// Atomically renames a file or directory. Fails if `to` exists.
    async fn rename(
        &self,
        from: &Path,
        to: &Path,
    ) -> Result<(), RangemasterError>;

    /// Reads a whole file.
    async fn read_file(
        &self,
        path: &Path,
    ) -> Result<Vec<u8>, RangemasterError>;

    /// Creates or replaces a file with the given contents, durably.
    async fn write_file(
        &self,
        path: &Path,
        data: &[u8],
    ) -> Result<(), RangemasterError>;

    /// Removes a file.
    async fn remove_file(&self, path: &Path)
        -> Result<(), RangemasterError>;

    /// Removes a directory tree.
    async fn remove_dir_all(
        &self,
        path: &Path,
    ) -> Result<(), RangemasterError>;

    /// File count and space consumed under a directory.
    async fn content_summary(
        &self,
        path: &Path,
    ) -> Result<ContentSummary, RangemasterError>;

    /// Hosts (as `host` strings) holding blocks of files under a path,
    /// most-co-located first.
    async fn block_hosts(
        &self,
        path: &Path,
    ) -> Result<Vec<String>, RangemasterError>;

    /// Last-modified time of a path, in milliseconds since the epoch.
    async fn modified_ms(&self, path: &Path)
        -> Result<u64, RangemasterError>;

    /// Whether the file system is in safe (read-only startup) mode.
    async fn in_safe_mode(&self) -> Result<bool, RangemasterError>;

    /// Cheap availability probe; `Err` means the DFS is unreachable.
    async fn check_available(&self) -> Result<(), RangemasterError>;
}

/// Blocks until the DFS leaves safe mode, polling every `wait`.
pub async fn wait_on_safe_mode(
    dfs: &dyn Dfs,
    wait: Duration,
) -> Result<(), RangemasterError> {
    while dfs.in_safe_mode().await? {
        pf_info!("m"; "waiting for dfs to exit safe mode...");
        time::sleep(wait).await;
    }
    Ok(())
}

/// Verifies the layout version marker under `rootdir`, writing it on a fresh
/// root directory. Mismatch fails with `IncompatibleVersion`.
pub async fn check_version(
    dfs: &dyn Dfs,
    rootdir: &Path,
) -> Result<(), RangemasterError> {
    let version_file = rootdir.join(VERSION_FILE_NAME);
    if dfs.exists(&version_file).await? {
        let found = String::from_utf8(dfs.read_file(&version_file).await?)?;
        if found.trim() != LAYOUT_VERSION {
            return Err(RangemasterError::IncompatibleVersion {
                found: found.trim().into(),
                expected: LAYOUT_VERSION.into(),
            });
        }
    } else {
        dfs.write_file(&version_file, LAYOUT_VERSION.as_bytes())
            .await?;
        pf_info!("m"; "wrote layout version file '{}'",
                 version_file.display());
    }
    Ok(())
}

/// Local-filesystem implementation of the DFS seam over `tokio::fs`. Rename
/// within one file system is atomic, which is all the master relies on.
pub struct LocalDfs {
    /// Hostname reported for block locality.
    hostname: String,
}

impl LocalDfs {
    /// Creates a handle reporting the given hostname for locality.
    pub fn new(hostname: impl Into<String>) -> Self {
        LocalDfs {
            hostname: hostname.into(),
        }
    }
}

impl Default for LocalDfs {
    fn default() -> Self {
        LocalDfs::new("localhost")
    }
}

#[async_trait]
impl Dfs for LocalDfs {
    async fn exists(&self, path: &Path) -> Result<bool, RangemasterError> {
        Ok(fs::try_exists(path).await?)
    }

    async fn mkdirs(&self, path: &Path) -> Result<(), RangemasterError> {
        fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn list_dir(
        &self,
        path: &Path,
    ) -> Result<Vec<PathBuf>, RangemasterError> {
        let mut entries = fs::read_dir(path).await?;
        let mut paths = vec![];
        while let Some(entry) = entries.next_entry().await? {
            paths.push(entry.path());
        }
        paths.sort();
        Ok(paths)
    }

    async fn rename(
        &self,
        from: &Path,
        to: &Path,
    ) -> Result<(), RangemasterError> {
        if fs::try_exists(to).await? {
            return Err(RangemasterError::msg(format!(
                "rename target '{}' already exists",
                to.display()
            )));
        }
        fs::rename(from, to).await?;
        Ok(())
    }

    async fn read_file(
        &self,
        path: &Path,
    ) -> Result<Vec<u8>, RangemasterError> {
        Ok(fs::read(path).await?)
    }

    async fn write_file(
        &self,
        path: &Path,
        data: &[u8],
    ) -> Result<(), RangemasterError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn remove_file(
        &self,
        path: &Path,
    ) -> Result<(), RangemasterError> {
        fs::remove_file(path).await?;
        Ok(())
    }

    async fn remove_dir_all(
        &self,
        path: &Path,
    ) -> Result<(), RangemasterError> {
        fs::remove_dir_all(path).await?;
        Ok(())
    }

    async fn content_summary(
        &self,
        path: &Path,
    ) -> Result<ContentSummary, RangemasterError> {
        let mut summary = ContentSummary::default();
        let mut stack = vec![path.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    stack.push(entry.path());
                } else {
                    summary.file_count += 1;
                    summary.space_bytes += meta.len();
                }
            }
        }
        Ok(summary)
    }

    async fn block_hosts(
        &self,
        _path: &Path,
    ) -> Result<Vec<String>, RangemasterError> {
        // local fs: every block lives here
        Ok(vec![self.hostname.clone()])
    }

    async fn modified_ms(
        &self,
        path: &Path,
    ) -> Result<u64, RangemasterError> {
        let meta = fs::metadata(path).await?;
        let modified = meta.modified()?;
        Ok(modified
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64)
    }

    async fn in_safe_mode(&self) -> Result<bool, RangemasterError> {
        Ok(false)
    }

    async fn check_available(&self) -> Result<(), RangemasterError> {
        // probing the current time keeps the trait honest for local mode
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(RangemasterError::msg)?;
        Ok(())
    }
}
