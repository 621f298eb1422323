//! Log-split driver: on server death (or adoption of orphaned log
//! directories at startup), renames the dead server's log directory out of
//! the way of rogue revivals, runs the split routine, and records metrics.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::dfs::Dfs;
use crate::master::metrics::MasterMetrics;
use crate::utils::RangemasterError;

/// Per-server write-ahead log directories live here.
pub const LOG_DIR_NAME: &str = ".logs";

/// Split logs are archived here.
pub const OLD_LOG_DIR_NAME: &str = ".oldlogs";

/// Suffix marking a log directory under recovery.
pub const SPLITTING_EXT: &str = "-splitting";

/// The log-split driver. At most one split runs at a time (the split lock
/// bounds DFS load and deliberately serializes recoveries).
pub struct LogSplitter {
    dfs: Arc<dyn Dfs>,
    logs_dir: PathBuf,
    old_logs_dir: PathBuf,
    split_lock: Arc<Mutex<()>>,
    metrics: Arc<MasterMetrics>,
}

impl LogSplitter {
    /// Creates a driver rooted at the cluster root directory.
    pub fn new(
        dfs: Arc<dyn Dfs>,
        rootdir: &Path,
        metrics: Arc<MasterMetrics>,
    ) -> Self {
        LogSplitter {
            dfs,
            logs_dir: rootdir.join(LOG_DIR_NAME),
            old_logs_dir: rootdir.join(OLD_LOG_DIR_NAME),
            split_lock: Arc::new(Mutex::new(())),
            metrics,
        }
    }

    /// The log directory of one server.
    pub fn log_dir(&self, server_name: &str) -> PathBuf {
        self.logs_dir.join(server_name)
    }

    /// Splits one dead server's logs: rename to `<dir>-splitting`, run the
    /// split routine, record `(duration, files, bytes)`. On failure the
    /// directory is left in place so the next startup retries. The split
    /// lock guard is released on every exit path.
    pub async fn split_server_log(
        &self,
        server_name: &str,
    ) -> Result<(), RangemasterError> {
        let _guard = self.split_lock.lock().await;

        let mut log_dir = self.log_dir(server_name);
        let splitting_dir = self.log_dir(&format!(
            "{}{}",
            server_name.trim_end_matches(SPLITTING_EXT),
            SPLITTING_EXT
        ));
        if self.dfs.exists(&log_dir).await?
            && !server_name.ends_with(SPLITTING_EXT)
        {
            // rename so a rogue revival cannot append more logs
            self.dfs.rename(&log_dir, &splitting_dir).await?;
            pf_debug!("m"; "renamed log directory to '{}'",
                      splitting_dir.display());
        }
        log_dir = splitting_dir;
        if !self.dfs.exists(&log_dir).await? {
            pf_debug!("m"; "no logs to split for '{}'", server_name);
            return Ok(());
        }

        let summary = self.dfs.content_summary(&log_dir).await?;
        let split_start = Instant::now();
        split_log(
            &log_dir,
            &self.old_logs_dir,
            self.dfs.as_ref(),
        )
        .await?;
        self.metrics.add_split(
            split_start.elapsed(),
            summary.file_count,
            summary.space_bytes,
        );
        pf_info!("m"; "split {} log files ({} bytes) of '{}'",
                 summary.file_count, summary.space_bytes, server_name);
        Ok(())
    }

    /// Startup sweep: splits every log directory that does not belong to a
    /// live registered server.
    pub async fn split_dead_logs(
        &self,
        live_servers: &HashSet<String>,
    ) -> Result<(), RangemasterError> {
        if !self.dfs.exists(&self.logs_dir).await? {
            return Ok(());
        }
        let log_dirs = self.dfs.list_dir(&self.logs_dir).await?;
        if log_dirs.is_empty() {
            pf_debug!("m"; "no log files to split, proceeding...");
            return Ok(());
        }
        for dir in log_dirs {
            let server_name = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if live_servers
                .contains(server_name.trim_end_matches(SPLITTING_EXT))
            {
                pf_info!("m"; "log folder '{}' belongs to a live server",
                         server_name);
                continue;
            }
            pf_info!("m"; "log folder '{}' has no live server, splitting",
                     server_name);
            if let Err(e) = self.split_server_log(&server_name).await {
                pf_error!("m"; "failed splitting logs of '{}': {}",
                          server_name, e);
            }
        }
        Ok(())
    }
}

/// The split routine's driver contract: every log file under `split_dir`
/// ends up archived under `old_logs_dir` and the directory is removed.
/// (Sorting edits into per-region recovery files is the region servers'
/// replay concern, not the master's.)
async fn split_log(
    split_dir: &Path,
    old_logs_dir: &Path,
    dfs: &dyn Dfs,
) -> Result<(), RangemasterError> {
    dfs.mkdirs(old_logs_dir).await?;
    let dir_name = split_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    for file in dfs.list_dir(split_dir).await? {
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let archived =
            old_logs_dir.join(format!("{}.{}", dir_name, file_name));
        dfs.rename(&file, &archived).await?;
    }
    dfs.remove_dir_all(split_dir).await?;
    Ok(())
}

#[cfg(test)]
mod logsplit_tests {
    use super::*;
    use crate::dfs::LocalDfs;

    fn splitter_in(tmp: &tempfile::TempDir) -> (Arc<dyn Dfs>, LogSplitter) {
        let dfs: Arc<dyn Dfs> = Arc::new(LocalDfs::default());
        let splitter = LogSplitter::new(
            dfs.clone(),
            tmp.path(),
            Arc::new(MasterMetrics::default()),
        );
        (dfs, splitter)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn split_archives_and_removes() -> Result<(), RangemasterError> {
        let tmp = tempfile::tempdir().unwrap();
        let (dfs, splitter) = splitter_in(&tmp);

        let log_dir = splitter.log_dir("rs1,7001,1");
        dfs.write_file(&log_dir.join("wal.0"), b"0123456789").await?;
        dfs.write_file(&log_dir.join("wal.1"), b"01234").await?;

        splitter.split_server_log("rs1,7001,1").await?;

        assert!(!dfs.exists(&log_dir).await?);
        assert!(
            !dfs.exists(&splitter.log_dir("rs1,7001,1-splitting"))
                .await?
        );
        let old = tmp.path().join(OLD_LOG_DIR_NAME);
        assert!(dfs.exists(&old.join("rs1,7001,1-splitting.wal.0")).await?);
        assert!(dfs.exists(&old.join("rs1,7001,1-splitting.wal.1")).await?);

        let snap = splitter.metrics.snapshot();
        assert_eq!(snap.splits_completed, 1);
        assert_eq!(snap.split_files_total, 2);
        assert_eq!(snap.split_bytes_total, 15);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn split_missing_dir_is_noop() -> Result<(), RangemasterError> {
        let tmp = tempfile::tempdir().unwrap();
        let (_dfs, splitter) = splitter_in(&tmp);
        splitter.split_server_log("rs9,7001,1").await?;
        assert_eq!(splitter.metrics.snapshot().splits_completed, 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn startup_sweep_skips_live_servers(
    ) -> Result<(), RangemasterError> {
        let tmp = tempfile::tempdir().unwrap();
        let (dfs, splitter) = splitter_in(&tmp);

        dfs.write_file(&splitter.log_dir("rs1,7001,1").join("wal.0"), b"a")
            .await?;
        dfs.write_file(&splitter.log_dir("rs2,7001,1").join("wal.0"), b"b")
            .await?;

        let live =
            HashSet::from(["rs1,7001,1".to_string()]);
        splitter.split_dead_logs(&live).await?;

        assert!(dfs.exists(&splitter.log_dir("rs1,7001,1")).await?);
        assert!(!dfs.exists(&splitter.log_dir("rs2,7001,1")).await?);
        assert_eq!(splitter.metrics.snapshot().splits_completed, 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resumes_already_renamed_dir() -> Result<(), RangemasterError> {
        let tmp = tempfile::tempdir().unwrap();
        let (dfs, splitter) = splitter_in(&tmp);

        // a prior master died mid-recovery after the rename
        dfs.write_file(
            &splitter.log_dir("rs1,7001,1-splitting").join("wal.0"),
            b"abc",
        )
        .await?;
        splitter.split_server_log("rs1,7001,1-splitting").await?;
        assert!(
            !dfs.exists(&splitter.log_dir("rs1,7001,1-splitting"))
                .await?
        );
        assert_eq!(splitter.metrics.snapshot().splits_completed, 1);
        Ok(())
    }
}
