//! Locality oracle: preferred-server lists per region, computed from DFS
//! block placement and cached in a local snapshot file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::catalog::{REGIONINFO_FILE_NAME, RegionInfo};
use crate::dfs::Dfs;
use crate::utils::RangemasterError;

/// File name of the locality snapshot under the tmp directory.
const SNAPSHOT_FILE_NAME: &str = "regionLocality-snapshot";

/// Preferred-server lists per region name, most co-located first.
#[derive(Debug, Default)]
pub struct LocalityOracle {
    preferred: HashMap<String, Vec<String>>,
}

impl LocalityOracle {
    /// An oracle with no preferences (locality disabled).
    pub fn empty() -> Self {
        Self::default()
    }

    /// An oracle over a precomputed preference map.
    pub fn with_preferences(
        preferred: HashMap<String, Vec<String>>,
    ) -> Self {
        LocalityOracle { preferred }
    }

    /// Preferred servers for a region, most co-located first.
    pub fn preferred_for(&self, region_name: &str) -> Option<&[String]> {
        self.preferred.get(region_name).map(|v| v.as_slice())
    }

    /// Number of regions with computed preferences.
    pub fn len(&self) -> usize {
        self.preferred.len()
    }

    /// Whether no preferences are known.
    pub fn is_empty(&self) -> bool {
        self.preferred.is_empty()
    }

    fn snapshot_path(tmp_dir: &Path) -> PathBuf {
        tmp_dir.join(SNAPSHOT_FILE_NAME)
    }

    /// Loads the snapshot if present and younger than `validity_ms`, else
    /// scans the DFS with `pool_size` workers and rewrites the snapshot.
    pub async fn load_or_scan(
        dfs: Arc<dyn Dfs>,
        rootdir: &Path,
        tmp_dir: &Path,
        validity_ms: u64,
        pool_size: usize,
    ) -> Self {
        match Self::from_snapshot(dfs.as_ref(), tmp_dir, validity_ms).await {
            Ok(Some(oracle)) => return oracle,
            Ok(None) => {}
            Err(e) => {
                // a damaged snapshot must not stall master construction
                pf_warn!("m"; "error loading locality snapshot: {}", e);
            }
        }

        let oracle = match Self::reevaluate(dfs.clone(), rootdir, pool_size)
            .await
        {
            Ok(oracle) => oracle,
            Err(e) => {
                pf_warn!("m"; "error evaluating region locality: {}", e);
                return Self::empty();
            }
        };
        if let Err(e) = oracle.save_snapshot(dfs.as_ref(), tmp_dir).await {
            pf_warn!("m"; "error saving locality snapshot: {}", e);
        }
        oracle
    }

    /// Loads preferences from the snapshot file. `Ok(None)` means missing
    /// or expired.
    pub async fn from_snapshot(
        dfs: &dyn Dfs,
        tmp_dir: &Path,
        validity_ms: u64,
    ) -> Result<Option<Self>, RangemasterError> {
        let path = Self::snapshot_path(tmp_dir);
        if !dfs.exists(&path).await? {
            pf_info!("m"; "locality snapshot not found at '{}'",
                     path.display());
            return Ok(None);
        }
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let age_ms = now_ms.saturating_sub(dfs.modified_ms(&path).await?);
        if age_ms >= validity_ms {
            pf_info!("m"; "locality snapshot too old ({} ms), ignoring",
                     age_ms);
            return Ok(None);
        }
        let bytes = dfs.read_file(&path).await?;
        let preferred: HashMap<String, Vec<String>> =
            rmp_serde::decode::from_slice(&bytes)?;
        pf_debug!("m"; "loaded locality snapshot with {} regions",
                  preferred.len());
        Ok(Some(LocalityOracle { preferred }))
    }

    /// Writes the snapshot file.
    pub async fn save_snapshot(
        &self,
        dfs: &dyn Dfs,
        tmp_dir: &Path,
    ) -> Result<(), RangemasterError> {
        let path = Self::snapshot_path(tmp_dir);
        let bytes = rmp_serde::encode::to_vec(&self.preferred)?;
        dfs.write_file(&path, &bytes).await?;
        pf_info!("m"; "saved locality snapshot to '{}'", path.display());
        Ok(())
    }

    /// Scans every region directory under `rootdir` and ranks, per region,
    /// the hosts holding the most of its blocks. Expect a pause here on a
    /// large cluster.
    pub async fn reevaluate(
        dfs: Arc<dyn Dfs>,
        rootdir: &Path,
        pool_size: usize,
    ) -> Result<Self, RangemasterError> {
        pf_debug!("m"; "evaluating region locality; expecting pause here");

        // gather region directories: <rootdir>/<table>/<region_id>/
        let mut region_dirs = vec![];
        for table_dir in dfs.list_dir(rootdir).await? {
            let name = table_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if name.starts_with('.') {
                continue; // .logs, .oldlogs
            }
            let entries = match dfs.list_dir(&table_dir).await {
                Ok(entries) => entries,
                Err(_) => continue, // plain file (version marker)
            };
            for region_dir in entries {
                if dfs
                    .exists(&region_dir.join(REGIONINFO_FILE_NAME))
                    .await?
                {
                    region_dirs.push(region_dir);
                }
            }
        }

        // fan the scan out over a bounded worker pool
        let pool_size = pool_size.max(1);
        let chunk_len = region_dirs.len().div_ceil(pool_size).max(1);
        let mut handles = vec![];
        for chunk in region_dirs.chunks(chunk_len) {
            let chunk = chunk.to_vec();
            let dfs = dfs.clone();
            handles.push(tokio::spawn(async move {
                let mut partial: HashMap<String, Vec<String>> =
                    HashMap::new();
                for dir in chunk {
                    match Self::scan_region_dir(dfs.as_ref(), &dir).await {
                        Ok(Some((name, hosts))) => {
                            partial.insert(name, hosts);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            pf_warn!("m"; "locality scan of '{}' failed: {}",
                                     dir.display(), e);
                        }
                    }
                }
                partial
            }));
        }

        let mut preferred = HashMap::new();
        for handle in handles {
            preferred.extend(handle.await?);
        }
        pf_info!("m"; "evaluated locality for {} regions", preferred.len());
        Ok(LocalityOracle { preferred })
    }

    async fn scan_region_dir(
        dfs: &dyn Dfs,
        region_dir: &Path,
    ) -> Result<Option<(String, Vec<String>)>, RangemasterError> {
        let info_bytes = dfs
            .read_file(&region_dir.join(REGIONINFO_FILE_NAME))
            .await?;
        let region: RegionInfo = rmp_serde::decode::from_slice(&info_bytes)?;

        let mut host_blocks: HashMap<String, u64> = HashMap::new();
        for entry in dfs.list_dir(region_dir).await? {
            for host in dfs.block_hosts(&entry).await? {
                *host_blocks.entry(host).or_default() += 1;
            }
        }
        if host_blocks.is_empty() {
            return Ok(None);
        }
        let mut ranked: Vec<(String, u64)> =
            host_blocks.into_iter().collect();
        // most blocks first, names tie-break for determinism
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(Some((
            region.region_name(),
            ranked.into_iter().map(|(host, _)| host).collect(),
        )))
    }
}

#[cfg(test)]
mod locality_tests {
    use super::*;
    use crate::catalog::{CatalogTable, TableSchema};
    use crate::dfs::LocalDfs;

    async fn seeded_rootdir(
        tmp: &tempfile::TempDir,
    ) -> Result<(Arc<dyn Dfs>, PathBuf), RangemasterError> {
        let dfs: Arc<dyn Dfs> = Arc::new(LocalDfs::new("rs1"));
        let rootdir = tmp.path().join("root");
        let catalog = CatalogTable::new(dfs.clone(), rootdir.clone());
        catalog.bootstrap().await?;
        let region = RegionInfo::new(
            TableSchema::new("t"),
            vec![],
            b"m".to_vec(),
            100,
        );
        catalog.insert_regions(std::slice::from_ref(&region)).await?;
        // one store file so the region has blocks to rank
        dfs.write_file(
            &catalog.region_dir(&region).join("storefile0"),
            b"payload",
        )
        .await?;
        Ok((dfs, rootdir))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reevaluate_ranks_hosts() -> Result<(), RangemasterError> {
        let tmp = tempfile::tempdir().unwrap();
        let (dfs, rootdir) = seeded_rootdir(&tmp).await?;
        let oracle =
            LocalityOracle::reevaluate(dfs, &rootdir, 5).await?;
        let hosts = oracle.preferred_for("t,,100").unwrap();
        assert_eq!(hosts, ["rs1"]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn snapshot_round_trip() -> Result<(), RangemasterError> {
        let tmp = tempfile::tempdir().unwrap();
        let (dfs, rootdir) = seeded_rootdir(&tmp).await?;
        let tmp_dir = tmp.path().join("tmp");
        dfs.mkdirs(&tmp_dir).await?;

        let oracle = LocalityOracle::load_or_scan(
            dfs.clone(),
            &rootdir,
            &tmp_dir,
            24 * 60 * 60 * 1_000,
            5,
        )
        .await;
        assert!(!oracle.is_empty());

        // fresh snapshot is honored
        let cached = LocalityOracle::from_snapshot(
            dfs.as_ref(),
            &tmp_dir,
            24 * 60 * 60 * 1_000,
        )
        .await?
        .unwrap();
        assert_eq!(cached.len(), oracle.len());

        // expired snapshot is ignored
        assert!(LocalityOracle::from_snapshot(dfs.as_ref(), &tmp_dir, 0)
            .await?
            .is_none());
        Ok(())
    }
}
