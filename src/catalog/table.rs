//! The two-level catalog as persisted state. Root rows locate META regions;
//! META rows locate user regions. The root region's own location lives in
//! the coordination store, never here.
//!
//! The active master is the only writer (guaranteed by the election), so
//! rows are kept as whole-file snapshots rewritten per mutation; a remote
//! implementation proxying through the META-hosting region server can be
//! slotted in behind the same methods.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::region::{RegionInfo, META_TABLE_NAME, ROOT_TABLE_NAME};
use crate::dfs::Dfs;
use crate::utils::RangemasterError;

/// File name of the row snapshot inside each catalog table directory.
const CATALOG_FILE_NAME: &str = "catalog";

/// File name of the region identity marker inside each region directory.
pub const REGIONINFO_FILE_NAME: &str = ".regioninfo";

/// One catalog row: a region, and where it is deployed (if anywhere).
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct CatalogRow {
    /// The region this row describes.
    pub region: RegionInfo,

    /// `host:port` of the hosting server, if deployed.
    pub server: Option<String>,

    /// Start code of the hosting server's incarnation, if deployed.
    pub start_code: Option<u64>,
}

impl CatalogRow {
    /// Creates an undeployed row for a region.
    pub fn undeployed(region: RegionInfo) -> Self {
        CatalogRow {
            region,
            server: None,
            start_code: None,
        }
    }
}

/// Master-side access to the root and META catalog tables.
pub struct CatalogTable {
    dfs: Arc<dyn Dfs>,
    rootdir: PathBuf,
}

impl CatalogTable {
    /// Creates a handle rooted at the cluster root directory.
    pub fn new(dfs: Arc<dyn Dfs>, rootdir: PathBuf) -> Self {
        CatalogTable { dfs, rootdir }
    }

    fn root_file(&self) -> PathBuf {
        self.rootdir.join(ROOT_TABLE_NAME).join(CATALOG_FILE_NAME)
    }

    fn meta_file(&self) -> PathBuf {
        self.rootdir.join(META_TABLE_NAME).join(CATALOG_FILE_NAME)
    }

    /// Directory holding one region's store files.
    pub fn region_dir(&self, region: &RegionInfo) -> PathBuf {
        self.rootdir
            .join(region.table_name())
            .join(region.region_id.to_string())
    }

    /// Whether the root catalog region has been bootstrapped.
    pub async fn root_exists(&self) -> Result<bool, RangemasterError> {
        self.dfs.exists(&self.root_file()).await
    }

    /// Fresh-cluster bootstrap: creates the root region (holding one row
    /// for the first META region) and the empty META region.
    pub async fn bootstrap(&self) -> Result<(), RangemasterError> {
        pf_info!("m"; "bootstrap: creating root and first META regions");
        let root = RegionInfo::root();
        let first_meta = RegionInfo::first_meta();
        self.create_region_dir(&root).await?;
        self.create_region_dir(&first_meta).await?;

        let mut root_rows = BTreeMap::new();
        root_rows.insert(
            first_meta.region_name(),
            CatalogRow::undeployed(first_meta),
        );
        self.save_rows(&self.root_file(), &root_rows).await?;
        self.save_rows(&self.meta_file(), &BTreeMap::new()).await?;
        Ok(())
    }

    async fn load_rows(
        &self,
        file: &PathBuf,
    ) -> Result<BTreeMap<String, CatalogRow>, RangemasterError> {
        if !self.dfs.exists(file).await? {
            return Ok(BTreeMap::new());
        }
        let bytes = self.dfs.read_file(file).await?;
        let mut rows: BTreeMap<String, CatalogRow> =
            rmp_serde::decode::from_slice(&bytes)?;

        // rows whose key disagrees with their region identity are damaged
        // leftovers; drop them from the snapshot
        let broken: Vec<String> = rows
            .iter()
            .filter(|(name, row)| **name != row.region.region_name())
            .map(|(name, _)| name.clone())
            .collect();
        if !broken.is_empty() {
            for name in &broken {
                pf_warn!("m"; "removed damaged catalog row '{}'", name);
                rows.remove(name);
            }
            self.save_rows(file, &rows).await?;
        }
        Ok(rows)
    }

    async fn save_rows(
        &self,
        file: &PathBuf,
        rows: &BTreeMap<String, CatalogRow>,
    ) -> Result<(), RangemasterError> {
        let bytes = rmp_serde::encode::to_vec(rows)?;
        self.dfs.write_file(file, &bytes).await
    }

    /// Creates a region's store directory with its identity marker file
    /// (consumed by the locality scan).
    async fn create_region_dir(
        &self,
        region: &RegionInfo,
    ) -> Result<(), RangemasterError> {
        let dir = self.region_dir(region);
        self.dfs.mkdirs(&dir).await?;
        let bytes = rmp_serde::encode::to_vec(region)?;
        self.dfs
            .write_file(&dir.join(REGIONINFO_FILE_NAME), &bytes)
            .await
    }

    fn file_for(&self, region: &RegionInfo) -> PathBuf {
        if region.is_meta() {
            self.root_file()
        } else {
            self.meta_file()
        }
    }

    /// Scans the root table: rows locating META regions.
    pub async fn scan_root(
        &self,
    ) -> Result<Vec<CatalogRow>, RangemasterError> {
        Ok(self
            .load_rows(&self.root_file())
            .await?
            .into_values()
            .collect())
    }

    /// Scans the META table, optionally bounded to rows whose region name
    /// starts with `prefix`.
    pub async fn scan_meta(
        &self,
        prefix: Option<&str>,
    ) -> Result<Vec<CatalogRow>, RangemasterError> {
        let rows = self.load_rows(&self.meta_file()).await?;
        Ok(rows
            .into_iter()
            .filter(|(name, _)| {
                prefix.map(|p| name.starts_with(p)).unwrap_or(true)
            })
            .map(|(_, row)| row)
            .collect())
    }

    /// All rows of one user table, in key order.
    pub async fn regions_of_table(
        &self,
        table: &str,
    ) -> Result<Vec<CatalogRow>, RangemasterError> {
        let mut rows = self
            .scan_meta(Some(&format!("{},", table)))
            .await?;
        rows.sort_by(|a, b| a.region.start_key.cmp(&b.region.start_key));
        Ok(rows)
    }

    /// Looks up one row by region name (META first, then root).
    pub async fn get_row(
        &self,
        region_name: &str,
    ) -> Result<Option<CatalogRow>, RangemasterError> {
        if let Some(row) =
            self.load_rows(&self.meta_file()).await?.remove(region_name)
        {
            return Ok(Some(row));
        }
        Ok(self
            .load_rows(&self.root_file())
            .await?
            .remove(region_name))
    }

    /// Inserts (or replaces) rows for the given regions, undeployed, and
    /// creates their region directories.
    pub async fn insert_regions(
        &self,
        regions: &[RegionInfo],
    ) -> Result<(), RangemasterError> {
        for region in regions {
            let file = self.file_for(region);
            let mut rows = self.load_rows(&file).await?;
            rows.insert(
                region.region_name(),
                CatalogRow::undeployed(region.clone()),
            );
            self.save_rows(&file, &rows).await?;
            self.create_region_dir(region).await?;
        }
        Ok(())
    }

    /// Removes a region's row and its store directory.
    pub async fn remove_region(
        &self,
        region: &RegionInfo,
    ) -> Result<(), RangemasterError> {
        let file = self.file_for(region);
        let mut rows = self.load_rows(&file).await?;
        rows.remove(&region.region_name());
        self.save_rows(&file, &rows).await?;
        let dir = self.region_dir(region);
        if self.dfs.exists(&dir).await? {
            self.dfs.remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Records (or with `None`, wipes) a region's deployment columns.
    pub async fn update_location(
        &self,
        region: &RegionInfo,
        location: Option<(&str, u64)>,
    ) -> Result<(), RangemasterError> {
        let file = self.file_for(region);
        let mut rows = self.load_rows(&file).await?;
        match rows.get_mut(&region.region_name()) {
            Some(row) => {
                row.server = location.map(|(s, _)| s.to_string());
                row.start_code = location.map(|(_, c)| c);
            }
            None => {
                return Err(RangemasterError::msg(format!(
                    "no catalog row for region '{}'",
                    region.region_name()
                )));
            }
        }
        self.save_rows(&file, &rows).await
    }

    /// Rewrites the schema snapshot of every region of a user table.
    /// Returns the updated regions.
    pub async fn update_table_schema(
        &self,
        table: &str,
        schema: &crate::catalog::region::TableSchema,
    ) -> Result<Vec<RegionInfo>, RangemasterError> {
        let file = self.meta_file();
        let mut rows = self.load_rows(&file).await?;
        let mut updated = vec![];
        for row in rows.values_mut() {
            if row.region.table_name() == table {
                row.region.schema = schema.clone();
                updated.push(row.region.clone());
            }
        }
        self.save_rows(&file, &rows).await?;
        for region in &updated {
            let bytes = rmp_serde::encode::to_vec(region)?;
            self.dfs
                .write_file(
                    &self.region_dir(region).join(REGIONINFO_FILE_NAME),
                    &bytes,
                )
                .await?;
        }
        Ok(updated)
    }

    /// Flips a region's offline marker in its row (and schema snapshot).
    pub async fn set_offline(
        &self,
        region: &RegionInfo,
        offline: bool,
    ) -> Result<(), RangemasterError> {
        let file = self.file_for(region);
        let mut rows = self.load_rows(&file).await?;
        match rows.get_mut(&region.region_name()) {
            Some(row) => {
                row.region.offline = offline;
                if offline {
                    row.server = None;
                    row.start_code = None;
                }
            }
            None => {
                return Err(RangemasterError::msg(format!(
                    "no catalog row for region '{}'",
                    region.region_name()
                )));
            }
        }
        self.save_rows(&file, &rows).await
    }
}

#[cfg(test)]
mod table_tests {
    use super::*;
    use crate::catalog::region::TableSchema;
    use crate::dfs::LocalDfs;

    fn catalog_in(tmp: &tempfile::TempDir) -> CatalogTable {
        CatalogTable::new(
            Arc::new(LocalDfs::default()),
            tmp.path().to_path_buf(),
        )
    }

    #[tokio::test]
    async fn bootstrap_creates_catalog() -> Result<(), RangemasterError> {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = catalog_in(&tmp);
        assert!(!catalog.root_exists().await?);
        catalog.bootstrap().await?;
        assert!(catalog.root_exists().await?);

        let metas = catalog.scan_root().await?;
        assert_eq!(metas.len(), 1);
        assert!(metas[0].region.is_meta());
        assert_eq!(metas[0].server, None);
        assert_eq!(catalog.scan_meta(None).await?.len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn insert_update_remove() -> Result<(), RangemasterError> {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = catalog_in(&tmp);
        catalog.bootstrap().await?;

        let region = RegionInfo::new(
            TableSchema::new("t"),
            vec![],
            b"m".to_vec(),
            100,
        );
        catalog.insert_regions(std::slice::from_ref(&region)).await?;
        assert_eq!(catalog.scan_meta(Some("t,")).await?.len(), 1);

        catalog
            .update_location(&region, Some(("rs1:7001", 17)))
            .await?;
        let row = catalog
            .get_row(&region.region_name())
            .await?
            .unwrap();
        assert_eq!(row.server.as_deref(), Some("rs1:7001"));
        assert_eq!(row.start_code, Some(17));

        catalog.update_location(&region, None).await?;
        let row = catalog
            .get_row(&region.region_name())
            .await?
            .unwrap();
        assert_eq!(row.server, None);

        catalog.remove_region(&region).await?;
        assert_eq!(catalog.scan_meta(Some("t,")).await?.len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn offline_marker_wipes_location() -> Result<(), RangemasterError>
    {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = catalog_in(&tmp);
        catalog.bootstrap().await?;
        let region = RegionInfo::new(
            TableSchema::new("t"),
            vec![],
            vec![],
            7,
        );
        catalog.insert_regions(std::slice::from_ref(&region)).await?;
        catalog
            .update_location(&region, Some(("rs1:7001", 3)))
            .await?;
        catalog.set_offline(&region, true).await?;
        let row = catalog
            .get_row(&region.region_name())
            .await?
            .unwrap();
        assert!(row.region.offline);
        assert_eq!(row.server, None);
        Ok(())
    }
}
