//! Region identity and table schema types.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Row/boundary key type. An empty key means -inf as a start bound and +inf
/// as an end bound.
pub type Key = Vec<u8>;

/// Name of the root catalog table (locations of META regions).
pub const ROOT_TABLE_NAME: &str = "-ROOT-";

/// Name of the META catalog table (locations of user regions).
pub const META_TABLE_NAME: &str = ".META.";

/// Renders a key for logs and region names (lowercase hex).
pub fn key_display(key: &[u8]) -> String {
    key.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Per-column-family schema: a name plus free-form attributes (compression,
/// block cache, TTL, ...) the region servers interpret.
#[derive(
    Debug, PartialEq, Eq, Clone, Serialize, Deserialize, Default,
)]
pub struct FamilySchema {
    /// Family name.
    pub name: String,

    /// Attribute map, e.g. "compression" -> "lzo".
    pub attrs: BTreeMap<String, String>,
}

impl FamilySchema {
    /// Creates a family schema with no attributes.
    pub fn new(name: impl Into<String>) -> Self {
        FamilySchema {
            name: name.into(),
            attrs: BTreeMap::new(),
        }
    }
}

/// Schema of one table, snapshotted into each of its regions.
#[derive(
    Debug, PartialEq, Eq, Clone, Serialize, Deserialize, Default,
)]
pub struct TableSchema {
    /// Table name.
    pub name: String,

    /// Column families, in creation order.
    pub families: Vec<FamilySchema>,

    /// Per-region store file size threshold that triggers splits.
    pub max_file_size: u64,
}

impl TableSchema {
    /// Creates a schema with a single default "info" family.
    pub fn new(name: impl Into<String>) -> Self {
        TableSchema {
            name: name.into(),
            families: vec![FamilySchema::new("info")],
            max_file_size: 256 * 1024 * 1024,
        }
    }
}

/// Immutable identity of one region: the owning table's schema snapshot, the
/// half-open key range `[start_key, end_key)`, and a creation timestamp ID
/// distinguishing regions that reuse a boundary after splits.
#[derive(
    Debug, PartialEq, Eq, Clone, Serialize, Deserialize, Default,
)]
pub struct RegionInfo {
    /// Snapshot of the owning table's schema.
    pub schema: TableSchema,

    /// Inclusive start key; empty means -inf.
    pub start_key: Key,

    /// Exclusive end key; empty means +inf.
    pub end_key: Key,

    /// Region ID, unique within the table.
    pub region_id: u64,

    /// True once the region has been taken offline (disabled table or
    /// split parent); offline regions are not assigned.
    pub offline: bool,
}

impl RegionInfo {
    /// Creates a region of the given table over `[start_key, end_key)`.
    pub fn new(
        schema: TableSchema,
        start_key: Key,
        end_key: Key,
        region_id: u64,
    ) -> Self {
        RegionInfo {
            schema,
            start_key,
            end_key,
            region_id,
            offline: false,
        }
    }

    /// The singleton root region.
    pub fn root() -> Self {
        RegionInfo::new(TableSchema::new(ROOT_TABLE_NAME), vec![], vec![], 0)
    }

    /// The first META region of a fresh cluster.
    pub fn first_meta() -> Self {
        RegionInfo::new(TableSchema::new(META_TABLE_NAME), vec![], vec![], 1)
    }

    /// Name of the owning table.
    pub fn table_name(&self) -> &str {
        &self.schema.name
    }

    /// Unique region name: `<table>,<start_key hex>,<region_id>`.
    pub fn region_name(&self) -> String {
        format!(
            "{},{},{}",
            self.schema.name,
            key_display(&self.start_key),
            self.region_id
        )
    }

    /// True for the root region.
    pub fn is_root(&self) -> bool {
        self.schema.name == ROOT_TABLE_NAME
    }

    /// True for META regions.
    pub fn is_meta(&self) -> bool {
        self.schema.name == META_TABLE_NAME
    }

    /// True for either catalog table's regions.
    pub fn is_catalog(&self) -> bool {
        self.is_root() || self.is_meta()
    }

    /// Whether `row` falls inside this region's key range.
    pub fn contains_row(&self, row: &[u8]) -> bool {
        (self.start_key.is_empty() || row >= self.start_key.as_slice())
            && (self.end_key.is_empty() || row < self.end_key.as_slice())
    }
}

impl fmt::Display for RegionInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} [{}, {})",
            self.region_name(),
            key_display(&self.start_key),
            key_display(&self.end_key)
        )
    }
}

#[cfg(test)]
mod region_tests {
    use super::*;

    #[test]
    fn region_names() {
        assert_eq!(RegionInfo::root().region_name(), "-ROOT-,,0");
        assert_eq!(RegionInfo::first_meta().region_name(), ".META.,,1");
        let r = RegionInfo::new(
            TableSchema::new("t"),
            b"g".to_vec(),
            b"m".to_vec(),
            42,
        );
        assert_eq!(r.region_name(), "t,67,42");
    }

    #[test]
    fn catalog_flags() {
        assert!(RegionInfo::root().is_root());
        assert!(RegionInfo::root().is_catalog());
        assert!(!RegionInfo::root().is_meta());
        assert!(RegionInfo::first_meta().is_meta());
        assert!(!RegionInfo::first_meta().is_root());
    }

    #[test]
    fn contains_row_bounds() {
        let r = RegionInfo::new(
            TableSchema::new("t"),
            b"a".to_vec(),
            b"m".to_vec(),
            1,
        );
        assert!(r.contains_row(b"a"));
        assert!(r.contains_row(b"g"));
        assert!(!r.contains_row(b"m"));
        assert!(!r.contains_row(b"z"));
        assert!(!r.contains_row(b"0"));

        let unbounded = RegionInfo::new(
            TableSchema::new("t"),
            vec![],
            vec![],
            2,
        );
        assert!(unbounded.contains_row(b""));
        assert!(unbounded.contains_row(b"anything"));
    }
}
