//! Message contracts of both RPC surfaces: region-server-facing (startup
//! handshake and heartbeat) and admin-facing (table DDL and cluster
//! control). Every operation tag carries its own typed payload.

use serde::{Deserialize, Serialize};

use crate::catalog::{FamilySchema, Key, RegionInfo, TableSchema};
use crate::master::{RegionState, ServerInfo};
use crate::utils::RangemasterError;

/// Request from a region server to the master.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum RsRequest {
    /// First message of a fresh incarnation.
    Startup { info: ServerInfo },

    /// Periodic heartbeat: current load, state-change notifications since
    /// the last report, and the server's busiest regions.
    Report {
        info: ServerInfo,
        msgs: Vec<RsMsg>,
        hot_regions: Vec<RegionInfo>,
    },
}

/// State-change notification piggybacked on a heartbeat.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum RsMsg {
    /// The server finished opening a region.
    RegionOpened { region: RegionInfo },

    /// The server finished closing a region.
    RegionClosed { region: RegionInfo },

    /// The server split a region into two daughters.
    RegionSplit {
        parent: RegionInfo,
        daughter_a: RegionInfo,
        daughter_b: RegionInfo,
    },
}

/// Configuration subset handed to a starting region server.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ConfigSubset {
    /// Cluster root directory.
    pub rootdir: String,

    /// File system to mount.
    pub fs_name: String,

    /// The server's public address as observed by the master on the
    /// startup socket.
    pub observed_host: String,
}

/// Master reply to a region server.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum RsReply {
    /// Startup accepted; here is your configuration.
    StartupAck { config: ConfigSubset },

    /// Heartbeat reply: directives to execute.
    Directives { directives: Vec<Directive> },

    /// Request-level failure.
    Error { error: RangemasterError },
}

/// Instruction piggybacked on a heartbeat reply.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum Directive {
    /// Open and serve this region.
    OpenRegion { region: RegionInfo },

    /// Close this region.
    CloseRegion { region: RegionInfo },

    /// Split this region, at the given point if any.
    SplitRegion {
        region: RegionInfo,
        split_point: Option<Key>,
    },

    /// Compact this region.
    CompactRegion { region: RegionInfo, major: bool },

    /// Flush this region's memstore.
    FlushRegion { region: RegionInfo },

    /// The master does not know this incarnation; re-run startup.
    CallServerStartup,

    /// Cluster is draining and the server holds nothing; exit.
    ShutdownServer,
}

/// Region-or-table-scoped admin action dispatched through `modify_table`.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum TableAction {
    /// Ask servers to split; whole table, or just the region holding `row`.
    Split { row: Option<Key> },

    /// Ask servers to compact.
    Compact { row: Option<Key>, major: bool },

    /// Ask servers to flush.
    Flush { row: Option<Key> },

    /// Split the region containing `split_point` exactly there.
    ExplicitSplit { split_point: Key },

    /// Close a region and re-open it on the given host.
    MoveRegion { region_name: String, host: String },

    /// Close a region (optionally naming the server believed to hold it).
    CloseRegion {
        region_name: String,
        server: Option<String>,
    },
}

/// Admin request to the master.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum AdminRequest {
    /// Liveness probe.
    IsMasterRunning,

    /// Create a table pre-split at the given keys (N keys -> N+1 regions).
    CreateTable {
        schema: TableSchema,
        split_keys: Vec<Key>,
    },

    /// Delete a table and all its regions.
    DeleteTable { table: String },

    /// Re-enable a disabled table's regions for assignment.
    EnableTable { table: String },

    /// Take a table's regions offline.
    DisableTable { table: String },

    /// Alter a table's column families, then reopen its regions.
    AlterTable {
        table: String,
        adds: Vec<FamilySchema>,
        mods: Vec<(String, FamilySchema)>,
        drops: Vec<String>,
    },

    /// Progress of an ongoing alter reopen.
    GetAlterStatus { table: String },

    /// Region/table maintenance actions.
    ModifyTable {
        table: String,
        action: TableAction,
    },

    /// Regions of a table with their current deployment.
    GetTableRegions { table: String },

    /// Cluster-wide status summary.
    GetClusterStatus,

    /// Begin cluster-wide drain and shutdown.
    Shutdown,

    /// Stop this master process only (a standby can take over).
    StopMaster,

    /// Client leave notification.
    Leave,
}

/// Cluster status summary.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    /// Master build version.
    pub version: String,

    /// Live servers with their loads.
    pub servers: Vec<ServerInfo>,

    /// Dead servers awaiting (or under) log recovery.
    pub dead_servers: Vec<String>,

    /// Regions currently in transition.
    pub regions_in_transition: Vec<(String, RegionState)>,

    /// Mean region count per live server.
    pub average_load: f64,
}

/// Admin reply from the master.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum AdminReply {
    MasterRunning { running: bool },
    TableCreated,
    TableDeleted,
    TableEnabled,
    TableDisabled,
    TableAltered,
    AlterStatus { pending: u32, total: u32 },
    Modified,
    ClusterStatus { status: Box<ClusterStatus> },
    TableRegions {
        regions: Vec<(RegionInfo, Option<String>)>,
    },
    ShuttingDown,
    Stopping,
    Error { error: RangemasterError },
    Leave,
}
