//! The master control plane: configuration, server registry, assignment
//! state machine, locality oracle, operation queue, assigner, log-split
//! driver, table DDL workflows, leader election, and the main loop.

mod assigner;
mod assignment;
mod election;
mod locality;
mod logsplit;
#[allow(clippy::module_inception)]
mod master;
mod metrics;
mod queue;
mod registry;
mod tableops;

pub use assigner::PreferredPlacement;
pub use assignment::{AssignmentEntry, AssignmentTable, RegionState};
pub use election::{elect, ElectionOutcome};
pub use locality::LocalityOracle;
pub use logsplit::LogSplitter;
pub use master::Master;
pub use metrics::{MasterMetrics, MetricsSnapshot};
pub use queue::{OperationItem, OperationQueue, ProcessOutcome, QueuedOp};
pub use registry::{ServerInfo, ServerLoad, ServerName, ServerRegistry};
pub use tableops::AlterProgress;

use tokio::time::Duration;

use crate::utils::RangemasterError;

/// Whether the master is serving, draining the cluster, or gone. Replaces
/// separate closed/shutdown-requested flags with one running state.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RunState {
    /// Normal operation.
    Running,

    /// Cluster shutdown requested; region servers are quiescing.
    Draining,

    /// Main loop exited (or is exiting at the next boundary).
    Closed,
}

/// Master configuration parameters. All durations are milliseconds.
#[derive(Debug, PartialEq, Clone)]
pub struct MasterConfig {
    /// Cluster root directory on the DFS.
    pub rootdir: String,

    /// Local scratch directory (locality snapshot lives here).
    pub tmp_dir: String,

    /// File system name handed to starting region servers.
    pub fs_name: String,

    /// Base path in the coordination store.
    pub coord_base: String,

    /// Started as a backup master: stall before contending for the lock.
    pub backup: bool,

    /// Minimum live region servers before user regions are assigned.
    pub min_servers: u32,

    /// Retry budget for transient failures (DDL retries, coord retries).
    pub num_retries: u32,

    /// Backoff sleep between retries.
    pub sleep_interval_ms: u64,

    /// Main loop wake frequency (queue pop timeout).
    pub thread_wake_frequency_ms: u64,

    /// A region server missing reports for this long is expired.
    pub rs_lease_timeout_ms: u64,

    /// Coordination store session timeout (election stall is 2x this).
    pub session_timeout_ms: u64,

    /// An open-region directive unacknowledged for this long is lost.
    pub assignment_timeout_ms: u64,

    /// Cap exponent for per-region assignment retry backoff.
    pub assignment_backoff_cap: u32,

    /// Preferred placements apply for this long after master startup.
    pub apply_preferred_period_ms: u64,

    /// How long a region may wait unassigned for its preferred server.
    pub hold_for_locality_period_ms: u64,

    /// Locality snapshot older than this is recomputed.
    pub locality_snapshot_validity_ms: u64,

    /// Parallelism of the locality DFS scan.
    pub locality_check_pool: u64,

    /// Operation queue capacity.
    pub queue_capacity: u64,

    /// Requeue attempts before an operation is declared failed.
    pub max_queue_attempts: u32,

    /// Max regions of one table in transition during an alter reopen.
    pub alter_reopen_throttle: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            rootdir: "/tmp/rangemaster/root".into(),
            tmp_dir: "/tmp/rangemaster/tmp".into(),
            fs_name: "file:///".into(),
            coord_base: "/rangemaster".into(),
            backup: false,
            min_servers: 1,
            num_retries: 2,
            sleep_interval_ms: 3_000,
            thread_wake_frequency_ms: 10_000,
            rs_lease_timeout_ms: 30_000,
            session_timeout_ms: 60_000,
            assignment_timeout_ms: 30_000,
            assignment_backoff_cap: 3,
            apply_preferred_period_ms: 5 * 60 * 1_000,
            hold_for_locality_period_ms: 60 * 1_000,
            locality_snapshot_validity_ms: 24 * 60 * 60 * 1_000,
            locality_check_pool: 5,
            queue_capacity: 1_024,
            max_queue_attempts: 5,
            alter_reopen_throttle: 8,
        }
    }
}

impl MasterConfig {
    /// Parses a config from defaults overridden by a TOML string.
    pub fn from_config_str(
        config_str: Option<&str>,
    ) -> Result<Self, RangemasterError> {
        parsed_config!(config_str => MasterConfig;
                       rootdir, tmp_dir, fs_name, coord_base, backup,
                       min_servers, num_retries, sleep_interval_ms,
                       thread_wake_frequency_ms, rs_lease_timeout_ms,
                       session_timeout_ms, assignment_timeout_ms,
                       assignment_backoff_cap, apply_preferred_period_ms,
                       hold_for_locality_period_ms,
                       locality_snapshot_validity_ms, locality_check_pool,
                       queue_capacity, max_queue_attempts,
                       alter_reopen_throttle)
    }

    pub fn sleep_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_interval_ms)
    }

    pub fn thread_wake_frequency(&self) -> Duration {
        Duration::from_millis(self.thread_wake_frequency_ms)
    }

    pub fn rs_lease_timeout(&self) -> Duration {
        Duration::from_millis(self.rs_lease_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn assignment_timeout(&self) -> Duration {
        Duration::from_millis(self.assignment_timeout_ms)
    }

    pub fn apply_preferred_period(&self) -> Duration {
        Duration::from_millis(self.apply_preferred_period_ms)
    }

    pub fn hold_for_locality_period(&self) -> Duration {
        Duration::from_millis(self.hold_for_locality_period_ms)
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn parse_overrides() -> Result<(), RangemasterError> {
        let config = MasterConfig::from_config_str(Some(
            "min_servers = 3\nbackup = true\nrootdir = '/data/rm'",
        ))?;
        assert_eq!(config.min_servers, 3);
        assert!(config.backup);
        assert_eq!(config.rootdir, "/data/rm");
        assert_eq!(config.num_retries, MasterConfig::default().num_retries);
        Ok(())
    }

    #[test]
    fn parse_rejects_unknown_field() {
        assert!(MasterConfig::from_config_str(Some("nope = 1")).is_err());
    }
}
