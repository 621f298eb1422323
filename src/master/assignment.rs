//! Authoritative in-memory region assignment table and its state machine.
//! Persisted locations live in the catalog; this table is what the main
//! loop consults and mutates.

use std::collections::HashMap;

use rand::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

use crate::catalog::RegionInfo;
use crate::master::registry::ServerName;
use crate::utils::RangemasterError;

/// Assignment state of one region.
///
/// ```text
/// Unassigned --assign(s)--> PendingOpen(s) --opened--> Open(s)
/// Open(s)   --close-req--> PendingClose(s) --closed--> Closed -> Unassigned
/// Open(s)   --split-done--> Splitting -> (parent removed, daughters
///                                         Unassigned)
/// any       --offline--> Offline (admin-disabled table)
/// ```
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize,
)]
pub enum RegionState {
    Unassigned,
    PendingOpen,
    Open,
    PendingClose,
    Closed,
    Offline,
    Splitting,
}

impl RegionState {
    /// States that bind the region to a server.
    pub fn is_bound(&self) -> bool {
        matches!(
            self,
            RegionState::PendingOpen
                | RegionState::Open
                | RegionState::PendingClose
        )
    }

    /// States reported as "in transition" in cluster status.
    pub fn in_transition(&self) -> bool {
        !matches!(self, RegionState::Open | RegionState::Offline)
    }
}

/// One region's assignment entry.
#[derive(Debug, Clone)]
pub struct AssignmentEntry {
    /// The region.
    pub region: RegionInfo,

    /// Current state.
    pub state: RegionState,

    /// Bound server for states that have one.
    pub server: Option<ServerName>,

    /// When the current state was entered.
    pub since: Instant,

    /// Open attempts since the last successful open.
    pub attempts: u32,

    /// Not eligible for re-assignment before this instant (backoff after a
    /// lost directive).
    pub retry_at: Option<Instant>,
}

/// The assignment table: exactly one entry per existing region, so at most
/// one binding of any region to a server can exist at any instant.
#[derive(Debug, Default)]
pub struct AssignmentTable {
    entries: HashMap<String, AssignmentEntry>,
}

fn illegal(
    region_name: &str,
    state: RegionState,
    wanted: &str,
) -> RangemasterError {
    RangemasterError::IllegalAssignmentTransition(format!(
        "{}: {:?} -> {}",
        region_name, state, wanted
    ))
}

impl AssignmentTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an entry for a region coming into existence. Regions flagged
    /// offline enter as `Offline`, others as `Unassigned`. No-op if an
    /// entry already exists.
    pub fn insert(&mut self, region: RegionInfo, now: Instant) {
        let name = region.region_name();
        self.entries.entry(name).or_insert_with(|| AssignmentEntry {
            state: if region.offline {
                RegionState::Offline
            } else {
                RegionState::Unassigned
            },
            region,
            server: None,
            since: now,
            attempts: 0,
            retry_at: None,
        });
    }

    /// Adopts a region as already `Open` on a server, bypassing the open
    /// handshake. Failover path only: the binding was inherited from the
    /// previous master, not created by this one.
    pub fn adopt_open(
        &mut self,
        region: RegionInfo,
        server: &str,
        now: Instant,
    ) {
        let name = region.region_name();
        self.entries.insert(
            name,
            AssignmentEntry {
                region,
                state: RegionState::Open,
                server: Some(server.to_string()),
                since: now,
                attempts: 0,
                retry_at: None,
            },
        );
    }

    /// Destroys a region's entry (region deleted from the catalog).
    pub fn remove(&mut self, region_name: &str) -> Option<AssignmentEntry> {
        self.entries.remove(region_name)
    }

    /// Looks up a region's entry.
    pub fn get(&self, region_name: &str) -> Option<&AssignmentEntry> {
        self.entries.get(region_name)
    }

    /// Whether a region is `Open` (optionally on a specific server).
    pub fn is_open(&self, region_name: &str) -> bool {
        self.entries
            .get(region_name)
            .map(|e| e.state == RegionState::Open)
            .unwrap_or(false)
    }

    /// `Unassigned -> PendingOpen(server)`.
    pub fn assign(
        &mut self,
        region_name: &str,
        server: &str,
        now: Instant,
    ) -> Result<(), RangemasterError> {
        let entry = self.entry_mut(region_name)?;
        if entry.state != RegionState::Unassigned {
            return Err(illegal(region_name, entry.state, "PendingOpen"));
        }
        entry.state = RegionState::PendingOpen;
        entry.server = Some(server.to_string());
        entry.since = now;
        Ok(())
    }

    /// `PendingOpen(server) -> Open(server)`. Duplicate opened reports from
    /// the bound server are tolerated.
    pub fn opened(
        &mut self,
        region_name: &str,
        server: &str,
        now: Instant,
    ) -> Result<(), RangemasterError> {
        let entry = self.entry_mut(region_name)?;
        let bound = entry.server.as_deref() == Some(server);
        match entry.state {
            RegionState::PendingOpen if bound => {
                entry.state = RegionState::Open;
                entry.since = now;
                entry.attempts = 0;
                entry.retry_at = None;
                Ok(())
            }
            RegionState::Open if bound => Ok(()), // duplicate report
            state => Err(illegal(region_name, state, "Open")),
        }
    }

    /// `Open(server) -> PendingClose(server)`.
    pub fn request_close(
        &mut self,
        region_name: &str,
        now: Instant,
    ) -> Result<ServerName, RangemasterError> {
        let entry = self.entry_mut(region_name)?;
        if entry.state != RegionState::Open {
            return Err(illegal(region_name, entry.state, "PendingClose"));
        }
        entry.state = RegionState::PendingClose;
        entry.since = now;
        Ok(entry.server.clone().unwrap())
    }

    /// `PendingClose -> Closed`, immediately recycled to `Unassigned` (or
    /// `Offline` if the region was explicitly offlined, which suppresses
    /// re-assignment). Returns the final state.
    pub fn closed(
        &mut self,
        region_name: &str,
        now: Instant,
    ) -> Result<RegionState, RangemasterError> {
        let entry = self.entry_mut(region_name)?;
        if entry.state != RegionState::PendingClose {
            return Err(illegal(region_name, entry.state, "Closed"));
        }
        entry.state = if entry.region.offline {
            RegionState::Offline
        } else {
            RegionState::Unassigned
        };
        entry.server = None;
        entry.since = now;
        Ok(entry.state)
    }

    /// `Open -> Splitting` upon a server-reported split; the parent is then
    /// removed and both daughters inserted `Unassigned`.
    pub fn split_done(
        &mut self,
        parent_name: &str,
        daughters: (RegionInfo, RegionInfo),
        now: Instant,
    ) -> Result<(), RangemasterError> {
        let entry = self.entry_mut(parent_name)?;
        if entry.state != RegionState::Open {
            return Err(illegal(parent_name, entry.state, "Splitting"));
        }
        entry.state = RegionState::Splitting;
        self.entries.remove(parent_name);
        self.insert(daughters.0, now);
        self.insert(daughters.1, now);
        Ok(())
    }

    /// `any -> Offline`: explicit offlining during table disable. Sets the
    /// region's offline flag so later closes stay offline.
    pub fn offline(
        &mut self,
        region_name: &str,
        now: Instant,
    ) -> Result<(), RangemasterError> {
        let entry = self.entry_mut(region_name)?;
        entry.region.offline = true;
        if !entry.state.is_bound() {
            entry.state = RegionState::Offline;
            entry.server = None;
            entry.since = now;
        }
        // bound regions go offline when their close comes back
        Ok(())
    }

    /// Re-enables an offline region for assignment.
    pub fn set_enabled(
        &mut self,
        region_name: &str,
        now: Instant,
    ) -> Result<(), RangemasterError> {
        let entry = self.entry_mut(region_name)?;
        entry.region.offline = false;
        if entry.state == RegionState::Offline {
            entry.state = RegionState::Unassigned;
            entry.since = now;
        }
        Ok(())
    }

    /// Replaces a region's info (schema changes) without touching its
    /// assignment state.
    pub fn update_region_info(&mut self, region: RegionInfo) {
        if let Some(entry) = self.entries.get_mut(&region.region_name()) {
            entry.region = region;
        }
    }

    /// Forcibly returns a region to `Unassigned`; used when a directive is
    /// known lost or an admin clears a stuck transition.
    pub fn clear_in_transition(&mut self, region_name: &str, now: Instant) {
        if let Some(entry) = self.entries.get_mut(region_name) {
            entry.state = RegionState::Unassigned;
            entry.server = None;
            entry.since = now;
            entry.retry_at = None;
        }
    }

    /// Reverts `PendingOpen` entries older than `timeout` back to
    /// `Unassigned` with capped exponential backoff. Returns the reverted
    /// region names.
    pub fn revert_timed_out(
        &mut self,
        now: Instant,
        timeout: Duration,
        backoff_base: Duration,
        backoff_cap: u32,
    ) -> Vec<String> {
        let mut reverted = vec![];
        for (name, entry) in self.entries.iter_mut() {
            if entry.state == RegionState::PendingOpen
                && now.duration_since(entry.since) > timeout
            {
                entry.state = RegionState::Unassigned;
                entry.server = None;
                entry.since = now;
                entry.attempts += 1;
                let exp = entry.attempts.min(backoff_cap);
                let backoff = backoff_base * 2u32.pow(exp);
                // +-20% jitter to avoid thundering retries
                let jitter =
                    thread_rng().gen_range(0.8_f64..1.2_f64);
                entry.retry_at =
                    Some(now + backoff.mul_f64(jitter));
                reverted.push(name.clone());
            }
        }
        reverted
    }

    /// Regions bound to a server (for failover inspection and death
    /// handling).
    pub fn regions_of(&self, server: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                e.state.is_bound() && e.server.as_deref() == Some(server)
            })
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    /// Unbinds every region held by a dead server, returning the region
    /// names now `Unassigned`.
    pub fn server_died(&mut self, server: &str, now: Instant) -> Vec<String> {
        let names = self.regions_of(server);
        for name in &names {
            let entry = self.entries.get_mut(name).unwrap();
            entry.state = if entry.region.offline {
                RegionState::Offline
            } else {
                RegionState::Unassigned
            };
            entry.server = None;
            entry.since = now;
            entry.retry_at = None;
        }
        names
    }

    /// Snapshot of regions in transition, for cluster status.
    pub fn in_transition(&self) -> Vec<(String, RegionState)> {
        let mut snapshot: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state.in_transition())
            .map(|(n, e)| (n.clone(), e.state))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    /// `Unassigned` regions eligible for assignment now (backoff elapsed).
    pub fn unassigned_ready(&self, now: Instant) -> Vec<AssignmentEntry> {
        let mut ready: Vec<_> = self
            .entries
            .values()
            .filter(|e| {
                e.state == RegionState::Unassigned
                    && e.retry_at.map(|t| t <= now).unwrap_or(true)
            })
            .cloned()
            .collect();
        ready.sort_by_key(|e| e.region.region_name());
        ready
    }

    /// All entries of one table.
    pub fn entries_of_table(&self, table: &str) -> Vec<&AssignmentEntry> {
        let mut entries: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.region.table_name() == table)
            .collect();
        entries.sort_by_key(|e| e.region.start_key.clone());
        entries
    }

    fn entry_mut(
        &mut self,
        region_name: &str,
    ) -> Result<&mut AssignmentEntry, RangemasterError> {
        self.entries.get_mut(region_name).ok_or_else(|| {
            RangemasterError::msg(format!(
                "region '{}' has no assignment entry",
                region_name
            ))
        })
    }
}

#[cfg(test)]
mod assignment_tests {
    use super::*;
    use crate::catalog::TableSchema;

    fn region(table: &str, start: &[u8], end: &[u8], id: u64) -> RegionInfo {
        RegionInfo::new(
            TableSchema::new(table),
            start.to_vec(),
            end.to_vec(),
            id,
        )
    }

    #[test]
    fn open_lifecycle() -> Result<(), RangemasterError> {
        let mut table = AssignmentTable::new();
        let now = Instant::now();
        let r = region("t", b"", b"m", 1);
        let name = r.region_name();
        table.insert(r, now);

        table.assign(&name, "rs1,7001,1", now)?;
        assert_eq!(table.get(&name).unwrap().state, RegionState::PendingOpen);
        // opened by the wrong server is illegal
        assert!(matches!(
            table.opened(&name, "rs2,7001,1", now),
            Err(RangemasterError::IllegalAssignmentTransition(_))
        ));
        table.opened(&name, "rs1,7001,1", now)?;
        assert!(table.is_open(&name));
        // duplicate opened report tolerated
        table.opened(&name, "rs1,7001,1", now)?;

        let holder = table.request_close(&name, now)?;
        assert_eq!(holder, "rs1,7001,1");
        assert_eq!(table.closed(&name, now)?, RegionState::Unassigned);
        Ok(())
    }

    #[test]
    fn illegal_transitions_rejected() {
        let mut table = AssignmentTable::new();
        let now = Instant::now();
        let r = region("t", b"", b"", 1);
        let name = r.region_name();
        table.insert(r, now);

        // cannot open or close an unassigned region
        assert!(table.opened(&name, "rs1,7001,1", now).is_err());
        assert!(table.request_close(&name, now).is_err());
        assert!(table.closed(&name, now).is_err());
        // double assignment is illegal: at most one binding at a time
        table.assign(&name, "rs1,7001,1", now).unwrap();
        assert!(table.assign(&name, "rs2,7001,1", now).is_err());
    }

    #[test]
    fn offline_suppresses_reassignment() -> Result<(), RangemasterError> {
        let mut table = AssignmentTable::new();
        let now = Instant::now();
        let r = region("t", b"", b"", 1);
        let name = r.region_name();
        table.insert(r, now);
        table.assign(&name, "rs1,7001,1", now)?;
        table.opened(&name, "rs1,7001,1", now)?;

        // disable while open: offline flag set, close completes to Offline
        table.offline(&name, now)?;
        assert_eq!(table.get(&name).unwrap().state, RegionState::Open);
        table.request_close(&name, now)?;
        assert_eq!(table.closed(&name, now)?, RegionState::Offline);
        assert!(table.unassigned_ready(now).is_empty());

        // re-enable: back to Unassigned
        table.set_enabled(&name, now)?;
        assert_eq!(table.unassigned_ready(now).len(), 1);
        Ok(())
    }

    #[test]
    fn split_replaces_parent_with_daughters(
    ) -> Result<(), RangemasterError> {
        let mut table = AssignmentTable::new();
        let now = Instant::now();
        let parent = region("t", b"a", b"m", 1);
        let parent_name = parent.region_name();
        table.insert(parent, now);
        table.assign(&parent_name, "rs1,7001,1", now)?;
        table.opened(&parent_name, "rs1,7001,1", now)?;

        let d1 = region("t", b"a", b"g", 2);
        let d2 = region("t", b"g", b"m", 3);
        table.split_done(&parent_name, (d1.clone(), d2.clone()), now)?;
        assert!(table.get(&parent_name).is_none());
        let ready = table.unassigned_ready(now);
        assert_eq!(ready.len(), 2);
        assert_eq!(table.in_transition().len(), 2);
        Ok(())
    }

    #[test]
    fn server_death_unbinds_regions() -> Result<(), RangemasterError> {
        let mut table = AssignmentTable::new();
        let now = Instant::now();
        for i in 0..5 {
            let r = region("t", &[i], &[i + 1], i as u64);
            let name = r.region_name();
            table.insert(r, now);
            table.assign(&name, "rs1,7001,1", now)?;
            table.opened(&name, "rs1,7001,1", now)?;
        }
        assert_eq!(table.regions_of("rs1,7001,1").len(), 5);
        let freed = table.server_died("rs1,7001,1", now);
        assert_eq!(freed.len(), 5);
        assert_eq!(table.unassigned_ready(now).len(), 5);
        assert!(table.regions_of("rs1,7001,1").is_empty());
        Ok(())
    }

    #[test]
    fn timed_out_directives_revert_with_backoff(
    ) -> Result<(), RangemasterError> {
        let mut table = AssignmentTable::new();
        let now = Instant::now();
        let r = region("t", b"", b"", 1);
        let name = r.region_name();
        table.insert(r, now);
        table.assign(&name, "rs1,7001,1", now)?;

        let later = now + Duration::from_secs(31);
        let reverted = table.revert_timed_out(
            later,
            Duration::from_secs(30),
            Duration::from_secs(3),
            3,
        );
        assert_eq!(reverted, vec![name.clone()]);
        let entry = table.get(&name).unwrap();
        assert_eq!(entry.state, RegionState::Unassigned);
        assert_eq!(entry.attempts, 1);
        // held back by backoff right now, eligible after it elapses
        assert!(table.unassigned_ready(later).is_empty());
        assert_eq!(
            table
                .unassigned_ready(later + Duration::from_secs(10))
                .len(),
            1
        );
        Ok(())
    }
}
