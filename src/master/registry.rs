//! Region server registry: live/dead servers, their loads and last-report
//! times, and the per-server directive mailboxes drained into heartbeat
//! replies.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

use crate::api::Directive;

/// `host,port,start_code` string uniquely naming one server incarnation.
pub type ServerName = String;

/// Reported load of one region server. The derived order (regions first,
/// then request rate, then store file size) is the load index order.
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
)]
pub struct ServerLoad {
    /// Number of regions served.
    pub regions: u32,

    /// Request rate since last report.
    pub requests_per_sec: u32,

    /// Total store file size in MB.
    pub storefile_size_mb: u64,
}

/// Identity and load of one region server incarnation.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Hostname as seen by the master.
    pub host: String,

    /// RPC port.
    pub port: u16,

    /// Startup timestamp distinguishing reincarnations on the same
    /// host:port.
    pub start_code: u64,

    /// Most recently reported load.
    pub load: ServerLoad,
}

impl ServerInfo {
    /// `host:port` address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Unique server name `host,port,start_code`.
    pub fn server_name(&self) -> ServerName {
        format!("{},{},{}", self.host, self.port, self.start_code)
    }
}

/// Builds a server name out of a `host:port` address and a start code.
pub fn server_name_of(addr: &str, start_code: u64) -> ServerName {
    format!("{},{}", addr.replacen(':', ",", 1), start_code)
}

/// Splits a server name back into its `host:port` address and start code.
pub fn split_server_name(name: &str) -> Option<(String, u64)> {
    let parts: Vec<&str> = name.split(',').collect();
    if parts.len() != 3 {
        return None;
    }
    let start_code = parts[2].parse().ok()?;
    Some((format!("{}:{}", parts[0], parts[1]), start_code))
}

/// Book-keeping for one live server.
#[derive(Debug)]
struct LiveServer {
    info: ServerInfo,
    last_report: Instant,
    /// Directives awaiting the server's next report.
    mailbox: Vec<Directive>,
}

/// The server registry. Maintains `by_name` and the ordered load multimap;
/// every name present in one index is present in the other.
#[derive(Debug, Default)]
pub struct ServerRegistry {
    by_name: HashMap<ServerName, LiveServer>,
    by_load: BTreeMap<ServerLoad, BTreeSet<ServerName>>,
    dead: BTreeSet<ServerName>,
}

impl ServerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn index_remove(&mut self, name: &str, load: &ServerLoad) {
        if let Some(set) = self.by_load.get_mut(load) {
            set.remove(name);
            if set.is_empty() {
                self.by_load.remove(load);
            }
        }
    }

    /// Registers a starting server. If another incarnation of the same
    /// host:port is currently live, that one is marked dead first and its
    /// name returned so the caller can queue its log recovery.
    pub fn record_startup(
        &mut self,
        info: ServerInfo,
        now: Instant,
    ) -> Option<ServerName> {
        let name = info.server_name();
        let stale = self
            .by_name
            .iter()
            .find(|(_, s)| {
                s.info.addr() == info.addr()
                    && s.info.start_code != info.start_code
            })
            .map(|(n, _)| n.clone());
        if let Some(old_name) = &stale {
            pf_info!("m"; "server '{}' reincarnated as '{}'", old_name, name);
            self.mark_dead(old_name);
        }

        self.dead.remove(&name);
        let load = info.load;
        let prior = self.by_name.insert(
            name.clone(),
            LiveServer {
                info,
                last_report: now,
                mailbox: vec![],
            },
        );
        if let Some(prior) = prior {
            self.index_remove(&name, &prior.info.load);
        }
        self.by_load.entry(load).or_default().insert(name);
        stale
    }

    /// Records a heartbeat: refreshes the lease, re-indexes the load, and
    /// drains the server's directive mailbox. `None` means the server is
    /// unknown (or already declared dead) and must re-run startup.
    pub fn record_report(
        &mut self,
        info: &ServerInfo,
        now: Instant,
    ) -> Option<Vec<Directive>> {
        let name = info.server_name();
        if !self.by_name.contains_key(&name) {
            return None;
        }
        let old_load = self.by_name[&name].info.load;
        if old_load != info.load {
            self.index_remove(&name, &old_load);
            self.by_load
                .entry(info.load)
                .or_default()
                .insert(name.clone());
        }
        let server = self.by_name.get_mut(&name).unwrap();
        server.info = info.clone();
        server.last_report = now;
        Some(std::mem::take(&mut server.mailbox))
    }

    /// Drains a live server's directive mailbox without touching its lease.
    pub fn drain_mailbox(&mut self, name: &str) -> Vec<Directive> {
        self.by_name
            .get_mut(name)
            .map(|s| std::mem::take(&mut s.mailbox))
            .unwrap_or_default()
    }

    /// Appends a directive to a live server's mailbox. Returns `false` if
    /// the server is not live.
    pub fn enqueue_directive(
        &mut self,
        name: &str,
        directive: Directive,
    ) -> bool {
        match self.by_name.get_mut(name) {
            Some(server) => {
                server.mailbox.push(directive);
                true
            }
            None => false,
        }
    }

    /// Moves a live server to the dead set. Returns `true` if it was live.
    pub fn mark_dead(&mut self, name: &str) -> bool {
        if let Some(server) = self.by_name.remove(name) {
            self.index_remove(name, &server.info.load);
            self.dead.insert(name.to_string());
            true
        } else {
            false
        }
    }

    /// Removes a quiesced server entirely (clean departure during drain).
    pub fn remove(&mut self, name: &str) -> bool {
        if let Some(server) = self.by_name.remove(name) {
            self.index_remove(name, &server.info.load);
            true
        } else {
            false
        }
    }

    /// Forgets a dead server once its log recovery has completed.
    pub fn recovery_complete(&mut self, name: &str) {
        self.dead.remove(name);
    }

    /// Declares dead every server whose last report is older than `lease`.
    /// Returns the expired names.
    pub fn expire_stale(
        &mut self,
        now: Instant,
        lease: Duration,
    ) -> Vec<ServerName> {
        let expired: Vec<ServerName> = self
            .by_name
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_report) > lease)
            .map(|(n, _)| n.clone())
            .collect();
        for name in &expired {
            pf_warn!("m"; "server '{}' lease expired", name);
            self.mark_dead(name);
        }
        expired
    }

    /// Whether a server is currently live.
    pub fn is_live(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Finds a live server by hostname or `host:port` address.
    pub fn find_by_host(&self, host: &str) -> Option<ServerName> {
        self.by_name
            .iter()
            .find(|(_, s)| s.info.host == host || s.info.addr() == host)
            .map(|(n, _)| n.clone())
    }

    /// Number of live servers.
    pub fn num_servers(&self) -> usize {
        self.by_name.len()
    }

    /// Names of all live servers.
    pub fn server_names(&self) -> Vec<ServerName> {
        let mut names: Vec<_> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Infos of all live servers (for cluster status).
    pub fn server_infos(&self) -> Vec<ServerInfo> {
        let mut infos: Vec<_> =
            self.by_name.values().map(|s| s.info.clone()).collect();
        infos.sort_by_key(|i| i.server_name());
        infos
    }

    /// Names of known-dead servers still awaiting (or under) recovery.
    pub fn dead_servers(&self) -> Vec<ServerName> {
        self.dead.iter().cloned().collect()
    }

    /// Mean region count across live servers.
    pub fn average_load(&self) -> f64 {
        if self.by_name.is_empty() {
            return 0.0;
        }
        let total: u64 = self
            .by_name
            .values()
            .map(|s| s.info.load.regions as u64)
            .sum();
        total as f64 / self.by_name.len() as f64
    }

    /// Live servers whose region count is strictly below `threshold`, least
    /// loaded first.
    pub fn light_servers(&self, threshold: f64) -> Vec<ServerName> {
        self.by_load
            .iter()
            .take_while(|(load, _)| (load.regions as f64) < threshold)
            .flat_map(|(_, names)| names.iter().cloned())
            .collect()
    }

    /// The live server with minimum load; ties break by lexicographic
    /// server name.
    pub fn min_load_server(&self) -> Option<ServerName> {
        self.by_load
            .iter()
            .next()
            .and_then(|(_, names)| names.iter().next().cloned())
    }

    #[cfg(test)]
    fn check_index_invariant(&self) {
        let mut indexed = 0;
        for (load, names) in &self.by_load {
            for name in names {
                assert_eq!(self.by_name[name].info.load, *load);
                indexed += 1;
            }
        }
        assert_eq!(indexed, self.by_name.len());
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;

    fn info(host: &str, start_code: u64, regions: u32) -> ServerInfo {
        ServerInfo {
            host: host.into(),
            port: 7001,
            start_code,
            load: ServerLoad {
                regions,
                requests_per_sec: 0,
                storefile_size_mb: 0,
            },
        }
    }

    #[test]
    fn startup_and_report() {
        let mut registry = ServerRegistry::new();
        let now = Instant::now();
        assert_eq!(registry.record_startup(info("rs1", 1, 0), now), None);
        assert_eq!(registry.num_servers(), 1);
        registry.check_index_invariant();

        let directives =
            registry.record_report(&info("rs1", 1, 3), now).unwrap();
        assert!(directives.is_empty());
        assert_eq!(registry.average_load(), 3.0);
        registry.check_index_invariant();

        // reports from unknown incarnations are rejected
        assert_eq!(registry.record_report(&info("rs1", 9, 0), now), None);
    }

    #[test]
    fn reincarnation_marks_old_dead() {
        let mut registry = ServerRegistry::new();
        let now = Instant::now();
        registry.record_startup(info("rs1", 1, 5), now);
        let stale = registry.record_startup(info("rs1", 2, 0), now);
        assert_eq!(stale, Some("rs1,7001,1".to_string()));
        assert!(registry.is_live("rs1,7001,2"));
        assert!(!registry.is_live("rs1,7001,1"));
        assert_eq!(registry.dead_servers(), vec!["rs1,7001,1".to_string()]);
        registry.check_index_invariant();

        registry.recovery_complete("rs1,7001,1");
        assert!(registry.dead_servers().is_empty());
    }

    #[test]
    fn mailbox_drained_in_order() {
        let mut registry = ServerRegistry::new();
        let now = Instant::now();
        registry.record_startup(info("rs1", 1, 0), now);
        assert!(registry
            .enqueue_directive("rs1,7001,1", Directive::ShutdownServer));
        assert!(!registry
            .enqueue_directive("rs9,7001,1", Directive::ShutdownServer));
        let directives =
            registry.record_report(&info("rs1", 1, 0), now).unwrap();
        assert_eq!(directives, vec![Directive::ShutdownServer]);
        // drained once
        let directives =
            registry.record_report(&info("rs1", 1, 0), now).unwrap();
        assert!(directives.is_empty());
    }

    #[test]
    fn lease_expiry() {
        let mut registry = ServerRegistry::new();
        let now = Instant::now();
        registry.record_startup(info("rs1", 1, 0), now);
        registry.record_startup(info("rs2", 1, 0), now);
        let later = now + Duration::from_millis(500);
        registry.record_report(&info("rs2", 1, 0), later);

        let expired =
            registry.expire_stale(later, Duration::from_millis(100));
        assert_eq!(expired, vec!["rs1,7001,1".to_string()]);
        assert!(registry.is_live("rs2,7001,1"));
        assert_eq!(registry.dead_servers(), vec!["rs1,7001,1".to_string()]);
        registry.check_index_invariant();
    }

    #[test]
    fn min_load_ties_break_by_name() {
        let mut registry = ServerRegistry::new();
        let now = Instant::now();
        registry.record_startup(info("rs2", 1, 1), now);
        registry.record_startup(info("rs1", 1, 1), now);
        registry.record_startup(info("rs3", 1, 9), now);
        assert_eq!(
            registry.min_load_server(),
            Some("rs1,7001,1".to_string())
        );
        let light = registry.light_servers(9.0);
        assert_eq!(
            light,
            vec!["rs1,7001,1".to_string(), "rs2,7001,1".to_string()]
        );
    }
}
