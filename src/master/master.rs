//! The master itself: owns every authoritative structure, wins the
//! election, joins or bootstraps the cluster, and runs the single-consumer
//! main loop that all mutation flows through.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::api::{
    AdminReactor, AdminReply, AdminRequest, ClientId, ClusterStatus,
    ConfigSubset, Directive, RegionServerHub, RsMsg, RsReply, RsRequest,
};
use crate::catalog::{CatalogTable, RegionInfo};
use crate::coord::{CoordClient, CoordEvent, CoordPaths, CoordStore};
use crate::dfs::{self, Dfs};
use crate::master::assigner::{self, PreferredPlacement};
use crate::master::assignment::AssignmentTable;
use crate::master::election;
use crate::master::locality::LocalityOracle;
use crate::master::logsplit::LogSplitter;
use crate::master::metrics::MasterMetrics;
use crate::master::queue::{
    OperationItem, OperationQueue, ProcessOutcome, QueuedOp,
};
use crate::master::registry::{
    server_name_of, split_server_name, ServerInfo, ServerRegistry,
};
use crate::master::tableops::{self, AlterProgress};
use crate::master::{MasterConfig, RunState};
use crate::utils::RangemasterError;

/// The cluster master.
pub struct Master {
    /// Configuration parameters.
    cfg: MasterConfig,

    /// My published (admin-facing) address.
    my_addr: String,

    /// Coordination store client.
    coord: CoordClient,

    /// Shared file system handle.
    dfs: Arc<dyn Dfs>,

    /// Cluster root directory.
    rootdir: PathBuf,

    /// Root/META catalog access.
    catalog: CatalogTable,

    /// Live/dead region servers and their directive mailboxes.
    registry: ServerRegistry,

    /// Authoritative region assignment table.
    assignments: AssignmentTable,

    /// Locality-derived preferred placements.
    oracle: LocalityOracle,

    /// One-shot preferred placements from explicit moves.
    preferred: PreferredPlacement,

    /// The serialized operation queue.
    queue: OperationQueue,

    /// Region-server-facing hub.
    rs_hub: RegionServerHub,

    /// Admin-facing reactor.
    reactor: AdminReactor,

    /// Log-split recovery driver.
    splitter: LogSplitter,

    /// Metrics counters.
    metrics: Arc<MasterMetrics>,

    /// Running / draining / closed.
    run_state: RunState,

    /// Whether this master started the cluster (vs. adopted one).
    cluster_starter: bool,

    /// Startup instant, set after the locality scan; gates the
    /// preferred-placement window.
    master_start: Instant,

    /// In-progress alter reopens, by table.
    alters: HashMap<String, AlterProgress>,
}

// Master public API implementation
impl Master {
    /// Prepares the root directory (bootstrapping a fresh cluster if
    /// needed), wins the master election (blocking while a primary is
    /// active), and sets up both RPC surfaces.
    pub async fn new_and_setup(
        cfg: MasterConfig,
        store: Arc<dyn CoordStore>,
        dfs_handle: Arc<dyn Dfs>,
        rs_addr: SocketAddr,
        admin_addr: SocketAddr,
    ) -> Result<Self, RangemasterError> {
        let coord = CoordClient::new(
            store,
            CoordPaths {
                base: cfg.coord_base.clone(),
            },
            cfg.num_retries,
            cfg.sleep_interval(),
        );

        // root directory checks run before we contend for the lock; they
        // are idempotent and the DFS serializes nothing here but us
        let rootdir = PathBuf::from(&cfg.rootdir);
        dfs::wait_on_safe_mode(
            dfs_handle.as_ref(),
            cfg.thread_wake_frequency(),
        )
        .await?;
        dfs_handle.mkdirs(&rootdir).await?;
        dfs::check_version(dfs_handle.as_ref(), &rootdir).await?;
        dfs_handle
            .mkdirs(&rootdir.join(crate::master::logsplit::OLD_LOG_DIR_NAME))
            .await?;

        let catalog = CatalogTable::new(dfs_handle.clone(), rootdir.clone());

        let my_addr = admin_addr.to_string();
        let outcome = election::elect(
            &coord,
            &my_addr,
            cfg.backup,
            cfg.session_timeout(),
        )
        .await?;

        if !catalog.root_exists().await? {
            catalog.bootstrap().await?;
        }

        let metrics = Arc::new(MasterMetrics::default());
        let splitter =
            LogSplitter::new(dfs_handle.clone(), &rootdir, metrics.clone());
        let rs_hub = RegionServerHub::new_and_setup(rs_addr).await?;
        let reactor = AdminReactor::new_and_setup(admin_addr).await?;
        let queue = OperationQueue::new(
            cfg.queue_capacity as usize,
            cfg.max_queue_attempts,
        );

        pf_info!("m"; "master initialized on '{}'", my_addr);
        Ok(Master {
            my_addr,
            coord,
            dfs: dfs_handle,
            rootdir,
            catalog,
            registry: ServerRegistry::new(),
            assignments: AssignmentTable::new(),
            oracle: LocalityOracle::empty(),
            preferred: PreferredPlacement::default(),
            queue,
            rs_hub,
            reactor,
            splitter,
            metrics,
            run_state: RunState::Running,
            cluster_starter: outcome.cluster_starter,
            master_start: Instant::now(),
            alters: HashMap::new(),
            cfg,
        })
    }

    /// Whether this master process started the cluster.
    pub fn is_cluster_starter(&self) -> bool {
        self.cluster_starter
    }

    /// Metrics counters (shared with the log splitter).
    pub fn metrics(&self) -> Arc<MasterMetrics> {
        self.metrics.clone()
    }

    /// Joins the cluster, recovers orphaned logs, computes locality, then
    /// runs the main loop until closed or told to terminate.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), RangemasterError> {
        self.join_cluster().await?;
        self.split_logs_after_startup().await;
        self.init_preferred_assignment().await;

        let mut coord_events = self.coord.session_events();
        let mut wake = time::interval(self.cfg.thread_wake_frequency());
        wake.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut fatal: Option<RangemasterError> = None;
        while self.run_state != RunState::Closed {
            // once draining, final shutdown begins when the fleet is gone
            if self.run_state == RunState::Draining
                && self.registry.num_servers() == 0
            {
                self.start_shutdown().await;
                break;
            }

            tokio::select! {
                // next ready queued operation
                op = self.queue.pop() => {
                    match self.process(op).await {
                        ProcessOutcome::Failed => {
                            pf_error!("m"; "operation failed; exiting");
                            self.run_state = RunState::Closed;
                        }
                        ProcessOutcome::RequeuedButProblem => {
                            if let Err(e) = self.check_file_system().await {
                                fatal = Some(e);
                            }
                        }
                        _ => {}
                    }
                },

                // request from a region server
                req = self.rs_hub.recv_req() => {
                    match req {
                        Ok((name, req)) => self.enqueue_rs_request(name, req),
                        Err(e) => {
                            pf_error!("m"; "error receiving rs req: {}", e);
                        }
                    }
                },

                // request from an admin client
                req = self.reactor.recv_req() => {
                    match req {
                        Ok((client, request)) => {
                            if let Err(e) = self.queue.push(
                                OperationItem::AdminAction { client, request },
                            ) {
                                pf_warn!("m"; "dropping admin req: {}", e);
                                let _ = self.reactor.send_reply(
                                    AdminReply::Error { error: e },
                                    client,
                                );
                            }
                        }
                        Err(e) => {
                            pf_error!("m"; "error receiving admin req: {}", e);
                        }
                    }
                },

                // coordination store event
                event = coord_events.recv() => {
                    match event {
                        Ok(event) => self.handle_coord_event(event),
                        Err(_) => {
                            pf_error!("m"; "coordination event stream lost; \
                                            exiting");
                            self.run_state = RunState::Closed;
                        }
                    }
                },

                // periodic housekeeping
                _ = wake.tick() => {
                    self.on_wake_tick();
                },

                // termination signal
                _ = rx_term.changed() => {
                    pf_warn!("m"; "master caught termination signal");
                    self.run_state = RunState::Closed;
                },
            }
        }

        self.start_shutdown().await;
        pf_info!("m"; "master main loop exiting");
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// Master startup path implementation
impl Master {
    /// Rebuilds in-memory state from the catalog. Fresh start inserts
    /// everything unassigned; failover adopts the previous master's
    /// bindings for servers still registered in the coordination store,
    /// re-assigning nothing.
    async fn join_cluster(&mut self) -> Result<(), RangemasterError> {
        pf_debug!("m"; "checking cluster state...");
        let now = Instant::now();

        // a new master's reign lifts any stale drain flag
        self.coord.set_cluster_shutdown(false).await?;

        let registered: Vec<String> = self.coord.scan_rs_dir().await?;
        let root_location = self.coord.read_root_location().await?;

        let mut rows = self.catalog.scan_root().await?;
        rows.extend(self.catalog.scan_meta(None).await?);

        let mut adopted = 0;
        let mut adopt = |region: RegionInfo,
                         location: Option<(String, u64)>,
                         assignments: &mut AssignmentTable,
                         registry: &mut ServerRegistry|
         -> bool {
            if let Some((addr, start_code)) = location {
                let server_name = server_name_of(&addr, start_code);
                if registered.contains(&server_name) {
                    let (host, port) = match addr.rsplit_once(':') {
                        Some((host, port)) => {
                            (host.to_string(), port.parse().unwrap_or(0))
                        }
                        None => (addr.clone(), 0),
                    };
                    registry.record_startup(
                        ServerInfo {
                            host,
                            port,
                            start_code,
                            load: Default::default(),
                        },
                        now,
                    );
                    assignments.adopt_open(region, &server_name, now);
                    return true;
                }
            }
            assignments.insert(region, now);
            false
        };

        // the root region's location lives only in the coordination store
        let root_loc = if self.cluster_starter {
            None
        } else {
            root_location.map(|addr| {
                // adopt under whichever incarnation is registered
                let code = registered
                    .iter()
                    .filter_map(|n| split_server_name(n))
                    .find(|(a, _)| *a == addr)
                    .map(|(_, c)| c)
                    .unwrap_or(0);
                (addr, code)
            })
        };
        if adopt(
            RegionInfo::root(),
            root_loc,
            &mut self.assignments,
            &mut self.registry,
        ) {
            adopted += 1;
        }

        for row in rows {
            let location = match (&row.server, row.start_code) {
                (Some(addr), Some(code)) => Some((addr.clone(), code)),
                _ => None,
            };
            if adopt(
                row.region,
                location,
                &mut self.assignments,
                &mut self.registry,
            ) {
                adopted += 1;
            }
        }

        if self.cluster_starter {
            pf_debug!("m"; "master fresh start, proceeding with normal \
                            startup");
        } else {
            pf_info!("m"; "master failover: adopted {} deployed regions \
                           from {} registered servers", adopted,
                     registered.len());
        }
        Ok(())
    }

    /// Splits the logs of every server that is not registered and live.
    async fn split_logs_after_startup(&self) {
        let live = self.registry.server_names().into_iter().collect();
        if let Err(e) = self.splitter.split_dead_logs(&live).await {
            pf_error!("m"; "startup log sweep failed: {}", e);
        }
    }

    /// Loads (or recomputes) the locality snapshot, then stamps the master
    /// startup time that gates the preferred-assignment window.
    async fn init_preferred_assignment(&mut self) {
        if self.cfg.apply_preferred_period_ms > 0 {
            self.oracle = LocalityOracle::load_or_scan(
                self.dfs.clone(),
                &self.rootdir,
                &PathBuf::from(&self.cfg.tmp_dir),
                self.cfg.locality_snapshot_validity_ms,
                self.cfg.locality_check_pool as usize,
            )
            .await;
        }
        // the scan above may pause a while; stamp after it
        self.master_start = Instant::now();
    }
}

// Master main loop implementation
impl Master {
    /// Converts a region-server request into queued operations.
    fn enqueue_rs_request(&mut self, name: String, req: RsRequest) {
        let item = match req {
            RsRequest::Startup { info } => {
                OperationItem::ServerStartup { info }
            }
            RsRequest::Report {
                info,
                msgs,
                hot_regions,
            } => OperationItem::ServerReport {
                info,
                msgs,
                hot_regions,
            },
        };
        if let Err(e) = self.queue.push(item) {
            pf_warn!("m"; "dropping request of '{}': {}", name, e);
            let _ = self.rs_hub.send_reply(
                RsReply::Error { error: e },
                &name,
            );
        }
    }

    /// Handles one coordination store event.
    fn handle_coord_event(&mut self, event: CoordEvent) {
        match event {
            CoordEvent::SessionExpired => {
                // the lock is gone with the session; a standby takes over
                pf_error!("m"; "coordination session expired; stepping down");
                self.run_state = RunState::Closed;
            }
            CoordEvent::NodeDeleted(path) => {
                if path == self.coord.paths.master() {
                    pf_error!("m"; "master lock node vanished; stepping \
                                    down");
                    self.run_state = RunState::Closed;
                } else if let Some(server_name) = path
                    .strip_prefix(&format!("{}/", self.coord.paths.rs_dir()))
                {
                    let server_name = server_name.to_string();
                    if self.registry.is_live(&server_name) {
                        pf_warn!("m"; "server '{}' session vanished",
                                 server_name);
                        self.on_server_death(server_name);
                    }
                }
            }
            CoordEvent::Disconnected => {
                pf_warn!("m"; "coordination store connection hiccup");
            }
            _ => {}
        }
    }

    /// Marks a server dead and queues its recovery.
    fn on_server_death(&mut self, server_name: String) {
        self.registry.mark_dead(&server_name);
        let now = Instant::now();
        let freed = self.assignments.server_died(&server_name, now);
        pf_info!("m"; "server '{}' died with {} regions", server_name,
                 freed.len());
        if let Err(e) = self
            .queue
            .push(OperationItem::ServerDeath { server_name })
        {
            pf_error!("m"; "cannot queue server death: {}", e);
        }
    }

    /// Periodic housekeeping on the wake tick.
    fn on_wake_tick(&mut self) {
        let now = Instant::now();

        // lease-based failure detection
        for server_name in self
            .registry
            .expire_stale(now, self.cfg.rs_lease_timeout())
        {
            let freed = self.assignments.server_died(&server_name, now);
            pf_info!("m"; "expired server '{}' held {} regions",
                     server_name, freed.len());
            if let Err(e) = self
                .queue
                .push(OperationItem::ServerDeath { server_name })
            {
                pf_error!("m"; "cannot queue server death: {}", e);
            }
        }

        // lost open directives revert with backoff
        for region_name in self.assignments.revert_timed_out(
            now,
            self.cfg.assignment_timeout(),
            self.cfg.sleep_interval(),
            self.cfg.assignment_backoff_cap,
        ) {
            pf_warn!("m"; "open directive for '{}' considered lost",
                     region_name);
            self.metrics.incr_directive_lost();
        }

        // alter reopens move forward, done tables are forgotten
        for progress in self.alters.values_mut() {
            tableops::drive_reopen(
                &mut self.assignments,
                &mut self.registry,
                progress,
                self.cfg.alter_reopen_throttle as usize,
                now,
            );
        }
        self.alters.retain(|_, p| !p.done());

        self.run_assigner(now);
    }

    fn run_assigner(&mut self, now: Instant) {
        assigner::run_assignment(
            &mut self.assignments,
            &mut self.registry,
            &self.oracle,
            &mut self.preferred,
            &self.metrics,
            &self.cfg,
            self.master_start,
            now,
        );
    }

    /// Verifies the DFS; an unavailable DFS is fatal to the whole cluster,
    /// raised as `FatalDfsUnavailable` and closing the main loop.
    async fn check_file_system(&mut self) -> Result<(), RangemasterError> {
        match self.dfs.check_available().await {
            Ok(()) => Ok(()),
            Err(e) => {
                let fatal =
                    RangemasterError::FatalDfsUnavailable(e.to_string());
                pf_error!("m"; "shutting down cluster: {}", fatal);
                self.run_state = RunState::Closed;
                Err(fatal)
            }
        }
    }

    /// Final shutdown: release the lock and stop accepting anything. The
    /// lock node is only deleted while it still carries my address; after
    /// a session loss it may already belong to a successor.
    async fn start_shutdown(&mut self) {
        if self.run_state != RunState::Closed {
            self.run_state = RunState::Closed;
        }
        let master_path = self.coord.paths.master();
        if let Ok(Some((data, _))) = self.coord.read(&master_path).await {
            if data == self.my_addr.as_bytes() {
                let _ = self.coord.delete(&master_path).await;
            }
        }
        pf_info!("m"; "master '{}' shut down", self.my_addr);
    }
}

// Master operation processing implementation
impl Master {
    /// Processes one queued operation.
    async fn process(&mut self, op: QueuedOp) -> ProcessOutcome {
        match op.item.clone() {
            OperationItem::ServerStartup { info } => {
                self.process_server_startup(info)
            }
            OperationItem::ServerReport {
                info,
                msgs,
                hot_regions,
            } => self.process_server_report(info, msgs, hot_regions).await,
            OperationItem::ServerDeath { server_name } => {
                self.process_server_death(op, server_name).await
            }
            OperationItem::RegionOpened {
                region,
                server_name,
            } => self.process_region_opened(op, region, server_name).await,
            OperationItem::RegionClosed { region } => {
                self.process_region_closed(region).await
            }
            OperationItem::RegionSplit { parent, daughters } => {
                self.process_region_split(op, parent, *daughters).await
            }
            OperationItem::AdminAction { client, request } => {
                self.process_admin(op, client, request).await
            }
        }
    }

    fn process_server_startup(&mut self, info: ServerInfo) -> ProcessOutcome {
        let name = info.server_name();
        if self.run_state != RunState::Running {
            let _ = self.rs_hub.send_reply(
                RsReply::Error {
                    error: RangemasterError::MasterShuttingDown,
                },
                &name,
            );
            return ProcessOutcome::Noop;
        }

        let now = Instant::now();
        let observed_host = info.host.clone();
        if let Some(old_name) =
            self.registry.record_startup(info, now)
        {
            // an older incarnation on the same address: its regions are
            // orphaned and its logs need splitting
            self.assignments.server_died(&old_name, now);
            if let Err(e) = self.queue.push(OperationItem::ServerDeath {
                server_name: old_name,
            }) {
                pf_error!("m"; "cannot queue server death: {}", e);
            }
        }

        pf_info!("m"; "region server '{}' started", name);
        let reply = RsReply::StartupAck {
            config: ConfigSubset {
                rootdir: self.cfg.rootdir.clone(),
                fs_name: self.cfg.fs_name.clone(),
                observed_host,
            },
        };
        if let Err(e) = self.rs_hub.send_reply(reply, &name) {
            pf_warn!("m"; "startup ack to '{}' failed: {}", name, e);
        }
        ProcessOutcome::Processed
    }

    async fn process_server_report(
        &mut self,
        info: ServerInfo,
        msgs: Vec<RsMsg>,
        _hot_regions: Vec<RegionInfo>,
    ) -> ProcessOutcome {
        let name = info.server_name();
        let now = Instant::now();

        let Some(mut directives) = self.registry.record_report(&info, now)
        else {
            // unknown or expired incarnation: it must re-run startup
            let _ = self.rs_hub.send_reply(
                RsReply::Directives {
                    directives: vec![Directive::CallServerStartup],
                },
                &name,
            );
            return ProcessOutcome::Noop;
        };

        // state-change notifications become their own queued operations,
        // keeping per-region effects in arrival order
        for msg in msgs {
            let item = match msg {
                RsMsg::RegionOpened { region } => {
                    OperationItem::RegionOpened {
                        region,
                        server_name: name.clone(),
                    }
                }
                RsMsg::RegionClosed { region } => {
                    OperationItem::RegionClosed { region }
                }
                RsMsg::RegionSplit {
                    parent,
                    daughter_a,
                    daughter_b,
                } => OperationItem::RegionSplit {
                    parent,
                    daughters: Box::new((daughter_a, daughter_b)),
                },
            };
            if let Err(e) = self.queue.push(item) {
                pf_error!("m"; "cannot queue report msg: {}", e);
            }
        }

        if self.run_state == RunState::Draining {
            // quiesce: close everything it serves; once it reports empty,
            // let it go
            if info.load.regions == 0 {
                self.registry.remove(&name);
                let _ = self.rs_hub.send_reply(
                    RsReply::Directives {
                        directives: vec![Directive::ShutdownServer],
                    },
                    &name,
                );
                pf_info!("m"; "server '{}' released for shutdown", name);
                return ProcessOutcome::Processed;
            }
            for region_name in self.assignments.regions_of(&name) {
                if self.assignments.is_open(&region_name) {
                    let region = self
                        .assignments
                        .get(&region_name)
                        .unwrap()
                        .region
                        .clone();
                    if self
                        .assignments
                        .request_close(&region_name, now)
                        .is_ok()
                    {
                        directives
                            .push(Directive::CloseRegion { region });
                    }
                }
            }
        } else {
            // fresh assignment work may target this server's mailbox
            self.run_assigner(now);
        }

        directives.extend(self.registry.drain_mailbox(&name));

        // transient markers for regions going into transition
        for directive in &directives {
            if let Directive::OpenRegion { region } = directive {
                let _ = self
                    .coord
                    .mark_unassigned(&region.region_name())
                    .await;
            }
        }

        if let Err(e) = self
            .rs_hub
            .send_reply(RsReply::Directives { directives }, &name)
        {
            pf_warn!("m"; "report reply to '{}' failed: {}", name, e);
        }
        ProcessOutcome::Processed
    }

    async fn process_server_death(
        &mut self,
        op: QueuedOp,
        server_name: String,
    ) -> ProcessOutcome {
        match self.splitter.split_server_log(&server_name).await {
            Ok(()) => {
                self.registry.recovery_complete(&server_name);
                // a dead root holder's published location is now a lie
                if let Some((addr, _)) = split_server_name(&server_name) {
                    if let Ok(Some(root_addr)) =
                        self.coord.read_root_location().await
                    {
                        if root_addr == addr {
                            let _ = self
                                .coord
                                .write_root_location(None)
                                .await;
                        }
                    }
                }
                ProcessOutcome::Processed
            }
            Err(e) => {
                pf_error!("m"; "failed splitting logs of '{}': {}",
                          server_name, e);
                self.metrics.incr_requeue();
                self.queue.requeue(op, self.cfg.sleep_interval(), true)
            }
        }
    }

    async fn process_region_opened(
        &mut self,
        op: QueuedOp,
        region: RegionInfo,
        server_name: String,
    ) -> ProcessOutcome {
        let region_name = region.region_name();
        let now = Instant::now();
        if let Err(e) =
            self.assignments.opened(&region_name, &server_name, now)
        {
            pf_warn!("m"; "stale region-opened report: {}", e);
            return ProcessOutcome::Noop;
        }
        let _ = self.coord.clear_unassigned(&region_name).await;

        let Some((addr, start_code)) = split_server_name(&server_name)
        else {
            return ProcessOutcome::Noop;
        };
        let result = if region.is_root() {
            self.coord.write_root_location(Some(&addr)).await
        } else {
            self.catalog
                .update_location(&region, Some((addr.as_str(), start_code)))
                .await
        };
        match result {
            Ok(()) => {
                pf_info!("m"; "region '{}' open on '{}'", region_name,
                         server_name);
                ProcessOutcome::Processed
            }
            Err(e) => {
                pf_error!("m"; "recording open of '{}' failed: {}",
                          region_name, e);
                self.metrics.incr_requeue();
                self.queue.requeue(op, self.cfg.sleep_interval(), true)
            }
        }
    }

    async fn process_region_closed(
        &mut self,
        region: RegionInfo,
    ) -> ProcessOutcome {
        let region_name = region.region_name();
        let now = Instant::now();
        match self.assignments.closed(&region_name, now) {
            Ok(state) => {
                pf_info!("m"; "region '{}' closed, now {:?}", region_name,
                         state);
            }
            Err(e) => {
                pf_warn!("m"; "stale region-closed report: {}", e);
                return ProcessOutcome::Noop;
            }
        }
        if region.is_root() {
            let _ = self.coord.write_root_location(None).await;
        } else if let Err(e) =
            self.catalog.update_location(&region, None).await
        {
            // the row may be legitimately gone (table delete)
            pf_debug!("m"; "no location to wipe for '{}': {}",
                      region_name, e);
        }
        ProcessOutcome::Processed
    }

    async fn process_region_split(
        &mut self,
        op: QueuedOp,
        parent: RegionInfo,
        daughters: (RegionInfo, RegionInfo),
    ) -> ProcessOutcome {
        let parent_name = parent.region_name();
        let now = Instant::now();
        if let Err(e) = self.assignments.split_done(
            &parent_name,
            daughters.clone(),
            now,
        ) {
            pf_warn!("m"; "stale region-split report: {}", e);
            return ProcessOutcome::Noop;
        }

        let apply = async {
            self.catalog.remove_region(&parent).await?;
            self.catalog
                .insert_regions(&[daughters.0.clone(), daughters.1.clone()])
                .await
        };
        match apply.await {
            Ok(()) => {
                pf_info!("m"; "region '{}' split into '{}' and '{}'",
                         parent_name,
                         daughters.0.region_name(),
                         daughters.1.region_name());
                ProcessOutcome::Processed
            }
            Err(e) => {
                pf_error!("m"; "recording split of '{}' failed: {}",
                          parent_name, e);
                self.metrics.incr_requeue();
                self.queue.requeue(op, self.cfg.sleep_interval(), true)
            }
        }
    }

    /// Errors surface to admin clients verbatim, except that a lost
    /// coordination session reads as `MasterNotRunning` so clients retry
    /// against the new active master.
    fn client_error(error: RangemasterError) -> RangemasterError {
        match error {
            RangemasterError::CoordUnavailable(_) => {
                RangemasterError::MasterNotRunning
            }
            other => other,
        }
    }

    async fn process_admin(
        &mut self,
        op: QueuedOp,
        client: ClientId,
        request: AdminRequest,
    ) -> ProcessOutcome {
        let now = Instant::now();
        let reply = match request {
            AdminRequest::IsMasterRunning => AdminReply::MasterRunning {
                running: self.run_state == RunState::Running,
            },

            AdminRequest::GetClusterStatus => AdminReply::ClusterStatus {
                status: Box::new(ClusterStatus {
                    version: env!("CARGO_PKG_VERSION").into(),
                    servers: self.registry.server_infos(),
                    dead_servers: self.registry.dead_servers(),
                    regions_in_transition: self.assignments.in_transition(),
                    average_load: self.registry.average_load(),
                }),
            },

            AdminRequest::Shutdown => {
                pf_info!("m"; "cluster shutdown requested; quiescing \
                               servers");
                self.run_state = RunState::Draining;
                let _ = self.coord.set_cluster_shutdown(true).await;
                AdminReply::ShuttingDown
            }

            AdminRequest::StopMaster => {
                pf_info!("m"; "stop of this master requested");
                self.run_state = RunState::Closed;
                AdminReply::Stopping
            }

            AdminRequest::Leave => return ProcessOutcome::Noop,

            // everything below mutates tables; refuse while not running
            _ if self.run_state != RunState::Running => AdminReply::Error {
                error: RangemasterError::MasterShuttingDown,
            },

            AdminRequest::CreateTable { schema, split_keys } => {
                let meta_online =
                    assigner::all_meta_online(&self.assignments);
                match tableops::create_table(
                    &self.catalog,
                    &mut self.assignments,
                    &self.registry,
                    self.cfg.min_servers,
                    schema,
                    split_keys,
                    meta_online,
                    now,
                )
                .await
                {
                    Ok(()) => {
                        self.run_assigner(now);
                        AdminReply::TableCreated
                    }
                    Err(
                        error @ (RangemasterError::NotAllMetaRegionsOnline
                        | RangemasterError::InsufficientServers),
                    ) if op.attempts < self.cfg.num_retries => {
                        // not ready yet; retry after the sleep interval
                        pf_warn!("m"; "table create not ready ({}), \
                                       retrying", error);
                        self.metrics.incr_requeue();
                        return self.queue.requeue(
                            op,
                            self.cfg.sleep_interval(),
                            false,
                        );
                    }
                    Err(error) => AdminReply::Error {
                        error: Self::client_error(error),
                    },
                }
            }

            AdminRequest::DeleteTable { table } => {
                match tableops::delete_table(
                    &self.catalog,
                    &mut self.assignments,
                    &mut self.registry,
                    &table,
                    now,
                )
                .await
                {
                    Ok(()) => AdminReply::TableDeleted,
                    Err(error) => AdminReply::Error {
                        error: Self::client_error(error),
                    },
                }
            }

            AdminRequest::EnableTable { table } => {
                match tableops::set_table_enabled(
                    &self.catalog,
                    &mut self.assignments,
                    &mut self.registry,
                    &table,
                    true,
                    now,
                )
                .await
                {
                    Ok(()) => {
                        self.run_assigner(now);
                        AdminReply::TableEnabled
                    }
                    Err(error) => AdminReply::Error {
                        error: Self::client_error(error),
                    },
                }
            }

            AdminRequest::DisableTable { table } => {
                match tableops::set_table_enabled(
                    &self.catalog,
                    &mut self.assignments,
                    &mut self.registry,
                    &table,
                    false,
                    now,
                )
                .await
                {
                    Ok(()) => AdminReply::TableDisabled,
                    Err(error) => AdminReply::Error {
                        error: Self::client_error(error),
                    },
                }
            }

            AdminRequest::AlterTable {
                table,
                adds,
                mods,
                drops,
            } => {
                match tableops::alter_table(
                    &self.catalog,
                    &mut self.assignments,
                    &table,
                    adds,
                    mods,
                    drops,
                )
                .await
                {
                    Ok(mut progress) => {
                        tableops::drive_reopen(
                            &mut self.assignments,
                            &mut self.registry,
                            &mut progress,
                            self.cfg.alter_reopen_throttle as usize,
                            now,
                        );
                        self.alters.insert(table, progress);
                        AdminReply::TableAltered
                    }
                    Err(error) => AdminReply::Error {
                        error: Self::client_error(error),
                    },
                }
            }

            AdminRequest::GetAlterStatus { table } => {
                let (pending, total) = self
                    .alters
                    .get(&table)
                    .map(|p| p.status())
                    .unwrap_or((0, 0));
                AdminReply::AlterStatus { pending, total }
            }

            AdminRequest::ModifyTable { table, action } => {
                match tableops::modify_table(
                    &self.catalog,
                    &mut self.assignments,
                    &mut self.registry,
                    &mut self.preferred,
                    &table,
                    action,
                    now,
                )
                .await
                {
                    Ok(()) => AdminReply::Modified,
                    Err(error) => AdminReply::Error {
                        error: Self::client_error(error),
                    },
                }
            }

            AdminRequest::GetTableRegions { table } => {
                match tableops::get_table_regions(&self.catalog, &table)
                    .await
                {
                    Ok(regions) => AdminReply::TableRegions { regions },
                    Err(error) => AdminReply::Error {
                        error: Self::client_error(error),
                    },
                }
            }
        };

        if let Err(e) = self.reactor.send_reply(reply, client) {
            pf_warn!("m"; "admin reply to {} failed: {}", client, e);
        }
        ProcessOutcome::Processed
    }
}

#[cfg(test)]
mod master_tests {
    use super::*;
    use crate::api::{AdminClient, RegionServerStub};
    use crate::catalog::TableSchema;
    use crate::coord::{CoordStore, MemCoord};
    use crate::dfs::LocalDfs;
    use crate::master::registry::ServerLoad;
    use tokio::time::Duration;

    fn test_config(tmp: &tempfile::TempDir) -> MasterConfig {
        MasterConfig {
            rootdir: tmp.path().join("root").display().to_string(),
            tmp_dir: tmp.path().join("tmp").display().to_string(),
            thread_wake_frequency_ms: 50,
            sleep_interval_ms: 50,
            rs_lease_timeout_ms: 60_000,
            session_timeout_ms: 100,
            assignment_timeout_ms: 10_000,
            apply_preferred_period_ms: 0, // no locality scan in tests
            ..MasterConfig::default()
        }
    }

    async fn spawn_master(
        cfg: MasterConfig,
        hub: &MemCoord,
        rs_port: u16,
        admin_port: u16,
    ) -> (bool, u64, watch::Sender<bool>) {
        let session = hub.session();
        let session_id = session.id();
        let master = Master::new_and_setup(
            cfg,
            Arc::new(session),
            Arc::new(LocalDfs::default()),
            format!("127.0.0.1:{}", rs_port).parse().unwrap(),
            format!("127.0.0.1:{}", admin_port).parse().unwrap(),
        )
        .await
        .unwrap();
        let cluster_starter = master.is_cluster_starter();
        let (tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move {
            let mut master = master;
            master.run(rx_term).await
        });
        (cluster_starter, session_id, tx_term)
    }

    /// Scripted region server: obeys every directive it is handed.
    struct FakeRs {
        stub: RegionServerStub,
        info: ServerInfo,
        open: Vec<RegionInfo>,
        pending: Vec<RsMsg>,
    }

    impl FakeRs {
        async fn start(
            rs_port: u16,
            declared_port: u16,
        ) -> (Self, String) {
            let mut stub = RegionServerStub::connect(
                format!("127.0.0.1:{}", rs_port).parse().unwrap(),
            )
            .await
            .unwrap();
            let mut info = ServerInfo {
                host: "local".into(),
                port: declared_port,
                start_code: 1,
                load: ServerLoad::default(),
            };
            let reply = stub
                .request(&RsRequest::Startup { info: info.clone() })
                .await
                .unwrap();
            let RsReply::StartupAck { config } = reply else {
                panic!("unexpected startup reply: {:?}", reply);
            };
            info.host = config.observed_host;
            let name = info.server_name();
            (
                FakeRs {
                    stub,
                    info,
                    open: vec![],
                    pending: vec![],
                },
                name,
            )
        }

        /// One heartbeat round; applies the returned directives. Returns
        /// the directives received.
        async fn report(&mut self) -> Vec<Directive> {
            self.info.load.regions = self.open.len() as u32;
            let reply = self
                .stub
                .request(&RsRequest::Report {
                    info: self.info.clone(),
                    msgs: std::mem::take(&mut self.pending),
                    hot_regions: vec![],
                })
                .await
                .unwrap();
            let RsReply::Directives { directives } = reply else {
                panic!("unexpected report reply: {:?}", reply);
            };
            for directive in &directives {
                match directive {
                    Directive::OpenRegion { region } => {
                        self.open.push(region.clone());
                        self.pending.push(RsMsg::RegionOpened {
                            region: region.clone(),
                        });
                    }
                    Directive::CloseRegion { region } => {
                        let name = region.region_name();
                        self.open
                            .retain(|r| r.region_name() != name);
                        self.pending.push(RsMsg::RegionClosed {
                            region: region.clone(),
                        });
                    }
                    Directive::SplitRegion {
                        region,
                        split_point,
                    } => {
                        let point =
                            split_point.clone().unwrap_or_default();
                        let name = region.region_name();
                        self.open
                            .retain(|r| r.region_name() != name);
                        let daughter_a = RegionInfo::new(
                            region.schema.clone(),
                            region.start_key.clone(),
                            point.clone(),
                            region.region_id + 1,
                        );
                        let daughter_b = RegionInfo::new(
                            region.schema.clone(),
                            point,
                            region.end_key.clone(),
                            region.region_id + 2,
                        );
                        self.pending.push(RsMsg::RegionSplit {
                            parent: region.clone(),
                            daughter_a,
                            daughter_b,
                        });
                    }
                    _ => {}
                }
            }
            directives
        }

        /// Heartbeats until a quiet round, so queued work settles.
        async fn settle(&mut self) {
            let mut quiet = 0;
            for _ in 0..50 {
                let directives = self.report().await;
                if directives.is_empty() && self.pending.is_empty() {
                    quiet += 1;
                    if quiet >= 3 {
                        return;
                    }
                } else {
                    quiet = 0;
                }
                time::sleep(Duration::from_millis(20)).await;
            }
            panic!("cluster did not settle");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fresh_cluster_bootstrap() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(&tmp);
        let rootdir = PathBuf::from(cfg.rootdir.clone());
        let hub = MemCoord::new();
        let (cluster_starter, _session, _tx_term) =
            spawn_master(cfg, &hub, 30210, 30211).await;

        // empty rs directory at election time: this master starts the
        // cluster, and bootstrapping created the version marker and both
        // catalog regions
        assert!(cluster_starter);
        let dfs = LocalDfs::default();
        assert!(dfs.exists(&rootdir.join("VERSION")).await.unwrap());
        assert!(dfs
            .exists(&rootdir.join("-ROOT-").join("catalog"))
            .await
            .unwrap());
        assert!(dfs
            .exists(&rootdir.join(".META.").join("catalog"))
            .await
            .unwrap());

        let (mut rs, rs_name) = FakeRs::start(30210, 7101).await;
        // the master hands starting servers their bootstrap config
        assert_eq!(rs.info.host, "127.0.0.1");
        let rs_session = hub.session();
        rs_session
            .create(
                &format!("/rangemaster/rs/{}", rs_name),
                vec![],
                true,
            )
            .await
            .unwrap();

        rs.settle().await;
        // root then META ended up open on the only server
        let names: Vec<String> =
            rs.open.iter().map(|r| r.region_name()).collect();
        assert!(names.contains(&"-ROOT-,,0".to_string()));
        assert!(names.contains(&".META.,,1".to_string()));
        assert_eq!(
            rs_session
                .read("/rangemaster/root-region-server")
                .await
                .unwrap()
                .map(|(data, _)| String::from_utf8(data).unwrap()),
            Some("127.0.0.1:7101".to_string())
        );

        // user table create round-trips through the catalog
        let mut admin = AdminClient::connect(
            "127.0.0.1:30211".parse().unwrap(),
        )
        .await
        .unwrap();
        let reply = admin
            .request(&AdminRequest::CreateTable {
                schema: TableSchema::new("t"),
                split_keys: vec![b"g".to_vec(), b"p".to_vec()],
            })
            .await
            .unwrap();
        assert_eq!(reply, AdminReply::TableCreated);
        rs.settle().await;
        assert_eq!(rs.open.len(), 5); // root + META + three of "t"

        let reply = admin
            .request(&AdminRequest::GetTableRegions { table: "t".into() })
            .await
            .unwrap();
        let AdminReply::TableRegions { regions } = reply else {
            panic!("unexpected reply: {:?}", reply);
        };
        assert_eq!(regions.len(), 3);
        assert!(regions
            .iter()
            .all(|(_, server)| server.as_deref()
                == Some("127.0.0.1:7101")));

        let reply = admin
            .request(&AdminRequest::GetClusterStatus)
            .await
            .unwrap();
        let AdminReply::ClusterStatus { status } = reply else {
            panic!("unexpected reply: {:?}", reply);
        };
        assert_eq!(status.servers.len(), 1);
        assert!(status.dead_servers.is_empty());
        assert!(status.regions_in_transition.is_empty());
        admin.leave().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn create_table_during_server_shortage() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(&tmp);
        let retries = cfg.num_retries;
        let sleep_interval = cfg.sleep_interval();
        let hub = MemCoord::new();
        let (_, _session, _tx_term) =
            spawn_master(cfg, &hub, 30220, 30221).await;

        let mut admin = AdminClient::connect(
            "127.0.0.1:30221".parse().unwrap(),
        )
        .await
        .unwrap();
        let asked = Instant::now();
        let reply = admin
            .request(&AdminRequest::CreateTable {
                schema: TableSchema::new("t"),
                split_keys: vec![],
            })
            .await
            .unwrap();
        assert_eq!(
            reply,
            AdminReply::Error {
                error: RangemasterError::InsufficientServers
            }
        );
        // the not-ready retries were spaced by the sleep interval
        assert!(asked.elapsed() >= sleep_interval * retries);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn server_death_splits_logs_and_frees_regions() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(&tmp);
        let rootdir = PathBuf::from(cfg.rootdir.clone());
        let hub = MemCoord::new();
        let (_, _session, _tx_term) =
            spawn_master(cfg, &hub, 30230, 30231).await;

        let (mut rs, rs_name) = FakeRs::start(30230, 7103).await;
        let rs_session = hub.session();
        let rs_session_id = rs_session.id();
        rs_session
            .create(
                &format!("/rangemaster/rs/{}", rs_name),
                vec![],
                true,
            )
            .await
            .unwrap();
        rs.settle().await;
        assert_eq!(rs.open.len(), 2); // root + META

        // the server has write-ahead logs on the shared fs
        let dfs = LocalDfs::default();
        let log_dir = rootdir.join(".logs").join(&rs_name);
        dfs.write_file(&log_dir.join("wal.0"), b"0123456789")
            .await
            .unwrap();

        // kill its coordination session; the master must notice, split its
        // logs, and free its regions
        hub.expire_session(rs_session_id);
        time::sleep(Duration::from_millis(500)).await;

        assert!(!dfs.exists(&log_dir).await.unwrap());
        let archived = dfs
            .list_dir(&rootdir.join(".oldlogs"))
            .await
            .unwrap();
        assert!(!archived.is_empty());

        let mut admin = AdminClient::connect(
            "127.0.0.1:30231".parse().unwrap(),
        )
        .await
        .unwrap();
        let reply = admin
            .request(&AdminRequest::GetClusterStatus)
            .await
            .unwrap();
        let AdminReply::ClusterStatus { status } = reply else {
            panic!("unexpected reply: {:?}", reply);
        };
        // recovery completed and both regions went back to unassigned
        assert!(status.servers.is_empty());
        assert!(status.dead_servers.is_empty());
        assert_eq!(status.regions_in_transition.len(), 2);
        assert_eq!(
            rs_session
                .read("/rangemaster/root-region-server")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failover_adopts_running_cluster() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(&tmp);
        let hub = MemCoord::new();
        let (_, m1_session, _m1_term) =
            spawn_master(cfg.clone(), &hub, 30250, 30251).await;

        let (mut rs, rs_name) = FakeRs::start(30250, 7105).await;
        let rs_session = hub.session();
        rs_session
            .create(
                &format!("/rangemaster/rs/{}", rs_name),
                vec![],
                true,
            )
            .await
            .unwrap();
        rs.settle().await;
        assert_eq!(rs.open.len(), 2); // root + META deployed

        // the first master's session expires; its lock vanishes
        hub.expire_session(m1_session);
        time::sleep(Duration::from_millis(100)).await;

        // a second master takes over; the rs directory is non-empty, so
        // this is a failover, and nothing gets re-assigned
        let (cluster_starter, _m2_session, _m2_term) =
            spawn_master(cfg, &hub, 30252, 30253).await;
        assert!(!cluster_starter);
        time::sleep(Duration::from_millis(300)).await;

        let mut admin = AdminClient::connect(
            "127.0.0.1:30253".parse().unwrap(),
        )
        .await
        .unwrap();
        let reply = admin
            .request(&AdminRequest::GetClusterStatus)
            .await
            .unwrap();
        let AdminReply::ClusterStatus { status } = reply else {
            panic!("unexpected reply: {:?}", reply);
        };
        assert_eq!(status.servers.len(), 1);
        assert_eq!(status.servers[0].server_name(), rs_name);
        assert!(status.regions_in_transition.is_empty());
        // the adopted root location survived the failover
        assert_eq!(
            rs_session
                .read("/rangemaster/root-region-server")
                .await
                .unwrap()
                .map(|(data, _)| String::from_utf8(data).unwrap()),
            Some("127.0.0.1:7105".to_string())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn explicit_split_end_to_end() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(&tmp);
        let hub = MemCoord::new();
        let (_, _session, _tx_term) =
            spawn_master(cfg, &hub, 30260, 30261).await;

        let (mut rs, _rs_name) = FakeRs::start(30260, 7106).await;
        rs.settle().await;

        let mut admin = AdminClient::connect(
            "127.0.0.1:30261".parse().unwrap(),
        )
        .await
        .unwrap();
        let reply = admin
            .request(&AdminRequest::CreateTable {
                schema: TableSchema::new("t"),
                split_keys: vec![],
            })
            .await
            .unwrap();
        assert_eq!(reply, AdminReply::TableCreated);
        rs.settle().await;

        let reply = admin
            .request(&AdminRequest::ModifyTable {
                table: "t".into(),
                action: crate::api::TableAction::ExplicitSplit {
                    split_point: b"g".to_vec(),
                },
            })
            .await
            .unwrap();
        assert_eq!(reply, AdminReply::Modified);
        rs.settle().await;

        // the parent was replaced by two daughters, both back open
        let reply = admin
            .request(&AdminRequest::GetTableRegions { table: "t".into() })
            .await
            .unwrap();
        let AdminReply::TableRegions { regions } = reply else {
            panic!("unexpected reply: {:?}", reply);
        };
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].0.start_key, b"".to_vec());
        assert_eq!(regions[0].0.end_key, b"g".to_vec());
        assert_eq!(regions[1].0.start_key, b"g".to_vec());
        assert_eq!(regions[1].0.end_key, b"".to_vec());
        assert!(regions.iter().all(|(_, server)| server.is_some()));

        // a split point outside any region's range is rejected
        let reply = admin
            .request(&AdminRequest::ModifyTable {
                table: "t".into(),
                action: crate::api::TableAction::ExplicitSplit {
                    split_point: vec![],
                },
            })
            .await
            .unwrap();
        assert_eq!(
            reply,
            AdminReply::Error {
                error: RangemasterError::InvalidSplitPoint
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn drain_shutdown_releases_servers() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(&tmp);
        let hub = MemCoord::new();
        let (_, _session, _tx_term) =
            spawn_master(cfg, &hub, 30240, 30241).await;

        let (mut rs, _rs_name) = FakeRs::start(30240, 7104).await;
        rs.settle().await;
        assert!(!rs.open.is_empty());

        let mut admin = AdminClient::connect(
            "127.0.0.1:30241".parse().unwrap(),
        )
        .await
        .unwrap();
        let reply =
            admin.request(&AdminRequest::Shutdown).await.unwrap();
        assert_eq!(reply, AdminReply::ShuttingDown);
        let observer = hub.session();
        assert!(observer
            .read("/rangemaster/shutdown")
            .await
            .unwrap()
            .is_some());

        // heartbeats now carry closes; once empty the server is released
        let mut released = false;
        for _ in 0..20 {
            let directives = rs.report().await;
            if directives.contains(&Directive::ShutdownServer) {
                released = true;
                break;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        assert!(released);
    }
}

