//! Table lifecycle workflows: create / delete / enable / disable / alter
//! (with throttled region reopening) and the region-or-table-scoped admin
//! actions. Each workflow walks the catalog and mutates the assignment
//! table; directives travel via the registry mailboxes.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

use crate::api::{Directive, TableAction};
use crate::catalog::{
    CatalogRow, CatalogTable, FamilySchema, Key, RegionInfo, TableSchema,
    META_TABLE_NAME, ROOT_TABLE_NAME,
};
use crate::master::assigner::PreferredPlacement;
use crate::master::assignment::{AssignmentTable, RegionState};
use crate::master::registry::ServerRegistry;
use crate::utils::RangemasterError;

/// Progress of one table's throttled region reopening after an alter.
#[derive(Debug, Default)]
pub struct AlterProgress {
    /// Regions not yet sent a close.
    queued: Vec<String>,

    /// Regions closed and awaiting their re-open.
    in_flight: HashSet<String>,

    /// Total regions of the table at alter time.
    total: u32,
}

impl AlterProgress {
    /// `(pending, total)` as reported by `get_alter_status`.
    pub fn status(&self) -> (u32, u32) {
        (
            (self.queued.len() + self.in_flight.len()) as u32,
            self.total,
        )
    }

    /// Marks one region's reopen as complete.
    pub fn region_reopened(&mut self, region_name: &str) {
        self.in_flight.remove(region_name);
    }

    /// Whether all regions have been reopened.
    pub fn done(&self) -> bool {
        self.queued.is_empty() && self.in_flight.is_empty()
    }
}

fn check_not_protected(table: &str) -> Result<(), RangemasterError> {
    if table == ROOT_TABLE_NAME || table == META_TABLE_NAME {
        return Err(RangemasterError::ProtectedTable(table.into()));
    }
    Ok(())
}

fn region_id_base() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Creates a table pre-split at `split_keys` (N keys -> N+1 regions whose
/// ranges daisy-chain to partition the whole key space). Fails fast with
/// `TableExists`; `NotAllMetaRegionsOnline` / `InsufficientServers` are the
/// retriable not-ready conditions.
pub async fn create_table(
    catalog: &CatalogTable,
    assignments: &mut AssignmentTable,
    registry: &ServerRegistry,
    min_servers: u32,
    schema: TableSchema,
    mut split_keys: Vec<Key>,
    meta_online: bool,
    now: Instant,
) -> Result<(), RangemasterError> {
    let table = schema.name.clone();
    check_not_protected(&table)?;
    if registry.num_servers() == 0
        || (registry.num_servers() as u32) < min_servers
    {
        return Err(RangemasterError::InsufficientServers);
    }
    if !meta_online {
        return Err(RangemasterError::NotAllMetaRegionsOnline);
    }

    // scan for the table's first possible row; any hit means it exists
    if !catalog
        .scan_meta(Some(&format!("{},", table)))
        .await?
        .is_empty()
    {
        return Err(RangemasterError::TableExists(table));
    }

    split_keys.sort();
    split_keys.dedup();
    split_keys.retain(|k| !k.is_empty());

    // daisy-chain the boundaries: empty start on the first, empty end on
    // the last
    let id_base = region_id_base();
    let mut regions = vec![];
    let mut start_key: Key = vec![];
    for (i, split_key) in split_keys.iter().enumerate() {
        regions.push(RegionInfo::new(
            schema.clone(),
            start_key.clone(),
            split_key.clone(),
            id_base + i as u64,
        ));
        start_key = split_key.clone();
    }
    regions.push(RegionInfo::new(
        schema.clone(),
        start_key,
        vec![],
        id_base + split_keys.len() as u64,
    ));

    catalog.insert_regions(&regions).await?;
    for region in regions {
        assignments.insert(region, now);
    }
    pf_info!("m"; "created table '{}'", table);
    Ok(())
}

/// Deletes a table: closes whatever is deployed and removes every region
/// from the catalog and the assignment table.
pub async fn delete_table(
    catalog: &CatalogTable,
    assignments: &mut AssignmentTable,
    registry: &mut ServerRegistry,
    table: &str,
    now: Instant,
) -> Result<(), RangemasterError> {
    check_not_protected(table)?;
    let rows = catalog.regions_of_table(table).await?;
    if rows.is_empty() {
        return Err(RangemasterError::TableNotFound(table.into()));
    }

    for row in rows {
        let region_name = row.region.region_name();
        if assignments.is_open(&region_name) {
            let holder = assignments.request_close(&region_name, now)?;
            registry.enqueue_directive(
                &holder,
                Directive::CloseRegion {
                    region: row.region.clone(),
                },
            );
        }
        assignments.remove(&region_name);
        catalog.remove_region(&row.region).await?;
    }
    pf_info!("m"; "deleted table '{}'", table);
    Ok(())
}

/// Disables (`enabled == false`) or re-enables a table: walks its regions,
/// flipping the offline markers. Disabling closes deployed regions; the
/// offline flag keeps them from being re-assigned.
pub async fn set_table_enabled(
    catalog: &CatalogTable,
    assignments: &mut AssignmentTable,
    registry: &mut ServerRegistry,
    table: &str,
    enabled: bool,
    now: Instant,
) -> Result<(), RangemasterError> {
    check_not_protected(table)?;
    let rows = catalog.regions_of_table(table).await?;
    if rows.is_empty() {
        return Err(RangemasterError::TableNotFound(table.into()));
    }

    for row in rows {
        let region_name = row.region.region_name();
        catalog.set_offline(&row.region, !enabled).await?;
        if enabled {
            assignments.set_enabled(&region_name, now)?;
        } else {
            assignments.offline(&region_name, now)?;
            if assignments.is_open(&region_name) {
                let holder = assignments.request_close(&region_name, now)?;
                registry.enqueue_directive(
                    &holder,
                    Directive::CloseRegion {
                        region: row.region.clone(),
                    },
                );
            }
        }
    }
    pf_info!("m"; "{} table '{}'",
             if enabled { "enabled" } else { "disabled" }, table);
    Ok(())
}

/// Applies column family additions/modifications/drops to a table's schema,
/// rewrites the schema snapshot of every region, and returns the reopen
/// progress tracker (regions pick the schema up when they reopen).
pub async fn alter_table(
    catalog: &CatalogTable,
    assignments: &mut AssignmentTable,
    table: &str,
    adds: Vec<FamilySchema>,
    mods: Vec<(String, FamilySchema)>,
    drops: Vec<String>,
) -> Result<AlterProgress, RangemasterError> {
    check_not_protected(table)?;
    let rows = catalog.regions_of_table(table).await?;
    if rows.is_empty() {
        return Err(RangemasterError::TableNotFound(table.into()));
    }

    let mut schema = rows[0].region.schema.clone();
    for add in adds {
        if schema.families.iter().any(|f| f.name == add.name) {
            return Err(RangemasterError::msg(format!(
                "family '{}' already exists in '{}'",
                add.name, table
            )));
        }
        schema.families.push(add);
    }
    for (name, modified) in mods {
        let family = schema
            .families
            .iter_mut()
            .find(|f| f.name == name)
            .ok_or_else(|| {
                RangemasterError::msg(format!(
                    "family '{}' not found in '{}'",
                    name, table
                ))
            })?;
        *family = modified;
    }
    for name in drops {
        if !schema.families.iter().any(|f| f.name == name) {
            return Err(RangemasterError::msg(format!(
                "family '{}' not found in '{}'",
                name, table
            )));
        }
        schema.families.retain(|f| f.name != name);
    }

    let updated = catalog.update_table_schema(table, &schema).await?;
    for region in &updated {
        assignments.update_region_info(region.clone());
    }

    let queued: Vec<String> =
        updated.iter().map(|r| r.region_name()).collect();
    let total = queued.len() as u32;
    pf_info!("m"; "altered table '{}'; {} regions to reopen", table, total);
    Ok(AlterProgress {
        queued,
        in_flight: HashSet::new(),
        total,
    })
}

/// Issues the next batch of close directives for an alter reopen, keeping
/// at most `throttle` regions of the table in transition at once.
pub fn drive_reopen(
    assignments: &mut AssignmentTable,
    registry: &mut ServerRegistry,
    progress: &mut AlterProgress,
    throttle: usize,
    now: Instant,
) {
    // forget regions that have finished their round trip
    let reopened: Vec<String> = progress
        .in_flight
        .iter()
        .filter(|name| assignments.is_open(name))
        .cloned()
        .collect();
    for name in reopened {
        progress.in_flight.remove(&name);
    }

    while progress.in_flight.len() < throttle {
        let Some(region_name) = progress.queued.pop() else {
            break;
        };
        if !assignments.is_open(&region_name) {
            // not deployed right now; it reopens with the new schema on
            // its own
            continue;
        }
        let region = assignments.get(&region_name).unwrap().region.clone();
        match assignments.request_close(&region_name, now) {
            Ok(holder) => {
                registry.enqueue_directive(
                    &holder,
                    Directive::CloseRegion { region },
                );
                progress.in_flight.insert(region_name);
            }
            Err(e) => {
                pf_warn!("m"; "reopen close of '{}' failed: {}",
                         region_name, e);
            }
        }
    }
}

/// Regions of a table with their current deployment, for admin clients.
pub async fn get_table_regions(
    catalog: &CatalogTable,
    table: &str,
) -> Result<Vec<(RegionInfo, Option<String>)>, RangemasterError> {
    let rows = catalog.regions_of_table(table).await?;
    if rows.is_empty() {
        return Err(RangemasterError::TableNotFound(table.into()));
    }
    Ok(rows
        .into_iter()
        .map(|row| (row.region, row.server))
        .collect())
}

/// The holder server name of a deployed region, from the assignment table.
fn open_holder(
    assignments: &AssignmentTable,
    region_name: &str,
) -> Option<String> {
    assignments
        .get(region_name)
        .filter(|e| e.state == RegionState::Open)
        .and_then(|e| e.server.clone())
}

/// Dispatches a region-or-table-scoped admin action.
pub async fn modify_table(
    catalog: &CatalogTable,
    assignments: &mut AssignmentTable,
    registry: &mut ServerRegistry,
    preferred: &mut PreferredPlacement,
    table: &str,
    action: TableAction,
    now: Instant,
) -> Result<(), RangemasterError> {
    match action {
        TableAction::Split { row } => {
            for (region, holder) in
                action_targets(catalog, assignments, table, row).await?
            {
                registry.enqueue_directive(
                    &holder,
                    Directive::SplitRegion {
                        region,
                        split_point: None,
                    },
                );
            }
            Ok(())
        }

        TableAction::Compact { row, major } => {
            for (region, holder) in
                action_targets(catalog, assignments, table, row).await?
            {
                registry.enqueue_directive(
                    &holder,
                    Directive::CompactRegion { region, major },
                );
            }
            Ok(())
        }

        TableAction::Flush { row } => {
            for (region, holder) in
                action_targets(catalog, assignments, table, row).await?
            {
                registry.enqueue_directive(
                    &holder,
                    Directive::FlushRegion { region },
                );
            }
            Ok(())
        }

        TableAction::ExplicitSplit { split_point } => {
            if split_point.is_empty() {
                return Err(RangemasterError::InvalidSplitPoint);
            }
            let rows = catalog.regions_of_table(table).await?;
            if rows.is_empty() {
                return Err(RangemasterError::TableNotFound(table.into()));
            }
            let target = rows
                .iter()
                .find(|r| r.region.contains_row(&split_point))
                .ok_or(RangemasterError::InvalidSplitPoint)?;
            // splitting exactly at a region boundary is also meaningless
            if target.region.start_key == split_point {
                return Err(RangemasterError::InvalidSplitPoint);
            }
            let region_name = target.region.region_name();
            let holder =
                open_holder(assignments, &region_name).ok_or_else(|| {
                    RangemasterError::msg(format!(
                        "region '{}' is not deployed",
                        region_name
                    ))
                })?;
            pf_info!("m"; "explicit split of '{}' at '{}'",
                     region_name, String::from_utf8_lossy(&split_point));
            registry.enqueue_directive(
                &holder,
                Directive::SplitRegion {
                    region: target.region.clone(),
                    split_point: Some(split_point),
                },
            );
            Ok(())
        }

        TableAction::MoveRegion { region_name, host } => {
            let row = lookup_region(catalog, &region_name).await?;
            // one-shot preference; honored by the next assignment
            preferred.record(region_name.clone(), host);
            close_region(
                catalog,
                assignments,
                registry,
                &row,
                None,
                now,
            )
            .await
        }

        TableAction::CloseRegion {
            region_name,
            server,
        } => {
            let row = lookup_region(catalog, &region_name).await?;
            close_region(catalog, assignments, registry, &row, server, now)
                .await
        }
    }
}

async fn lookup_region(
    catalog: &CatalogTable,
    region_name: &str,
) -> Result<CatalogRow, RangemasterError> {
    catalog.get_row(region_name).await?.ok_or_else(|| {
        RangemasterError::msg(format!("unknown region '{}'", region_name))
    })
}

/// Resolves the deployed regions an action addresses: the single region
/// containing `row` if given, else every deployed region of the table.
async fn action_targets(
    catalog: &CatalogTable,
    assignments: &AssignmentTable,
    table: &str,
    row: Option<Key>,
) -> Result<Vec<(RegionInfo, String)>, RangemasterError> {
    let rows = catalog.regions_of_table(table).await?;
    if rows.is_empty() {
        return Err(RangemasterError::TableNotFound(table.into()));
    }
    let mut targets = vec![];
    for catalog_row in rows {
        if let Some(key) = &row {
            if !catalog_row.region.contains_row(key) {
                continue;
            }
        }
        let region_name = catalog_row.region.region_name();
        if let Some(holder) = open_holder(assignments, &region_name) {
            targets.push((catalog_row.region, holder));
        }
    }
    Ok(targets)
}

/// Closes a region wherever it is: takes it out of any stuck transition,
/// asks the holder to close, and wipes the catalog row's deployment
/// columns so nothing re-discovers the old location.
async fn close_region(
    catalog: &CatalogTable,
    assignments: &mut AssignmentTable,
    registry: &mut ServerRegistry,
    row: &CatalogRow,
    server: Option<String>,
    now: Instant,
) -> Result<(), RangemasterError> {
    let region_name = row.region.region_name();
    if assignments.is_open(&region_name) {
        let holder = server.unwrap_or(
            assignments.request_close(&region_name, now)?,
        );
        pf_info!("m"; "marking '{}' as closing on '{}'",
                 region_name, holder);
        registry.enqueue_directive(
            &holder,
            Directive::CloseRegion {
                region: row.region.clone(),
            },
        );
    } else {
        // stuck somewhere in transition; put it back to square one
        assignments.clear_in_transition(&region_name, now);
    }
    catalog.update_location(&row.region, None).await
}

#[cfg(test)]
mod tableops_tests {
    use super::*;
    use crate::dfs::{Dfs, LocalDfs};
    use crate::master::registry::{ServerInfo, ServerLoad};
    use std::sync::Arc;

    struct Fixture {
        catalog: CatalogTable,
        assignments: AssignmentTable,
        registry: ServerRegistry,
        preferred: PreferredPlacement,
        _tmp: tempfile::TempDir,
    }

    fn rs(host: &str) -> ServerInfo {
        ServerInfo {
            host: host.into(),
            port: 7001,
            start_code: 1,
            load: ServerLoad::default(),
        }
    }

    async fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let dfs: Arc<dyn Dfs> = Arc::new(LocalDfs::default());
        let catalog =
            CatalogTable::new(dfs, tmp.path().to_path_buf());
        catalog.bootstrap().await.unwrap();
        let mut registry = ServerRegistry::new();
        registry.record_startup(rs("rs1"), Instant::now());
        Fixture {
            catalog,
            assignments: AssignmentTable::new(),
            registry,
            preferred: PreferredPlacement::default(),
            _tmp: tmp,
        }
    }

    /// Creates table "t" split at the given keys and opens all regions on
    /// rs1.
    async fn create_and_open(
        fx: &mut Fixture,
        split_keys: Vec<Key>,
    ) -> Vec<String> {
        let now = Instant::now();
        create_table(
            &fx.catalog,
            &mut fx.assignments,
            &fx.registry,
            1,
            TableSchema::new("t"),
            split_keys,
            true,
            now,
        )
        .await
        .unwrap();
        let names: Vec<String> = fx
            .assignments
            .entries_of_table("t")
            .iter()
            .map(|e| e.region.region_name())
            .collect();
        for name in &names {
            fx.assignments.assign(name, "rs1,7001,1", now).unwrap();
            fx.assignments.opened(name, "rs1,7001,1", now).unwrap();
        }
        names
    }

    #[tokio::test]
    async fn create_partitions_key_space() -> Result<(), RangemasterError> {
        let mut fx = fixture().await;
        let now = Instant::now();
        create_table(
            &fx.catalog,
            &mut fx.assignments,
            &fx.registry,
            1,
            TableSchema::new("t"),
            vec![b"g".to_vec(), b"p".to_vec()],
            true,
            now,
        )
        .await?;

        let rows = fx.catalog.regions_of_table("t").await?;
        assert_eq!(rows.len(), 3);
        // [-inf, g), [g, p), [p, +inf) partition the key space
        assert_eq!(rows[0].region.start_key, b"".to_vec());
        assert_eq!(rows[0].region.end_key, b"g".to_vec());
        assert_eq!(rows[1].region.start_key, b"g".to_vec());
        assert_eq!(rows[1].region.end_key, b"p".to_vec());
        assert_eq!(rows[2].region.start_key, b"p".to_vec());
        assert_eq!(rows[2].region.end_key, b"".to_vec());

        // second create fails fast
        let err = create_table(
            &fx.catalog,
            &mut fx.assignments,
            &fx.registry,
            1,
            TableSchema::new("t"),
            vec![],
            true,
            now,
        )
        .await
        .unwrap_err();
        assert_eq!(err, RangemasterError::TableExists("t".into()));
        Ok(())
    }

    #[tokio::test]
    async fn create_checks_readiness() -> Result<(), RangemasterError> {
        let mut fx = fixture().await;
        let now = Instant::now();
        let err = create_table(
            &fx.catalog,
            &mut fx.assignments,
            &fx.registry,
            1,
            TableSchema::new("t"),
            vec![],
            false,
            now,
        )
        .await
        .unwrap_err();
        assert_eq!(err, RangemasterError::NotAllMetaRegionsOnline);

        // server shortage outranks catalog state in the error report
        let empty_registry = ServerRegistry::new();
        let err = create_table(
            &fx.catalog,
            &mut fx.assignments,
            &empty_registry,
            1,
            TableSchema::new("t"),
            vec![],
            false,
            now,
        )
        .await
        .unwrap_err();
        assert_eq!(err, RangemasterError::InsufficientServers);

        for protected in [ROOT_TABLE_NAME, META_TABLE_NAME] {
            let err = create_table(
                &fx.catalog,
                &mut fx.assignments,
                &fx.registry,
                1,
                TableSchema::new(protected),
                vec![],
                true,
                now,
            )
            .await
            .unwrap_err();
            assert!(matches!(err, RangemasterError::ProtectedTable(_)));
        }
        Ok(())
    }

    #[tokio::test]
    async fn disable_enable_cycle() -> Result<(), RangemasterError> {
        let mut fx = fixture().await;
        let names = create_and_open(&mut fx, vec![b"g".to_vec()]).await;
        let now = Instant::now();

        set_table_enabled(
            &fx.catalog,
            &mut fx.assignments,
            &mut fx.registry,
            "t",
            false,
            now,
        )
        .await?;
        // both regions got close directives and are marked offline
        for name in &names {
            let entry = fx.assignments.get(name).unwrap();
            assert!(entry.region.offline);
            assert_eq!(entry.state, RegionState::PendingClose);
            fx.assignments.closed(name, now)?;
            assert_eq!(
                fx.assignments.get(name).unwrap().state,
                RegionState::Offline
            );
        }
        // offline regions never become assignable
        assert!(fx.assignments.unassigned_ready(now).is_empty());

        set_table_enabled(
            &fx.catalog,
            &mut fx.assignments,
            &mut fx.registry,
            "t",
            true,
            now,
        )
        .await?;
        assert_eq!(fx.assignments.unassigned_ready(now).len(), 2);

        // catalog tables are protected from both
        for protected in [ROOT_TABLE_NAME, META_TABLE_NAME] {
            let err = set_table_enabled(
                &fx.catalog,
                &mut fx.assignments,
                &mut fx.registry,
                protected,
                false,
                now,
            )
            .await
            .unwrap_err();
            assert!(matches!(err, RangemasterError::ProtectedTable(_)));
        }
        Ok(())
    }

    #[tokio::test]
    async fn delete_removes_everything() -> Result<(), RangemasterError> {
        let mut fx = fixture().await;
        create_and_open(&mut fx, vec![]).await;
        let now = Instant::now();

        delete_table(
            &fx.catalog,
            &mut fx.assignments,
            &mut fx.registry,
            "t",
            now,
        )
        .await?;
        assert!(fx.catalog.regions_of_table("t").await?.is_empty());
        assert!(fx.assignments.entries_of_table("t").is_empty());

        let err = delete_table(
            &fx.catalog,
            &mut fx.assignments,
            &mut fx.registry,
            "t",
            now,
        )
        .await
        .unwrap_err();
        assert_eq!(err, RangemasterError::TableNotFound("t".into()));
        Ok(())
    }

    #[tokio::test]
    async fn alter_updates_schema_and_reopens(
    ) -> Result<(), RangemasterError> {
        let mut fx = fixture().await;
        let names =
            create_and_open(&mut fx, vec![b"g".to_vec(), b"p".to_vec()])
                .await;
        let now = Instant::now();

        let mut progress = alter_table(
            &fx.catalog,
            &mut fx.assignments,
            "t",
            vec![FamilySchema::new("extra")],
            vec![],
            vec![],
        )
        .await?;
        assert_eq!(progress.status(), (3, 3));
        let rows = fx.catalog.regions_of_table("t").await?;
        assert!(rows.iter().all(|r| r
            .region
            .schema
            .families
            .iter()
            .any(|f| f.name == "extra")));

        // throttle of 2: only two closes in flight at once
        drive_reopen(
            &mut fx.assignments,
            &mut fx.registry,
            &mut progress,
            2,
            now,
        );
        assert_eq!(progress.status(), (3, 3));
        let closing: Vec<&String> = names
            .iter()
            .filter(|n| {
                fx.assignments.get(n).unwrap().state
                    == RegionState::PendingClose
            })
            .collect();
        assert_eq!(closing.len(), 2);

        // complete one round trip; the third close goes out
        let finished = closing[0].clone();
        fx.assignments.closed(&finished, now)?;
        fx.assignments.assign(&finished, "rs1,7001,1", now)?;
        fx.assignments.opened(&finished, "rs1,7001,1", now)?;
        drive_reopen(
            &mut fx.assignments,
            &mut fx.registry,
            &mut progress,
            2,
            now,
        );
        assert_eq!(progress.status(), (2, 3));
        Ok(())
    }

    #[tokio::test]
    async fn explicit_split_validates_range(
    ) -> Result<(), RangemasterError> {
        let mut fx = fixture().await;
        // single region [a, m)
        let now = Instant::now();
        create_table(
            &fx.catalog,
            &mut fx.assignments,
            &fx.registry,
            1,
            TableSchema::new("t"),
            vec![],
            true,
            now,
        )
        .await?;
        // shrink to [a, m) by replacing the region with explicit bounds
        let rows = fx.catalog.regions_of_table("t").await?;
        let full = rows[0].region.clone();
        fx.catalog.remove_region(&full).await?;
        fx.assignments.remove(&full.region_name());
        let bounded = RegionInfo::new(
            TableSchema::new("t"),
            b"a".to_vec(),
            b"m".to_vec(),
            full.region_id,
        );
        fx.catalog
            .insert_regions(std::slice::from_ref(&bounded))
            .await?;
        fx.assignments.insert(bounded.clone(), now);
        let name = bounded.region_name();
        fx.assignments.assign(&name, "rs1,7001,1", now)?;
        fx.assignments.opened(&name, "rs1,7001,1", now)?;

        modify_table(
            &fx.catalog,
            &mut fx.assignments,
            &mut fx.registry,
            &mut fx.preferred,
            "t",
            TableAction::ExplicitSplit {
                split_point: b"g".to_vec(),
            },
            now,
        )
        .await?;
        let directives = fx
            .registry
            .record_report(&rs("rs1"), now)
            .unwrap();
        assert!(directives.iter().any(|d| matches!(
            d,
            Directive::SplitRegion { split_point: Some(p), .. }
                if p == b"g"
        )));

        // outside the region's range
        let err = modify_table(
            &fx.catalog,
            &mut fx.assignments,
            &mut fx.registry,
            &mut fx.preferred,
            "t",
            TableAction::ExplicitSplit {
                split_point: b"z".to_vec(),
            },
            now,
        )
        .await
        .unwrap_err();
        assert_eq!(err, RangemasterError::InvalidSplitPoint);
        Ok(())
    }

    #[tokio::test]
    async fn move_region_records_one_shot() -> Result<(), RangemasterError> {
        let mut fx = fixture().await;
        let names = create_and_open(&mut fx, vec![]).await;
        let now = Instant::now();

        modify_table(
            &fx.catalog,
            &mut fx.assignments,
            &mut fx.registry,
            &mut fx.preferred,
            "t",
            TableAction::MoveRegion {
                region_name: names[0].clone(),
                host: "rs3".into(),
            },
            now,
        )
        .await?;
        // close went to the current holder
        let entry = fx.assignments.get(&names[0]).unwrap();
        assert_eq!(entry.state, RegionState::PendingClose);
        // deployment columns wiped
        let row = fx.catalog.get_row(&names[0]).await?.unwrap();
        assert_eq!(row.server, None);
        Ok(())
    }
}
