//! Typed wrapper over a coordination store session: the well-known path
//! layout plus bounded-retry semantics for all master-initiated operations.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::{self, Duration};

use crate::coord::store::{CoordEvent, CoordStore};
use crate::utils::RangemasterError;

/// Well-known coordination store layout.
#[derive(Debug, Clone)]
pub struct CoordPaths {
    /// Base path all cluster nodes live under.
    pub base: String,
}

impl Default for CoordPaths {
    fn default() -> Self {
        CoordPaths {
            base: "/rangemaster".into(),
        }
    }
}

impl CoordPaths {
    /// Ephemeral node holding the active master's RPC address.
    pub fn master(&self) -> String {
        format!("{}/master", self.base)
    }

    /// Directory of per-region-server ephemeral nodes.
    pub fn rs_dir(&self) -> String {
        format!("{}/rs", self.base)
    }

    /// Ephemeral node of one region server.
    pub fn rs(&self, server_name: &str) -> String {
        format!("{}/rs/{}", self.base, server_name)
    }

    /// Node holding the root region's server address.
    pub fn root_region_server(&self) -> String {
        format!("{}/root-region-server", self.base)
    }

    /// Flag node whose presence signals cluster-wide drain.
    pub fn shutdown(&self) -> String {
        format!("{}/shutdown", self.base)
    }

    /// Transient marker for a region in transition.
    pub fn unassigned(&self, region_name: &str) -> String {
        format!("{}/unassigned/{}", self.base, region_name)
    }
}

/// Thin typed client over a coordination store session. Operations retry up
/// to `retries` times spaced by `sleep_interval` before giving up with
/// `CoordUnavailable`.
pub struct CoordClient {
    store: Arc<dyn CoordStore>,
    pub paths: CoordPaths,
    retries: u32,
    sleep_interval: Duration,
}

// small retry helper over an async operation expression
macro_rules! coord_retried {
    ($self:ident, $opname:literal, $op:expr) => {{
        let mut tries = 0;
        loop {
            match $op {
                Ok(v) => break Ok(v),
                Err(e) if tries < $self.retries => {
                    tries += 1;
                    pf_warn!("m"; "coord {} failed (try {}): {}",
                             $opname, tries, e);
                    time::sleep($self.sleep_interval).await;
                }
                Err(e) => {
                    break Err(RangemasterError::CoordUnavailable(
                        e.to_string(),
                    ))
                }
            }
        }
    }};
}

impl CoordClient {
    /// Wraps a connected store session.
    pub fn new(
        store: Arc<dyn CoordStore>,
        paths: CoordPaths,
        retries: u32,
        sleep_interval: Duration,
    ) -> Self {
        CoordClient {
            store,
            paths,
            retries,
            sleep_interval,
        }
    }

    /// Creates an ephemeral node; `false` means someone else holds the path.
    pub async fn create_ephemeral(
        &self,
        path: &str,
        data: &[u8],
    ) -> Result<bool, RangemasterError> {
        coord_retried!(
            self,
            "create_ephemeral",
            self.store.create(path, data.to_vec(), true).await
        )
    }

    /// Reads a node's data and version.
    pub async fn read(
        &self,
        path: &str,
    ) -> Result<Option<(Vec<u8>, i32)>, RangemasterError> {
        coord_retried!(self, "read", self.store.read(path).await)
    }

    /// Writes a node's data, creating the (persistent) node if missing.
    pub async fn write(
        &self,
        path: &str,
        data: &[u8],
    ) -> Result<(), RangemasterError> {
        coord_retried!(
            self,
            "write",
            self.store.write(path, data.to_vec()).await
        )
    }

    /// Deletes a node if present.
    pub async fn delete(&self, path: &str) -> Result<bool, RangemasterError> {
        coord_retried!(self, "delete", self.store.delete(path).await)
    }

    /// Lists child names under a path.
    pub async fn list(
        &self,
        path: &str,
    ) -> Result<Vec<String>, RangemasterError> {
        coord_retried!(self, "list", self.store.list(path).await)
    }

    /// Registers a one-shot watch on a path.
    pub async fn watch(&self, path: &str) -> Result<(), RangemasterError> {
        coord_retried!(self, "watch", self.store.watch(path).await)
    }

    /// Subscribes to session/node events.
    pub fn session_events(&self) -> broadcast::Receiver<CoordEvent> {
        self.store.subscribe()
    }

    // ---- typed layout helpers ----

    /// Scans the region-server directory; returns registered server names.
    pub async fn scan_rs_dir(&self) -> Result<Vec<String>, RangemasterError> {
        self.list(&self.paths.rs_dir()).await
    }

    /// Reads the root region's server address, if published.
    pub async fn read_root_location(
        &self,
    ) -> Result<Option<String>, RangemasterError> {
        let path = self.paths.root_region_server();
        match self.read(&path).await? {
            Some((data, _)) => Ok(Some(String::from_utf8(data)?)),
            None => Ok(None),
        }
    }

    /// Publishes (or clears, with `None`) the root region's server address.
    pub async fn write_root_location(
        &self,
        server: Option<&str>,
    ) -> Result<(), RangemasterError> {
        let path = self.paths.root_region_server();
        match server {
            Some(addr) => self.write(&path, addr.as_bytes()).await,
            None => self.delete(&path).await.map(|_| ()),
        }
    }

    /// Raises or lowers the cluster-wide shutdown flag.
    pub async fn set_cluster_shutdown(
        &self,
        draining: bool,
    ) -> Result<(), RangemasterError> {
        let path = self.paths.shutdown();
        if draining {
            self.write(&path, b"").await
        } else {
            self.delete(&path).await.map(|_| ())
        }
    }

    /// Places the transient in-transition marker for a region.
    pub async fn mark_unassigned(
        &self,
        region_name: &str,
    ) -> Result<(), RangemasterError> {
        self.write(&self.paths.unassigned(region_name), b"").await
    }

    /// Clears the transient in-transition marker for a region.
    pub async fn clear_unassigned(
        &self,
        region_name: &str,
    ) -> Result<(), RangemasterError> {
        self.delete(&self.paths.unassigned(region_name))
            .await
            .map(|_| ())
    }
}
