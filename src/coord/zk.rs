//! ZooKeeper-backed coordination store session.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::time::Duration;
use tokio_zookeeper::{
    error as zk_error, Acl, CreateMode, KeeperState, WatchedEventType,
    ZooKeeper, ZooKeeperBuilder,
};

use crate::coord::store::{CoordEvent, CoordStore};
use crate::utils::RangemasterError;

/// Capacity of the forwarded event channel.
const EVENT_CHAN_CAP: usize = 1024;

/// ZooKeeper session wrapper implementing the coordination store seam. One
/// value is one ZooKeeper session; ephemerals die with it.
pub struct ZkCoord {
    /// Current connected ZooKeeper session.
    session: ZooKeeper,

    /// Fan-out of the session's default watcher stream.
    events: Arc<broadcast::Sender<CoordEvent>>,
}

impl ZkCoord {
    /// Connects to the given ZooKeeper server and spawns the watcher
    /// forwarding task.
    pub async fn connect(
        server_addr: SocketAddr,
        expiry: Duration,
    ) -> Result<Self, RangemasterError> {
        let mut builder = ZooKeeperBuilder::default();
        if !expiry.is_zero() {
            builder.set_timeout(expiry);
        }

        let (zk, default_watcher) = builder
            .connect(&server_addr)
            .await
            .map_err(RangemasterError::msg)?;

        let (tx, _rx) = broadcast::channel(EVENT_CHAN_CAP);
        let events = Arc::new(tx);
        let events_ref = events.clone();
        tokio::spawn(async move {
            futures::pin_mut!(default_watcher);
            while let Some(event) = default_watcher.next().await {
                let mapped = match event.event_type {
                    WatchedEventType::NodeCreated => {
                        Some(CoordEvent::NodeCreated(event.path.clone()))
                    }
                    WatchedEventType::NodeDeleted => {
                        Some(CoordEvent::NodeDeleted(event.path.clone()))
                    }
                    WatchedEventType::NodeDataChanged => {
                        Some(CoordEvent::NodeDataChanged(event.path.clone()))
                    }
                    WatchedEventType::None => match event.keeper_state {
                        KeeperState::Expired => {
                            Some(CoordEvent::SessionExpired)
                        }
                        KeeperState::Disconnected => {
                            Some(CoordEvent::Disconnected)
                        }
                        KeeperState::SyncConnected => {
                            Some(CoordEvent::Reconnected)
                        }
                        _ => None,
                    },
                    _ => None,
                };
                if let Some(ev) = mapped {
                    let expired = ev == CoordEvent::SessionExpired;
                    let _ = events_ref.send(ev); // receivers may be gone
                    if expired {
                        break;
                    }
                }
            }
        });

        Ok(ZkCoord { session: zk, events })
    }

    /// Creates all missing ancestors of `path` as persistent nodes.
    async fn create_parents(
        &self,
        path: &str,
    ) -> Result<(), RangemasterError> {
        let mut prefix = String::new();
        let parts: Vec<&str> =
            path.trim_matches('/').split('/').collect();
        for part in &parts[..parts.len().saturating_sub(1)] {
            prefix.push('/');
            prefix.push_str(part);
            self.session
                .create(
                    &prefix,
                    &b""[..],
                    Acl::open_unsafe(),
                    CreateMode::Persistent,
                )
                .await
                .map_err(RangemasterError::msg)?
                .or_else(|e| {
                    if let zk_error::Create::NodeExists = e {
                        Ok(prefix.clone())
                    } else {
                        Err(RangemasterError::msg(e))
                    }
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl CoordStore for ZkCoord {
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        ephemeral: bool,
    ) -> Result<bool, RangemasterError> {
        self.create_parents(path).await?;
        let mode = if ephemeral {
            CreateMode::Ephemeral
        } else {
            CreateMode::Persistent
        };
        match self
            .session
            .create(path, data, Acl::open_unsafe(), mode)
            .await
            .map_err(RangemasterError::msg)?
        {
            Ok(_) => Ok(true),
            Err(zk_error::Create::NodeExists) => Ok(false),
            Err(e) => Err(RangemasterError::msg(e)),
        }
    }

    async fn read(
        &self,
        path: &str,
    ) -> Result<Option<(Vec<u8>, i32)>, RangemasterError> {
        let data = self
            .session
            .get_data(path)
            .await
            .map_err(RangemasterError::msg)?;
        Ok(data.map(|(bytes, stat)| (bytes, stat.version)))
    }

    async fn write(
        &self,
        path: &str,
        data: Vec<u8>,
    ) -> Result<(), RangemasterError> {
        let result = self
            .session
            .set_data(path, None, data.clone()) // any version allowed
            .await
            .map_err(RangemasterError::msg)?;

        if let Err(zk_error::SetData::NoNode) = result {
            // node does not exist yet, create with value as initial data
            self.create(path, data, false).await?;
        } else {
            // all other errors are returned directly
            result.map_err(RangemasterError::msg)?;
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<bool, RangemasterError> {
        match self
            .session
            .delete(path, None) // any version allowed
            .await
            .map_err(RangemasterError::msg)?
        {
            Ok(()) => Ok(true),
            Err(zk_error::Delete::NoNode) => Ok(false),
            Err(e) => Err(RangemasterError::msg(e)),
        }
    }

    async fn list(
        &self,
        path: &str,
    ) -> Result<Vec<String>, RangemasterError> {
        let children = self
            .session
            .get_children(path)
            .await
            .map_err(RangemasterError::msg)?;
        Ok(children.unwrap_or_default())
    }

    async fn watch(&self, path: &str) -> Result<(), RangemasterError> {
        // register a one-shot existence watch; the triggered event arrives
        // on the default watcher stream and is forwarded to subscribers
        self.session
            .watch()
            .exists(path)
            .await
            .map_err(RangemasterError::msg)?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CoordEvent> {
        self.events.subscribe()
    }
}
