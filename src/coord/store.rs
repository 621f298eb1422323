//! Coordination store trait and the in-process implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::utils::RangemasterError;

/// Capacity of per-session event channels. Events are coarse (node changes,
/// session state); a lagging consumer is treated as disconnected.
const EVENT_CHAN_CAP: usize = 1024;

/// Events surfaced by a coordination store session. Node events are one
/// stream with watch registration semantics left to the backend; session
/// events tell the consumer about its own session health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordEvent {
    /// A node appeared at path.
    NodeCreated(String),

    /// A node vanished from path (deleted or its owner session expired).
    NodeDeleted(String),

    /// A node's data changed at path.
    NodeDataChanged(String),

    /// My session is gone; all my ephemerals are gone with it. Fatal to a
    /// master holding the lock.
    SessionExpired,

    /// Transport to the store hiccuped; session may still be alive.
    Disconnected,

    /// Transport re-established.
    Reconnected,
}

/// Abstraction over the coordination service. One value of this trait is one
/// *session*: ephemeral nodes created through it die with it.
#[async_trait]
pub trait CoordStore: Send + Sync {
    /// Creates a node. Returns `false` if the path already exists. With
    /// `ephemeral`, the node is tied to this session's lifetime.
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        ephemeral: bool,
    ) -> Result<bool, RangemasterError>;

    /// Reads a node. Returns `None` if the path does not exist, else the
    /// data and its version counter.
    async fn read(
        &self,
        path: &str,
    ) -> Result<Option<(Vec<u8>, i32)>, RangemasterError>;

    /// Writes a node's data, creating a persistent node if missing.
    async fn write(
        &self,
        path: &str,
        data: Vec<u8>,
    ) -> Result<(), RangemasterError>;

    /// Deletes a node. Returns `false` if the path did not exist.
    async fn delete(&self, path: &str) -> Result<bool, RangemasterError>;

    /// Lists the child names (not full paths) under a path.
    async fn list(&self, path: &str)
        -> Result<Vec<String>, RangemasterError>;

    /// Registers interest in a path so that its next change is delivered on
    /// the event stream. Backends that broadcast all changes may treat this
    /// as a no-op.
    async fn watch(&self, path: &str) -> Result<(), RangemasterError>;

    /// Subscribes to this session's event stream.
    fn subscribe(&self) -> broadcast::Receiver<CoordEvent>;
}

/// One node in the in-process store.
#[derive(Debug, Clone)]
struct MemNode {
    data: Vec<u8>,
    version: i32,
    /// Owning session ID if ephemeral.
    owner: Option<u64>,
}

/// Shared state of the in-process store hub.
#[derive(Default)]
struct MemState {
    nodes: BTreeMap<String, MemNode>,
    sessions: HashMap<u64, broadcast::Sender<CoordEvent>>,
    next_session: u64,
}

impl MemState {
    /// Broadcasts a node event to every live session.
    fn publish(&self, ev: CoordEvent) {
        for tx in self.sessions.values() {
            let _ = tx.send(ev.clone()); // receivers may have dropped
        }
    }
}

/// In-process coordination store used by tests and single-process
/// deployments. Every node change is broadcast to all sessions, so `watch`
/// registration is a no-op.
#[derive(Clone, Default)]
pub struct MemCoord {
    state: Arc<Mutex<MemState>>,
}

impl MemCoord {
    /// Creates a new empty in-process store hub.
    pub fn new() -> Self {
        MemCoord {
            state: Arc::new(Mutex::new(MemState::default())),
        }
    }

    /// Opens a new session on this hub.
    pub fn session(&self) -> MemCoordSession {
        let (tx, _rx) = broadcast::channel(EVENT_CHAN_CAP);
        let mut state = self.state.lock().unwrap();
        let id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(id, tx.clone());
        MemCoordSession {
            id,
            state: self.state.clone(),
            events: tx,
        }
    }

    /// Expires a session: drops all its ephemerals (publishing deletion
    /// events) and tells the session itself that it is gone. Test hook for
    /// simulating session timeouts.
    pub fn expire_session(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        let doomed: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, n)| n.owner == Some(id))
            .map(|(p, _)| p.clone())
            .collect();
        for path in doomed {
            state.nodes.remove(&path);
            state.publish(CoordEvent::NodeDeleted(path));
        }
        if let Some(tx) = state.sessions.remove(&id) {
            let _ = tx.send(CoordEvent::SessionExpired);
        }
    }
}

/// One session on the in-process store.
#[derive(Clone)]
pub struct MemCoordSession {
    id: u64,
    state: Arc<Mutex<MemState>>,
    events: broadcast::Sender<CoordEvent>,
}

impl MemCoordSession {
    /// This session's ID (for test hooks that expire it).
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl CoordStore for MemCoordSession {
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        ephemeral: bool,
    ) -> Result<bool, RangemasterError> {
        let mut state = self.state.lock().unwrap();
        if !state.sessions.contains_key(&self.id) {
            return Err(RangemasterError::CoordUnavailable(
                "session expired".into(),
            ));
        }
        if state.nodes.contains_key(path) {
            return Ok(false);
        }
        state.nodes.insert(
            path.into(),
            MemNode {
                data,
                version: 0,
                owner: if ephemeral { Some(self.id) } else { None },
            },
        );
        state.publish(CoordEvent::NodeCreated(path.into()));
        Ok(true)
    }

    async fn read(
        &self,
        path: &str,
    ) -> Result<Option<(Vec<u8>, i32)>, RangemasterError> {
        let state = self.state.lock().unwrap();
        Ok(state.nodes.get(path).map(|n| (n.data.clone(), n.version)))
    }

    async fn write(
        &self,
        path: &str,
        data: Vec<u8>,
    ) -> Result<(), RangemasterError> {
        let mut state = self.state.lock().unwrap();
        if let Some(node) = state.nodes.get_mut(path) {
            node.data = data;
            node.version += 1;
            state.publish(CoordEvent::NodeDataChanged(path.into()));
        } else {
            state.nodes.insert(
                path.into(),
                MemNode {
                    data,
                    version: 0,
                    owner: None,
                },
            );
            state.publish(CoordEvent::NodeCreated(path.into()));
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<bool, RangemasterError> {
        let mut state = self.state.lock().unwrap();
        if state.nodes.remove(path).is_some() {
            state.publish(CoordEvent::NodeDeleted(path.into()));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn list(
        &self,
        path: &str,
    ) -> Result<Vec<String>, RangemasterError> {
        let state = self.state.lock().unwrap();
        let prefix = format!("{}/", path.trim_end_matches('/'));
        Ok(state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter_map(|(p, _)| {
                let rest = &p[prefix.len()..];
                if rest.is_empty() || rest.contains('/') {
                    None // only direct children
                } else {
                    Some(rest.to_string())
                }
            })
            .collect())
    }

    async fn watch(&self, _path: &str) -> Result<(), RangemasterError> {
        Ok(()) // all changes are broadcast anyway
    }

    fn subscribe(&self) -> broadcast::Receiver<CoordEvent> {
        self.events.subscribe()
    }
}
