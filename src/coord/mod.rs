//! Coordination store client: session/ephemeral-node/watch seam, the
//! in-process implementation used by tests and local mode, the ZooKeeper
//! binding, and the typed path-layout wrapper.

mod client;
mod store;
mod zk;

pub use client::{CoordClient, CoordPaths};
pub use store::{CoordEvent, CoordStore, MemCoord};
pub use zk::ZkCoord;
