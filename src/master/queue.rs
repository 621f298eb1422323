//! Serialized operation queue driving the main loop: one bounded FIFO of
//! typed items, exactly one consumer, delay-aware requeueing of transient
//! failures.

use std::collections::VecDeque;

use tokio::sync::Notify;
use tokio::time::{self, Duration, Instant};

use crate::api::{AdminRequest, ClientId, RsMsg};
use crate::catalog::RegionInfo;
use crate::master::registry::{ServerInfo, ServerName};
use crate::utils::RangemasterError;

/// One operation for the main loop. Each variant carries its own typed
/// payload; there is no untyped argument array anywhere.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationItem {
    /// A region server ran its startup handshake.
    ServerStartup { info: ServerInfo },

    /// A region server heartbeat arrived.
    ServerReport {
        info: ServerInfo,
        msgs: Vec<RsMsg>,
        hot_regions: Vec<RegionInfo>,
    },

    /// A region server is dead; recover its logs and regions.
    ServerDeath { server_name: ServerName },

    /// A server finished opening a region.
    RegionOpened {
        region: RegionInfo,
        server_name: ServerName,
    },

    /// A server finished closing a region.
    RegionClosed { region: RegionInfo },

    /// A server split a region into two daughters.
    RegionSplit {
        parent: RegionInfo,
        daughters: Box<(RegionInfo, RegionInfo)>,
    },

    /// An admin RPC to execute on the loop thread.
    AdminAction {
        client: ClientId,
        request: AdminRequest,
    },
}

/// Result of processing one operation.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ProcessOutcome {
    /// Operation handled.
    Processed,

    /// Nothing to do.
    Noop,

    /// Transient failure; the item went back to the tail.
    Requeued,

    /// Transient failure that smells like infrastructure trouble; caller
    /// should verify the DFS before continuing.
    RequeuedButProblem,

    /// Attempts exhausted (or unrecoverable); the loop must exit.
    Failed,
}

/// A queued operation with its retry accounting.
#[derive(Debug)]
pub struct QueuedOp {
    /// The operation.
    pub item: OperationItem,

    /// Requeue count so far.
    pub attempts: u32,

    /// Not eligible for popping before this instant.
    pub ready_at: Instant,
}

/// The bounded, delay-aware FIFO. Single consumer: the main loop.
#[derive(Debug)]
pub struct OperationQueue {
    deque: VecDeque<QueuedOp>,
    notify: Notify,
    capacity: usize,
    max_attempts: u32,
}

impl OperationQueue {
    /// Creates a queue with the given capacity and requeue budget.
    pub fn new(capacity: usize, max_attempts: u32) -> Self {
        OperationQueue {
            deque: VecDeque::new(),
            notify: Notify::new(),
            capacity,
            max_attempts,
        }
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.deque.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.deque.is_empty()
    }

    /// Enqueues a fresh operation at the tail.
    pub fn push(
        &mut self,
        item: OperationItem,
    ) -> Result<(), RangemasterError> {
        if self.deque.len() >= self.capacity {
            return Err(RangemasterError::msg(format!(
                "operation queue full ({} items)",
                self.capacity
            )));
        }
        self.deque.push_back(QueuedOp {
            item,
            attempts: 0,
            ready_at: Instant::now(),
        });
        self.notify.notify_one();
        Ok(())
    }

    /// Requeues a transiently-failed operation at the tail with the given
    /// delay, or reports `Failed` once its attempts budget is spent.
    pub fn requeue(
        &mut self,
        mut op: QueuedOp,
        delay: Duration,
        problem: bool,
    ) -> ProcessOutcome {
        op.attempts += 1;
        if op.attempts > self.max_attempts {
            pf_error!("m"; "operation failed after {} attempts: {:?}",
                      op.attempts, op.item);
            return ProcessOutcome::Failed;
        }
        op.ready_at = Instant::now() + delay;
        self.deque.push_back(op);
        self.notify.notify_one();
        if problem {
            ProcessOutcome::RequeuedButProblem
        } else {
            ProcessOutcome::Requeued
        }
    }

    /// Pops the first *ready* operation, waiting as long as necessary.
    /// Ordering: among ready items, enqueue order; delayed items become
    /// eligible at their `ready_at`. Cancellation-safe.
    pub async fn pop(&mut self) -> QueuedOp {
        loop {
            let now = Instant::now();
            if let Some(pos) =
                self.deque.iter().position(|op| op.ready_at <= now)
            {
                return self.deque.remove(pos).unwrap();
            }
            let next_ready =
                self.deque.iter().map(|op| op.ready_at).min();
            match next_ready {
                Some(at) => {
                    tokio::select! {
                        _ = time::sleep_until(at) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }
}

#[cfg(test)]
mod queue_tests {
    use super::*;

    fn death(name: &str) -> OperationItem {
        OperationItem::ServerDeath {
            server_name: name.into(),
        }
    }

    #[tokio::test]
    async fn fifo_order() -> Result<(), RangemasterError> {
        let mut queue = OperationQueue::new(16, 2);
        queue.push(death("a"))?;
        queue.push(death("b"))?;
        assert_eq!(queue.pop().await.item, death("a"));
        assert_eq!(queue.pop().await.item, death("b"));
        assert!(queue.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn bounded_capacity() -> Result<(), RangemasterError> {
        let mut queue = OperationQueue::new(2, 2);
        queue.push(death("a"))?;
        queue.push(death("b"))?;
        assert!(queue.push(death("c")).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn requeue_delays_and_exhausts() -> Result<(), RangemasterError> {
        let mut queue = OperationQueue::new(16, 2);
        queue.push(death("a"))?;
        queue.push(death("b"))?;

        let op = queue.pop().await;
        assert_eq!(op.item, death("a"));
        assert_eq!(
            queue.requeue(op, Duration::from_millis(100), false),
            ProcessOutcome::Requeued
        );
        // "b" is ready now, delayed "a" comes after its backoff
        assert_eq!(queue.pop().await.item, death("b"));
        let op = queue.pop().await;
        assert_eq!(op.item, death("a"));
        assert_eq!(op.attempts, 1);

        let outcome = queue.requeue(op, Duration::from_millis(1), true);
        assert_eq!(outcome, ProcessOutcome::RequeuedButProblem);
        let op = queue.pop().await;
        assert_eq!(op.attempts, 2);
        // budget of 2 attempts spent
        assert_eq!(
            queue.requeue(op, Duration::from_millis(1), false),
            ProcessOutcome::Failed
        );
        Ok(())
    }
}
