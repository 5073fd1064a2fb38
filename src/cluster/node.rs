//! Content node as seen by the dispatcher
//!
//! Identity and placement of a node are fixed for the lifetime of a topology
//! snapshot. Liveness and document counts are written by the health monitor
//! and read concurrently by dispatch, so they live in atomics.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use tracing::{info, warn};

/// Liveness of a node as last observed by the health monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Not pinged yet
    Unknown,
    /// Last ping succeeded
    Working,
    /// Last ping failed
    Failed,
}

impl NodeStatus {
    fn to_u8(self) -> u8 {
        match self {
            NodeStatus::Unknown => 0,
            NodeStatus::Working => 1,
            NodeStatus::Failed => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => NodeStatus::Working,
            2 => NodeStatus::Failed,
            _ => NodeStatus::Unknown,
        }
    }
}

/// A content node serving one slice of a group's data
#[derive(Debug)]
pub struct Node {
    key: u32,
    host: String,
    port: u16,
    group: u32,
    path_index: usize,
    status: AtomicU8,
    active_docs: AtomicU64,
    target_active_docs: AtomicU64,
    blocking_writes: AtomicBool,
}

impl Node {
    /// Create a node. `path_index` is the node's position within its group,
    /// which is what search-path directives address.
    pub fn new(key: u32, host: impl Into<String>, port: u16, group: u32, path_index: usize) -> Self {
        Self {
            key,
            host: host.into(),
            port,
            group,
            path_index,
            status: AtomicU8::new(NodeStatus::Unknown.to_u8()),
            active_docs: AtomicU64::new(0),
            target_active_docs: AtomicU64::new(0),
            blocking_writes: AtomicBool::new(false),
        }
    }

    /// Distribution key, unique across the cluster
    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` of the node
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Id of the group this node belongs to
    pub fn group(&self) -> u32 {
        self.group
    }

    pub fn path_index(&self) -> usize {
        self.path_index
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// `None` until the first ping has completed.
    pub fn is_working(&self) -> Option<bool> {
        match self.status() {
            NodeStatus::Unknown => None,
            NodeStatus::Working => Some(true),
            NodeStatus::Failed => Some(false),
        }
    }

    /// Record a successful ping. Returns true if this was a state change.
    pub fn set_working(&self) -> bool {
        let prev = self.status.swap(NodeStatus::Working.to_u8(), Ordering::AcqRel);
        let changed = prev != NodeStatus::Working.to_u8();
        if changed && NodeStatus::from_u8(prev) == NodeStatus::Failed {
            info!(distribution_key = self.key, group = self.group, "Node recovered");
        }
        changed
    }

    /// Record a failed ping. Returns true if this was a state change.
    pub fn set_failed(&self) -> bool {
        let prev = self.status.swap(NodeStatus::Failed.to_u8(), Ordering::AcqRel);
        let changed = prev != NodeStatus::Failed.to_u8();
        if changed {
            warn!(distribution_key = self.key, group = self.group, "Node marked as failed");
            self.active_docs.store(0, Ordering::Release);
        }
        changed
    }

    pub fn active_docs(&self) -> u64 {
        self.active_docs.load(Ordering::Acquire)
    }

    pub fn target_active_docs(&self) -> u64 {
        self.target_active_docs.load(Ordering::Acquire)
    }

    pub fn update_docs(&self, active_docs: u64, target_active_docs: u64) {
        self.active_docs.store(active_docs, Ordering::Release);
        self.target_active_docs
            .store(target_active_docs, Ordering::Release);
    }

    pub fn is_blocking_writes(&self) -> bool {
        self.blocking_writes.load(Ordering::Acquire)
    }

    pub fn set_blocking_writes(&self, blocking: bool) {
        self.blocking_writes.store(blocking, Ordering::Release);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "search node key = {} host = {} port = {} group = {}",
            self.key, self.host, self.port, self.group
        )
    }
}
