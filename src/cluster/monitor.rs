//! Cluster health monitoring
//!
//! Pings every node of the current topology once per round, records the
//! outcome on the node, and re-derives group coverage when the round is
//! done. The first completed round releases anyone waiting for warmup.

use super::node::Node;
use super::topology::TopologySnapshot;
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What a node reports back on a health ping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pong {
    pub active_docs: u64,
    pub target_active_docs: u64,
    pub blocking_writes: bool,
}

/// Capability to ping a single node
#[async_trait]
pub trait HealthPinger: Send + Sync {
    async fn ping(&self, node: &Node) -> Result<Pong>;
}

/// Drives ping rounds and tracks warmup
pub struct ClusterMonitor {
    pinger: Arc<dyn HealthPinger>,
    ping_timeout: Duration,
    /// Last ping error per distribution key, cleared on success
    last_errors: DashMap<u32, String>,
    warm_tx: watch::Sender<bool>,
    warm_rx: watch::Receiver<bool>,
}

impl ClusterMonitor {
    pub fn new(pinger: Arc<dyn HealthPinger>, ping_timeout: Duration) -> Self {
        let (warm_tx, warm_rx) = watch::channel(false);
        Self {
            pinger,
            ping_timeout,
            last_errors: DashMap::new(),
            warm_tx,
            warm_rx,
        }
    }

    /// Ping all nodes of `topology` concurrently and update derived state.
    pub async fn ping_iteration(&self, topology: &TopologySnapshot) {
        let pings = topology.nodes().map(|node| {
            let node = node.clone();
            async move {
                let outcome = tokio::time::timeout(self.ping_timeout, self.pinger.ping(&node)).await;
                (node, outcome)
            }
        });

        for (node, outcome) in join_all(pings).await {
            match outcome {
                Ok(Ok(pong)) => {
                    node.update_docs(pong.active_docs, pong.target_active_docs);
                    node.set_blocking_writes(pong.blocking_writes);
                    node.set_working();
                    self.last_errors.remove(&node.key());
                }
                Ok(Err(e)) => {
                    debug!(distribution_key = node.key(), error = %e, "Ping failed");
                    node.set_failed();
                    self.last_errors.insert(node.key(), e.to_string());
                }
                Err(_) => {
                    debug!(distribution_key = node.key(), "Ping timed out");
                    node.set_failed();
                    self.last_errors
                        .insert(node.key(), format!("no pong within {:?}", self.ping_timeout));
                }
            }
        }

        topology.ping_iteration_completed();

        if !*self.warm_rx.borrow() {
            info!(
                generation = topology.generation(),
                nodes = topology.node_count(),
                "First health ping round completed"
            );
            self.warm_tx.send_replace(true);
        }
    }

    /// Whether at least one full ping round has completed.
    pub fn is_warm(&self) -> bool {
        *self.warm_rx.borrow()
    }

    /// Wait until the first ping round has completed, bounded by `timeout`.
    /// Returns whether warmup finished in time.
    pub async fn wait_for_warmup(&self, timeout: Duration) -> bool {
        let mut rx = self.warm_rx.clone();
        let warm = tokio::time::timeout(timeout, rx.wait_for(|warm| *warm)).await;
        match warm {
            Ok(Ok(_)) => true,
            _ => {
                warn!(?timeout, "Gave up waiting for first health ping round");
                false
            }
        }
    }

    /// Most recent ping failure reason for a node, if it is currently failing.
    pub fn last_error(&self, key: u32) -> Option<String> {
        self.last_errors.get(&key).map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::TopologyDescriptor;
    use crate::config::DispatchConfig;
    use crate::Error;

    struct DownKeys(Vec<u32>);

    #[async_trait]
    impl HealthPinger for DownKeys {
        async fn ping(&self, node: &Node) -> Result<Pong> {
            if self.0.contains(&node.key()) {
                Err(Error::NodeUnreachable {
                    distribution_key: node.key(),
                    reason: "connection refused".to_string(),
                })
            } else {
                Ok(Pong {
                    active_docs: 1000,
                    target_active_docs: 1000,
                    blocking_writes: node.key() == 0,
                })
            }
        }
    }

    #[tokio::test]
    async fn test_ping_round_updates_nodes_and_groups() {
        let topology = TopologySnapshot::build(
            &TopologyDescriptor::uniform(2, 2),
            &DispatchConfig::default(),
            1,
        )
        .unwrap();
        let monitor = ClusterMonitor::new(Arc::new(DownKeys(vec![3])), Duration::from_secs(1));
        assert!(!monitor.is_warm());

        monitor.ping_iteration(&topology).await;

        assert!(monitor.is_warm());
        assert_eq!(topology.node(0).unwrap().is_working(), Some(true));
        assert_eq!(topology.node(3).unwrap().is_working(), Some(false));
        assert!(monitor.last_error(3).unwrap().contains("connection refused"));
        assert!(monitor.last_error(0).is_none());
        assert!(topology.group(0).unwrap().is_blocking_writes());
        assert!(topology.group(0).unwrap().has_sufficient_coverage());
        assert!(!topology.group(1).unwrap().has_sufficient_coverage());
    }

    #[tokio::test]
    async fn test_wait_for_warmup_times_out_without_ping() {
        let monitor = ClusterMonitor::new(Arc::new(DownKeys(vec![])), Duration::from_secs(1));
        assert!(!monitor.wait_for_warmup(Duration::from_millis(10)).await);
    }
}
