//! Builds invokers for one topology generation

use super::error::ErrorInvoker;
use super::fill::FillInvoker;
use super::interleaved::InterleavedInvoker;
use super::node::NodeInvoker;
use super::{InvokerKind, SearchInvoker};
use crate::cluster::{Group, Node, TopologySnapshot};
use crate::clock::Clock;
use crate::config::DispatchConfig;
use crate::search::{join_keys, ErrorMessage, TopKEstimator};
use crate::transport::ConnectionPool;
use std::sync::Arc;
use tracing::{debug, warn};

/// Hits to ask each of `partitions` nodes for when the caller needs
/// `needed`. Only balanced, non-sparse groups get a top-k reduction. The
/// result is capped by `max_hits_per_node`.
pub fn hits_to_fetch(
    estimator: &TopKEstimator,
    config: &DispatchConfig,
    needed: u32,
    partitions: u32,
    group: Option<&Group>,
    probability: Option<f64>,
) -> u32 {
    let estimable = group
        .map(|g| g.is_balanced() && !g.is_sparse())
        .unwrap_or(false);
    let per_node = if estimable {
        let p = probability.unwrap_or(config.top_k_probability);
        estimator.estimate_k_with(needed, partitions, p)
    } else {
        needed
    };
    per_node.min(config.max_hits_per_node)
}

/// Creates search and fill invokers against one topology snapshot and its
/// connection pool.
pub struct InvokerFactory {
    topology: Arc<TopologySnapshot>,
    pool: Arc<dyn ConnectionPool>,
    config: Arc<DispatchConfig>,
    estimator: Arc<TopKEstimator>,
    clock: Arc<dyn Clock>,
}

impl InvokerFactory {
    pub fn new(
        topology: Arc<TopologySnapshot>,
        pool: Arc<dyn ConnectionPool>,
        config: Arc<DispatchConfig>,
        estimator: Arc<TopKEstimator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            topology,
            pool,
            config,
            estimator,
            clock,
        }
    }

    pub fn topology(&self) -> &Arc<TopologySnapshot> {
        &self.topology
    }

    /// Build an invoker over `nodes`.
    ///
    /// Returns `None` when some nodes are unavailable, the rest cannot cover
    /// the group's documents and `accept_incomplete` is false; the caller
    /// should then try another group. If no node at all is usable the
    /// invoker only carries a connection failure error.
    pub fn create_search_invoker(
        &self,
        nodes: &[Arc<Node>],
        accept_incomplete: bool,
    ) -> Option<SearchInvoker> {
        let mut invokers = Vec::with_capacity(nodes.len());
        let mut usable = Vec::with_capacity(nodes.len());
        let mut failed = Vec::new();

        for node in nodes {
            if node.is_working() == Some(false) {
                failed.push(node.key());
                continue;
            }
            match self.pool.open(node) {
                Ok(connection) => {
                    invokers.push(NodeInvoker::new(
                        node.clone(),
                        connection,
                        self.config.clone(),
                        self.clock.clone(),
                    ));
                    usable.push(node.clone());
                }
                Err(e) => {
                    warn!(distribution_key = node.key(), error = %e, "Could not open connection to node");
                    failed.push(node.key());
                }
            }
        }

        if !failed.is_empty() {
            if !accept_incomplete && !self.topology.is_partial_group_coverage_sufficient(&usable) {
                debug!(
                    failed = %join_keys(&failed),
                    "Remaining nodes do not cover the group"
                );
                return None;
            }
            if invokers.is_empty() {
                return Some(Self::error_invoker(
                    ErrorMessage::backend_communication(format!(
                        "Connection failure on nodes with distribution-keys: {}",
                        join_keys(&failed)
                    )),
                    failed.len() as u32,
                ));
            }
        }

        if invokers.len() == 1 && failed.is_empty() {
            let node = invokers.remove(0);
            return Some(SearchInvoker::new(InvokerKind::Node(node)));
        }

        let group = nodes
            .first()
            .and_then(|n| self.topology.group(n.group()))
            .cloned();
        Some(SearchInvoker::new(InvokerKind::Interleaved(
            InterleavedInvoker::new(
                invokers,
                group,
                failed,
                self.config.clone(),
                self.estimator.clone(),
                self.clock.clone(),
            ),
        )))
    }

    /// An invoker that answers with `message` without contacting anything.
    pub fn error_invoker(message: ErrorMessage, nodes_tried: u32) -> SearchInvoker {
        SearchInvoker::new(InvokerKind::Error(ErrorInvoker::new(message, nodes_tried)))
    }

    pub fn create_fill_invoker(&self) -> FillInvoker {
        FillInvoker::new(self.topology.clone(), self.pool.clone(), self.clock.clone())
    }

    /// Close the connection pool of this generation.
    pub fn close(&self) {
        self.pool.close();
    }
}
