//! A group: one full replica of the corpus spread over a set of nodes

use super::node::Node;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Max summed deviation from the average node doc count before a group is
/// considered unbalanced, as a fraction of the group's active docs
const MAX_CONTENT_SKEW: f64 = 0.10;

/// Below this many active docs per working node the group is sparse
pub const MIN_DOCS_PER_NODE_TO_REQUIRE_LOW_SKEW: u64 = 100;

/// An ordered set of nodes that together hold one copy of the data.
///
/// Membership is fixed at construction. Everything else is derived state,
/// recomputed after each health ping round.
#[derive(Debug)]
pub struct Group {
    id: u32,
    nodes: Vec<Arc<Node>>,
    has_sufficient_coverage: AtomicBool,
    has_full_coverage: AtomicBool,
    active_docs: AtomicU64,
    target_active_docs: AtomicU64,
    blocking_writes: AtomicBool,
    balanced: AtomicBool,
    sparse: AtomicBool,
}

impl Group {
    pub fn new(id: u32, nodes: Vec<Arc<Node>>) -> Self {
        Self {
            id,
            nodes,
            has_sufficient_coverage: AtomicBool::new(true),
            has_full_coverage: AtomicBool::new(true),
            active_docs: AtomicU64::new(0),
            target_active_docs: AtomicU64::new(0),
            blocking_writes: AtomicBool::new(false),
            balanced: AtomicBool::new(true),
            sparse: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn working_nodes(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.is_working() == Some(true))
            .count()
    }

    pub fn has_sufficient_coverage(&self) -> bool {
        self.has_sufficient_coverage.load(Ordering::Acquire)
    }

    pub fn set_has_sufficient_coverage(&self, sufficient: bool) {
        let prev = self
            .has_sufficient_coverage
            .swap(sufficient, Ordering::AcqRel);
        if prev != sufficient {
            if sufficient {
                info!(group = self.id, "Group regained sufficient coverage");
            } else {
                warn!(
                    group = self.id,
                    working_nodes = self.working_nodes(),
                    nodes = self.nodes.len(),
                    active_docs = self.active_docs(),
                    "Group lost sufficient coverage"
                );
            }
        }
    }

    pub fn has_full_coverage(&self) -> bool {
        self.has_full_coverage.load(Ordering::Acquire)
    }

    pub fn active_docs(&self) -> u64 {
        self.active_docs.load(Ordering::Acquire)
    }

    pub fn target_active_docs(&self) -> u64 {
        self.target_active_docs.load(Ordering::Acquire)
    }

    pub fn is_blocking_writes(&self) -> bool {
        self.blocking_writes.load(Ordering::Acquire)
    }

    /// Whether documents are spread evenly enough over the working nodes for
    /// top-k estimation to be sound
    pub fn is_balanced(&self) -> bool {
        self.balanced.load(Ordering::Acquire)
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse.load(Ordering::Acquire)
    }

    /// Recompute doc counts, balance and blocking state from node values.
    pub fn aggregate_node_values(&self) {
        let working: Vec<&Arc<Node>> = self
            .nodes
            .iter()
            .filter(|n| n.is_working() == Some(true))
            .collect();

        let active: u64 = working.iter().map(|n| n.active_docs()).sum();
        let target: u64 = working.iter().map(|n| n.target_active_docs()).sum();
        self.active_docs.store(active, Ordering::Release);
        self.target_active_docs.store(target, Ordering::Release);
        self.has_full_coverage
            .store(working.len() == self.nodes.len(), Ordering::Release);
        self.blocking_writes.store(
            self.nodes.iter().any(|n| n.is_blocking_writes()),
            Ordering::Release,
        );

        if working.is_empty() {
            self.balanced.store(true, Ordering::Release);
            self.sparse.store(false, Ordering::Release);
            return;
        }

        let average = active / working.len() as u64;
        let skew: u64 = working
            .iter()
            .map(|n| n.active_docs().abs_diff(average))
            .sum();
        let balanced = skew as f64 <= active as f64 * MAX_CONTENT_SKEW;
        let was_balanced = self.balanced.swap(balanced, Ordering::AcqRel);
        if was_balanced != balanced {
            if balanced {
                info!(group = self.id, "Group is now balanced");
            } else {
                warn!(
                    group = self.id,
                    skew,
                    active_docs = active,
                    "Group is unbalanced, top-k estimation disabled"
                );
            }
        }

        self.sparse.store(
            average < MIN_DOCS_PER_NODE_TO_REQUIRE_LOW_SKEW,
            Ordering::Release,
        );
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group {} ({} nodes)", self.id, self.nodes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_with_docs(docs: &[u64]) -> Group {
        let nodes = docs
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let node = Node::new(i as u32, "localhost", 8000 + i as u16, 0, i);
                node.set_working();
                node.update_docs(*d, *d);
                Arc::new(node)
            })
            .collect();
        Group::new(0, nodes)
    }

    #[test]
    fn test_balanced_group() {
        let group = group_with_docs(&[1000, 1010, 990]);
        group.aggregate_node_values();

        assert_eq!(group.active_docs(), 3000);
        assert!(group.is_balanced());
        assert!(!group.is_sparse());
        assert!(group.has_full_coverage());
    }

    #[test]
    fn test_unbalanced_group() {
        let group = group_with_docs(&[1000, 1000, 200]);
        group.aggregate_node_values();

        assert!(!group.is_balanced());
    }

    #[test]
    fn test_sparse_group() {
        let group = group_with_docs(&[10, 12, 9]);
        group.aggregate_node_values();

        assert!(group.is_sparse());
    }

    #[test]
    fn test_failed_nodes_excluded_from_aggregation() {
        let group = group_with_docs(&[1000, 1000, 1000]);
        group.nodes()[2].set_failed();
        group.nodes()[1].set_blocking_writes(true);
        group.aggregate_node_values();

        assert_eq!(group.working_nodes(), 2);
        assert_eq!(group.active_docs(), 2000);
        assert!(!group.has_full_coverage());
        assert!(group.is_blocking_writes());
    }
}
