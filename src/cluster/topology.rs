//! Immutable per-generation view of the cluster
//!
//! A [`TopologySnapshot`] is built from a flat [`TopologyDescriptor`] and
//! never has its membership changed. Reconfiguration builds a new snapshot
//! and swaps it in whole.

use super::group::Group;
use super::node::Node;
use crate::config::DispatchConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// One entry of the flat topology input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Distribution key
    pub key: u32,
    pub host: String,
    pub port: u16,
    /// Id of the group the node belongs to
    pub group: u32,
}

/// Flat (node, group) list pushed in on reconfiguration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyDescriptor {
    pub nodes: Vec<NodeDescriptor>,
}

impl TopologyDescriptor {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Convenience for building `groups x nodes_per_group` topologies with
    /// consecutive distribution keys.
    pub fn uniform(groups: u32, nodes_per_group: u32) -> Self {
        let mut nodes = Vec::with_capacity((groups * nodes_per_group) as usize);
        for group in 0..groups {
            for i in 0..nodes_per_group {
                let key = group * nodes_per_group + i;
                nodes.push(NodeDescriptor {
                    key,
                    host: format!("content-{key}"),
                    port: 19100,
                    group,
                });
            }
        }
        Self { nodes }
    }
}

/// Thresholds used to derive group coverage
#[derive(Debug, Clone, Copy, PartialEq)]
struct CoveragePolicy {
    min_search_coverage: f64,
    max_nodes_down_per_group: u32,
    min_active_docs_percentage: f64,
}

impl From<&DispatchConfig> for CoveragePolicy {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            min_search_coverage: config.min_search_coverage,
            max_nodes_down_per_group: config.max_nodes_down_per_group,
            min_active_docs_percentage: config.min_active_docs_percentage,
        }
    }
}

/// Immutable collection of groups plus lookup by node key
#[derive(Debug)]
pub struct TopologySnapshot {
    generation: u64,
    groups: Vec<Arc<Group>>,
    by_group_id: HashMap<u32, Arc<Group>>,
    by_node_key: HashMap<u32, Arc<Node>>,
    local_dispatch_target: Option<Arc<Node>>,
    policy: CoveragePolicy,
}

impl TopologySnapshot {
    /// Build a snapshot. Fails if a distribution key appears twice, since a
    /// node must belong to exactly one group.
    pub fn build(
        descriptor: &TopologyDescriptor,
        config: &DispatchConfig,
        generation: u64,
    ) -> Result<Self> {
        let mut members: BTreeMap<u32, Vec<Arc<Node>>> = BTreeMap::new();
        let mut by_node_key = HashMap::with_capacity(descriptor.nodes.len());

        for entry in &descriptor.nodes {
            let group_nodes = members.entry(entry.group).or_default();
            let node = Arc::new(Node::new(
                entry.key,
                entry.host.clone(),
                entry.port,
                entry.group,
                group_nodes.len(),
            ));
            if by_node_key.insert(entry.key, node.clone()).is_some() {
                return Err(Error::Config(format!(
                    "distribution key {} appears more than once in topology",
                    entry.key
                )));
            }
            group_nodes.push(node);
        }

        let groups: Vec<Arc<Group>> = members
            .into_iter()
            .map(|(id, nodes)| Arc::new(Group::new(id, nodes)))
            .collect();
        let by_group_id = groups.iter().map(|g| (g.id(), g.clone())).collect();

        let local_dispatch_target = match groups.as_slice() {
            [only] if only.nodes().len() == 1 => Some(only.nodes()[0].clone()),
            _ => None,
        };

        debug!(
            generation,
            groups = groups.len(),
            nodes = by_node_key.len(),
            direct = local_dispatch_target.is_some(),
            "Built topology snapshot"
        );

        Ok(Self {
            generation,
            groups,
            by_group_id,
            by_node_key,
            local_dispatch_target,
            policy: CoveragePolicy::from(config),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Groups ordered by id
    pub fn groups(&self) -> &[Arc<Group>] {
        &self.groups
    }

    pub fn group(&self, id: u32) -> Option<&Arc<Group>> {
        self.by_group_id.get(&id)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn group_ids(&self) -> Vec<u32> {
        self.groups.iter().map(|g| g.id()).collect()
    }

    pub fn node(&self, key: u32) -> Option<&Arc<Node>> {
        self.by_node_key.get(&key)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.groups.iter().flat_map(|g| g.nodes().iter())
    }

    pub fn node_count(&self) -> usize {
        self.by_node_key.len()
    }

    pub fn groups_with_sufficient_coverage(&self) -> Vec<Arc<Group>> {
        self.groups
            .iter()
            .filter(|g| g.has_sufficient_coverage())
            .cloned()
            .collect()
    }

    /// The single node to dispatch to when the cluster is one group of one
    /// node, skipping load balancing altogether.
    pub fn local_dispatch_target(&self) -> Option<&Arc<Node>> {
        self.local_dispatch_target.as_ref()
    }

    /// Re-derive group state after the health monitor finished a round.
    pub fn ping_iteration_completed(&self) {
        for group in &self.groups {
            group.aggregate_node_values();
        }
        let median = self.median_active_docs_per_group();
        for group in &self.groups {
            let sufficient = self.is_group_node_coverage_sufficient(group)
                && self.is_doc_coverage_sufficient(group.active_docs(), median);
            group.set_has_sufficient_coverage(sufficient);
        }
    }

    /// Whether the given subset of a group's nodes still carries enough
    /// documents to serve a query on its own.
    pub fn is_partial_group_coverage_sufficient(&self, nodes: &[Arc<Node>]) -> bool {
        if self.groups.len() <= 1 {
            return true;
        }
        let active: u64 = nodes.iter().map(|n| n.active_docs()).sum();
        self.is_doc_coverage_sufficient(active, self.median_active_docs_per_group())
    }

    fn is_group_node_coverage_sufficient(&self, group: &Group) -> bool {
        let size = group.nodes().len();
        let allowed_by_coverage =
            (size as f64 * (100.0 - self.policy.min_search_coverage) / 100.0).floor() as usize;
        let allowed_down = self.policy.max_nodes_down_per_group as usize + allowed_by_coverage;
        group.working_nodes() + allowed_down >= size
    }

    fn is_doc_coverage_sufficient(&self, active_docs: u64, median: u64) -> bool {
        if self.groups.len() <= 1 || median == 0 {
            return true;
        }
        let coverage = 100.0 * active_docs as f64 / median as f64;
        coverage >= self.policy.min_active_docs_percentage
    }

    fn median_active_docs_per_group(&self) -> u64 {
        let mut docs: Vec<u64> = self.groups.iter().map(|g| g.active_docs()).collect();
        if docs.is_empty() {
            return 0;
        }
        docs.sort_unstable();
        docs[docs.len() / 2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping_all(snapshot: &TopologySnapshot, docs: u64) {
        for node in snapshot.nodes() {
            node.set_working();
            node.update_docs(docs, docs);
        }
        snapshot.ping_iteration_completed();
    }

    #[test]
    fn test_build_groups_in_id_order() {
        let descriptor = TopologyDescriptor::from_json(
            r#"{"nodes": [
                {"key": 4, "host": "c4", "port": 1, "group": 2},
                {"key": 0, "host": "c0", "port": 1, "group": 0},
                {"key": 5, "host": "c5", "port": 1, "group": 2},
                {"key": 1, "host": "c1", "port": 1, "group": 0}
            ]}"#,
        )
        .unwrap();
        let snapshot = TopologySnapshot::build(&descriptor, &DispatchConfig::default(), 1).unwrap();

        assert_eq!(snapshot.group_ids(), vec![0, 2]);
        let group2 = snapshot.group(2).unwrap();
        assert_eq!(group2.nodes()[0].key(), 4);
        assert_eq!(group2.nodes()[1].path_index(), 1);
        assert_eq!(snapshot.node(5).unwrap().group(), 2);
        assert!(snapshot.local_dispatch_target().is_none());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let descriptor = TopologyDescriptor {
            nodes: vec![
                NodeDescriptor { key: 1, host: "a".into(), port: 1, group: 0 },
                NodeDescriptor { key: 1, host: "b".into(), port: 1, group: 1 },
            ],
        };
        let err = TopologySnapshot::build(&descriptor, &DispatchConfig::default(), 1).unwrap_err();
        assert!(format!("{err}").contains("more than once"));
    }

    #[test]
    fn test_single_node_collapses_to_direct_target() {
        let snapshot =
            TopologySnapshot::build(&TopologyDescriptor::uniform(1, 1), &DispatchConfig::default(), 1)
                .unwrap();
        assert_eq!(snapshot.local_dispatch_target().unwrap().key(), 0);
    }

    #[test]
    fn test_node_down_removes_sufficient_coverage() {
        let snapshot =
            TopologySnapshot::build(&TopologyDescriptor::uniform(2, 3), &DispatchConfig::default(), 1)
                .unwrap();
        ping_all(&snapshot, 1000);
        assert_eq!(snapshot.groups_with_sufficient_coverage().len(), 2);

        snapshot.node(4).unwrap().set_failed();
        snapshot.ping_iteration_completed();

        let covered: Vec<u32> = snapshot
            .groups_with_sufficient_coverage()
            .iter()
            .map(|g| g.id())
            .collect();
        assert_eq!(covered, vec![0]);
    }

    #[test]
    fn test_allowed_nodes_down_keeps_coverage() {
        let config = DispatchConfig {
            max_nodes_down_per_group: 1,
            min_active_docs_percentage: 0.0,
            ..Default::default()
        };
        let snapshot = TopologySnapshot::build(&TopologyDescriptor::uniform(2, 3), &config, 1).unwrap();
        ping_all(&snapshot, 1000);

        snapshot.node(4).unwrap().set_failed();
        snapshot.ping_iteration_completed();
        assert_eq!(snapshot.groups_with_sufficient_coverage().len(), 2);
    }

    #[test]
    fn test_partial_group_coverage() {
        let snapshot =
            TopologySnapshot::build(&TopologyDescriptor::uniform(3, 2), &DispatchConfig::default(), 1)
                .unwrap();
        ping_all(&snapshot, 1000);

        let group = snapshot.group(1).unwrap();
        assert!(snapshot.is_partial_group_coverage_sufficient(group.nodes()));
        assert!(!snapshot.is_partial_group_coverage_sufficient(&group.nodes()[..1]));
    }
}
