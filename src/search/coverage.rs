//! Coverage: how much of the corpus a result actually searched
//!
//! Every node reply carries a [`Coverage`]. The interleaved merge folds them
//! into a [`CoverageAggregator`] and finalizes it once, extrapolating the
//! document counts of nodes that never answered.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Bit set of reasons a result is degraded
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DegradedReason(u8);

impl DegradedReason {
    pub const NONE: Self = Self(0);
    /// A node cut its match phase short
    pub const MATCH_PHASE: Self = Self(1);
    /// Nodes did not answer before the query deadline
    pub const TIMEOUT: Self = Self(2);
    /// The adaptive timeout policy stopped waiting for the last nodes
    pub const ADAPTIVE_TIMEOUT: Self = Self(4);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Label used for metrics attributes
    pub fn as_str(self) -> &'static str {
        if self.contains(Self::ADAPTIVE_TIMEOUT) {
            "adaptive_timeout"
        } else if self.contains(Self::TIMEOUT) {
            "timeout"
        } else if self.contains(Self::MATCH_PHASE) {
            "match_phase"
        } else {
            "none"
        }
    }
}

impl BitOr for DegradedReason {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for DegradedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::MATCH_PHASE) {
            names.push("MATCH_PHASE");
        }
        if self.contains(Self::TIMEOUT) {
            names.push("TIMEOUT");
        }
        if self.contains(Self::ADAPTIVE_TIMEOUT) {
            names.push("ADAPTIVE_TIMEOUT");
        }
        if names.is_empty() {
            names.push("NONE");
        }
        write!(f, "DegradedReason({})", names.join(" | "))
    }
}

/// Coverage of one reply, or of a whole finalized result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    /// Documents searched
    pub docs: u64,
    pub active_docs: u64,
    pub target_active_docs: u64,
    /// Nodes that contributed documents
    pub nodes: u32,
    /// Nodes the query was sent to
    pub nodes_tried: u32,
    /// Nodes that produced a reply, including error replies
    pub answered_nodes: u32,
    pub degraded: DegradedReason,
}

impl Coverage {
    /// Coverage reported by a single answering node.
    pub fn for_node(docs: u64, active_docs: u64, target_active_docs: u64) -> Self {
        Self {
            docs,
            active_docs,
            target_active_docs,
            nodes: 1,
            nodes_tried: 1,
            answered_nodes: 1,
            degraded: DegradedReason::NONE,
        }
    }

    /// Coverage of a result where nothing was searched.
    pub fn none_answered(nodes_tried: u32) -> Self {
        Self {
            nodes_tried,
            ..Default::default()
        }
    }

    pub fn with_degraded(mut self, reason: DegradedReason) -> Self {
        self.degraded.insert(reason);
        self
    }

    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }

    pub fn is_timed_out(&self) -> bool {
        self.degraded.contains(DegradedReason::TIMEOUT)
            || self.degraded.contains(DegradedReason::ADAPTIVE_TIMEOUT)
    }

    /// Searched docs relative to active docs, in [0, 1]
    pub fn ratio(&self) -> f64 {
        if self.active_docs == 0 {
            return if self.nodes > 0 { 1.0 } else { 0.0 };
        }
        (self.docs as f64 / self.active_docs as f64).min(1.0)
    }
}

/// Accumulates per-node coverage for one query.
#[derive(Debug, Clone)]
pub struct CoverageAggregator {
    asked_nodes: u32,
    failed_nodes: u32,
    answered_nodes: u32,
    nodes_participated: u32,
    docs: u64,
    active_docs: u64,
    target_active_docs: u64,
    degraded: DegradedReason,
    timed_out: bool,
}

impl CoverageAggregator {
    pub fn new(asked_nodes: u32) -> Self {
        Self {
            asked_nodes,
            failed_nodes: 0,
            answered_nodes: 0,
            nodes_participated: 0,
            docs: 0,
            active_docs: 0,
            target_active_docs: 0,
            degraded: DegradedReason::NONE,
            timed_out: false,
        }
    }

    /// Fold in the coverage of one answered node.
    pub fn add(&mut self, coverage: &Coverage) {
        self.docs += coverage.docs;
        self.active_docs += coverage.active_docs;
        self.target_active_docs += coverage.target_active_docs;
        self.nodes_participated += coverage.nodes;
        self.answered_nodes += 1;
        self.degraded.insert(coverage.degraded);
        if coverage.is_timed_out() {
            self.timed_out = true;
        }
    }

    /// Nodes that failed before the query could be sent to them.
    pub fn record_failed_nodes(&mut self, count: u32) {
        self.failed_nodes += count;
    }

    pub fn set_timed_out(&mut self) {
        self.timed_out = true;
    }

    pub fn asked_nodes(&self) -> u32 {
        self.asked_nodes
    }

    pub fn answered_nodes(&self) -> u32 {
        self.answered_nodes
    }

    /// Produce the final coverage. `timeout_reason` is the reason reported by
    /// the timeout policy that drove the merge.
    pub fn finalize(mut self, searchable_copies: u32, timeout_reason: DegradedReason) -> Coverage {
        self.adjust_degraded_coverage(searchable_copies, timeout_reason);

        let mut degraded = self.degraded;
        if self.timed_out {
            degraded.insert(timeout_reason);
        }
        Coverage {
            docs: self.docs,
            active_docs: self.active_docs,
            target_active_docs: self.target_active_docs,
            nodes: self.nodes_participated,
            nodes_tried: self.asked_nodes,
            answered_nodes: self.answered_nodes,
            degraded,
        }
    }

    fn adjust_degraded_coverage(&mut self, searchable_copies: u32, timeout_reason: DegradedReason) {
        let asked_and_failed = self.asked_nodes + self.failed_nodes;
        if asked_and_failed <= self.nodes_participated {
            return;
        }
        let not_answered = asked_and_failed - self.nodes_participated;
        if self.nodes_participated == 0 {
            // Nothing to extrapolate from
            return;
        }

        if timeout_reason.contains(DegradedReason::ADAPTIVE_TIMEOUT) {
            self.timed_out = true;
            self.extrapolate(not_answered);
        } else {
            self.extrapolate(not_answered);
            let missing = not_answered.saturating_sub(searchable_copies.saturating_sub(1));
            if missing > 0 {
                self.timed_out = true;
            }
        }
    }

    fn extrapolate(&mut self, not_answered: u32) {
        let participated = self.nodes_participated as u64;
        let not_answered = not_answered as u64;
        self.active_docs += not_answered * self.active_docs / participated;
        self.target_active_docs += not_answered * self.target_active_docs / participated;
    }
}
