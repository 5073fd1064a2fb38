//! Auxiliary grouping results
//!
//! Nodes may return grouping results next to their hits. Partial groupings
//! with the same id are merged bucket by bucket; the merge is commutative and
//! associative so arrival order does not matter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregated values of one bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl Aggregate {
    pub fn of(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    pub fn merge(&mut self, other: &Aggregate) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// One grouping result keyed by bucket label
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Grouping {
    pub id: u32,
    pub buckets: BTreeMap<String, Aggregate>,
}

impl Grouping {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            buckets: BTreeMap::new(),
        }
    }

    pub fn with_bucket(mut self, label: impl Into<String>, aggregate: Aggregate) -> Self {
        self.add_bucket(label, aggregate);
        self
    }

    pub fn add_bucket(&mut self, label: impl Into<String>, aggregate: Aggregate) {
        self.buckets
            .entry(label.into())
            .and_modify(|existing| existing.merge(&aggregate))
            .or_insert(aggregate);
    }

    pub fn merge(&mut self, other: Grouping) {
        for (label, aggregate) in other.buckets {
            self.add_bucket(label, aggregate);
        }
    }
}

/// Merges partial groupings of one query by grouping id
#[derive(Debug, Default)]
pub struct GroupingAggregator {
    groupings: BTreeMap<u32, Grouping>,
}

impl GroupingAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, partial: Vec<Grouping>) {
        for grouping in partial {
            match self.groupings.get_mut(&grouping.id) {
                Some(existing) => existing.merge(grouping),
                None => {
                    self.groupings.insert(grouping.id, grouping);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.groupings.is_empty()
    }

    /// Merged groupings ordered by id
    pub fn into_groupings(self) -> Vec<Grouping> {
        self.groupings.into_values().collect()
    }
}
