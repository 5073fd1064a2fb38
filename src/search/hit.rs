//! Lean hits: the minimal sortable handle to a ranked document

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Length of a global document id
pub const GID_LEN: usize = 12;

/// Cluster-wide document identifier, compared bytewise
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalId([u8; GID_LEN]);

impl GlobalId {
    pub const fn new(bytes: [u8; GID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a gid from a prefix, zero padded (or truncated) to [`GID_LEN`].
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut gid = [0u8; GID_LEN];
        let len = bytes.len().min(GID_LEN);
        gid[..len].copy_from_slice(&bytes[..len]);
        Self(gid)
    }

    pub fn as_bytes(&self) -> &[u8; GID_LEN] {
        &self.0
    }
}

impl fmt::Debug for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalId(")?;
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// What a hit is ranked by. All hits in one merge use the same variant.
#[derive(Debug, Clone)]
pub enum SortKey {
    /// Relevance score, higher ranks first
    Relevance(f64),
    /// Serialized sort key, bytewise ascending ranks first
    SortData(Bytes),
}

/// One ranked result as returned by a content node
#[derive(Debug, Clone)]
pub struct LeanHit {
    pub gid: GlobalId,
    pub part_id: u32,
    pub distribution_key: u32,
    pub sort: SortKey,
}

impl LeanHit {
    pub fn with_relevance(gid: GlobalId, relevance: f64, part_id: u32, distribution_key: u32) -> Self {
        Self {
            gid,
            part_id,
            distribution_key,
            sort: SortKey::Relevance(relevance),
        }
    }

    pub fn with_sort_data(gid: GlobalId, sort_data: Bytes, part_id: u32, distribution_key: u32) -> Self {
        Self {
            gid,
            part_id,
            distribution_key,
            sort: SortKey::SortData(sort_data),
        }
    }

    pub fn relevance(&self) -> Option<f64> {
        match self.sort {
            SortKey::Relevance(r) => Some(r),
            SortKey::SortData(_) => None,
        }
    }

    pub fn has_sort_data(&self) -> bool {
        matches!(self.sort, SortKey::SortData(_))
    }
}

/// `Less` means "ranks earlier". Sort data compares bytewise ascending,
/// relevance descending, ties broken by gid ascending.
impl Ord for LeanHit {
    fn cmp(&self, other: &Self) -> Ordering {
        let primary = match (&self.sort, &other.sort) {
            (SortKey::SortData(a), SortKey::SortData(b)) => a.as_ref().cmp(b.as_ref()),
            (SortKey::Relevance(a), SortKey::Relevance(b)) => b.total_cmp(a),
            // Mixed criteria never meet in a well-formed merge; keep the order total anyway
            (SortKey::SortData(_), SortKey::Relevance(_)) => Ordering::Less,
            (SortKey::Relevance(_), SortKey::SortData(_)) => Ordering::Greater,
        };
        primary.then_with(|| self.gid.cmp(&other.gid))
    }
}

impl PartialOrd for LeanHit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for LeanHit {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for LeanHit {}
