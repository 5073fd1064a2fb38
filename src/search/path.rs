//! Search-path directives
//!
//! A search path pins a query to explicit nodes and groups, bypassing the
//! load balancer. Grammar: `nodes[/groups]`, where each side is a comma
//! separated list of single indices (`3`), half-open ranges (`[0,4>`), or
//! `*` for no constraint. Node indices address positions within the chosen
//! group, group items address group ids.
//!
//! ```text
//! [0,2>,5/1   nodes 0, 1 and 5 of group 1
//! */0,2       every node of group 0 or group 2
//! 3           node 3 of any covered group
//! ```

use crate::cluster::{Node, TopologySnapshot};
use crate::{Error, Result};
use rand::Rng;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// One item of a node or group list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Single(u32),
    /// `[from, to>`
    Range { from: u32, to: u32 },
}

impl Selection {
    fn contains(&self, index: u32) -> bool {
        match *self {
            Selection::Single(i) => i == index,
            Selection::Range { from, to } => (from..to).contains(&index),
        }
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selection::Single(i) => write!(f, "{i}"),
            Selection::Range { from, to } => write!(f, "[{from},{to}>"),
        }
    }
}

/// A parsed search-path directive. Empty lists mean "no constraint".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPath {
    nodes: Vec<Selection>,
    groups: Vec<Selection>,
}

/// Nodes a search path resolved to
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    pub group_id: u32,
    /// Selected nodes, ordered by position in the group
    pub nodes: Vec<Arc<Node>>,
}

impl SearchPath {
    pub fn parse(path: &str) -> Result<Self> {
        let path = path.trim();
        if path.is_empty() {
            return Err(invalid(path, "empty search path"));
        }
        if path.contains(';') {
            return Err(invalid(path, "multi-level dispatch is not supported"));
        }

        let mut parts = path.split('/');
        let nodes = parts.next().unwrap_or_default();
        let groups = parts.next();
        if parts.next().is_some() {
            return Err(invalid(path, "only one level of groups is supported"));
        }

        Ok(Self {
            nodes: parse_list(path, nodes)?,
            groups: match groups {
                Some(groups) => parse_list(path, groups)?,
                None => Vec::new(),
            },
        })
    }

    pub fn node_selections(&self) -> &[Selection] {
        &self.nodes
    }

    pub fn group_selections(&self) -> &[Selection] {
        &self.groups
    }

    /// Node positions selected within a group of `group_size` nodes, in
    /// ascending order. Out of range positions are dropped.
    pub fn node_indices(&self, group_size: usize) -> Vec<usize> {
        if self.nodes.is_empty() {
            return (0..group_size).collect();
        }
        (0..group_size)
            .filter(|i| {
                u32::try_from(*i)
                    .map(|i| self.nodes.iter().any(|s| s.contains(i)))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Resolve against a topology, picking a group at random among the
    /// candidates.
    pub fn resolve(&self, topology: &TopologySnapshot) -> Result<ResolvedPath> {
        self.resolve_with(topology, &mut rand::thread_rng())
    }

    pub fn resolve_with<R: Rng>(
        &self,
        topology: &TopologySnapshot,
        rng: &mut R,
    ) -> Result<ResolvedPath> {
        let group_id = self.select_group(topology, rng)?;
        let group = topology
            .group(group_id)
            .ok_or_else(|| Error::InvalidSearchPath(format!("group {group_id} does not exist")))?;
        let nodes = self
            .node_indices(group.nodes().len())
            .into_iter()
            .map(|i| group.nodes()[i].clone())
            .collect();
        Ok(ResolvedPath { group_id, nodes })
    }

    fn select_group<R: Rng>(&self, topology: &TopologySnapshot, rng: &mut R) -> Result<u32> {
        let mut candidates: Vec<u32> = if self.groups.is_empty() {
            let covered: Vec<u32> = topology
                .groups_with_sufficient_coverage()
                .iter()
                .map(|g| g.id())
                .collect();
            if covered.is_empty() {
                topology.group_ids()
            } else {
                covered
            }
        } else {
            let named: Vec<u32> = topology
                .group_ids()
                .into_iter()
                .filter(|id| self.groups.iter().any(|s| s.contains(*id)))
                .collect();
            if named.is_empty() {
                return Err(Error::InvalidSearchPath(format!(
                    "cluster has no group matching '{self}'"
                )));
            }
            named
        };

        while candidates.len() > 1 {
            let pick = rng.gen_range(0..candidates.len());
            let id = candidates[pick];
            if topology
                .group(id)
                .map(|g| g.has_sufficient_coverage())
                .unwrap_or(false)
            {
                return Ok(id);
            }
            candidates.swap_remove(pick);
        }
        candidates
            .pop()
            .ok_or_else(|| Error::InvalidSearchPath("cluster has no groups".to_string()))
    }
}

impl FromStr for SearchPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for SearchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_list(f, &self.nodes)?;
        if !self.groups.is_empty() {
            write!(f, "/")?;
            write_list(f, &self.groups)?;
        }
        Ok(())
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, list: &[Selection]) -> fmt::Result {
    if list.is_empty() {
        return write!(f, "*");
    }
    for (i, s) in list.iter().enumerate() {
        if i > 0 {
            write!(f, ",")?;
        }
        write!(f, "{s}")?;
    }
    Ok(())
}

fn invalid(path: &str, reason: &str) -> Error {
    Error::InvalidSearchPath(format!("'{path}': {reason}"))
}

fn parse_list(path: &str, list: &str) -> Result<Vec<Selection>> {
    let list = list.trim();
    if list.is_empty() || list == "*" {
        return Ok(Vec::new());
    }

    let mut selections = Vec::new();
    let mut rest = list;
    loop {
        rest = rest.trim_start();
        let (selection, tail) = if let Some(range) = rest.strip_prefix('[') {
            let end = range
                .find('>')
                .ok_or_else(|| invalid(path, "range is missing closing '>'"))?;
            (parse_range(path, &range[..end])?, &range[end + 1..])
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let item = rest[..end].trim();
            if item == "*" {
                // A wildcard anywhere in the list lifts the constraint
                return Ok(Vec::new());
            }
            (Selection::Single(parse_index(path, item)?), &rest[end..])
        };
        selections.push(selection);

        let tail = tail.trim_start();
        if tail.is_empty() {
            return Ok(selections);
        }
        rest = tail
            .strip_prefix(',')
            .ok_or_else(|| invalid(path, &format!("unexpected '{tail}'")))?;
    }
}

fn parse_range(path: &str, body: &str) -> Result<Selection> {
    let (from, to) = body
        .split_once(',')
        .ok_or_else(|| invalid(path, &format!("range '[{body}>' must be '[from,to>'")))?;
    let from = parse_index(path, from.trim())?;
    let to = parse_index(path, to.trim())?;
    if from > to {
        return Err(invalid(
            path,
            &format!("range start {from} is greater than end {to}"),
        ));
    }
    Ok(Selection::Range { from, to })
}

fn parse_index(path: &str, item: &str) -> Result<u32> {
    item.parse::<u32>()
        .map_err(|_| invalid(path, &format!("'{item}' is not a valid index")))
}
