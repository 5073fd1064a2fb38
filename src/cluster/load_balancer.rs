//! Group selection for queries
//!
//! The load balancer hands out one group per query and gets it back when the
//! query's invoker is released, together with how long the query took. All
//! per-group bookkeeping is atomic so concurrent queries never serialize on
//! a lock here.

use super::group::Group;
use crate::config::LoadBalancerPolicy;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const DEFAULT_LATENCY_DECAY_RATE: f64 = 1000.0;
const MIN_LATENCY_DECAY_RATE: f64 = 42.0;
const LATENCY_DECAY_TIME: Duration = Duration::from_secs(5);
const INITIAL_QUERY_TIME: f64 = 0.001;
const MIN_QUERY_TIME: f64 = 0.001;

/// Chooses the group that should serve a query
pub struct LoadBalancer {
    scoreboard: Vec<GroupStatus>,
    policy: LoadBalancerPolicy,
    /// Next scoreboard index for round-robin
    needle: AtomicUsize,
    origin: Instant,
}

impl LoadBalancer {
    pub fn new(groups: &[Arc<Group>], policy: LoadBalancerPolicy) -> Self {
        Self {
            scoreboard: groups.iter().map(|g| GroupStatus::new(g.clone())).collect(),
            policy,
            needle: AtomicUsize::new(0),
            origin: Instant::now(),
        }
    }

    pub fn policy(&self) -> LoadBalancerPolicy {
        self.policy
    }

    /// Allocate a group that is not in `excluded`, or `None` if every group
    /// is excluded.
    pub fn take_group(&self, excluded: &HashSet<u32>) -> Option<Arc<Group>> {
        self.take_group_with(excluded, &mut rand::thread_rng())
    }

    /// Like [`take_group`](Self::take_group) with an explicit random source.
    pub fn take_group_with<R: Rng>(
        &self,
        excluded: &HashSet<u32>,
        rng: &mut R,
    ) -> Option<Arc<Group>> {
        let index = match self.policy {
            LoadBalancerPolicy::RoundRobin => self.round_robin(excluded),
            LoadBalancerPolicy::BestOfRandom2 => self.best_of_random_2(excluded, rng),
            LoadBalancerPolicy::LatencyAmortizedOverRequests
            | LoadBalancerPolicy::LatencyAmortizedOverTime => self.latency_weighted(excluded, rng),
        }?;

        let status = &self.scoreboard[index];
        status.allocations.fetch_add(1, Ordering::AcqRel);
        debug!(group = status.group.id(), policy = self.policy.as_str(), "Offering group for query");
        Some(status.group.clone())
    }

    /// Give a group back. Latency only feeds the estimate for successful queries.
    pub fn release_group(&self, group: &Group, success: bool, elapsed: Duration) {
        let Some(status) = self.scoreboard.iter().find(|s| s.group.id() == group.id()) else {
            warn!(group = group.id(), "Released group unknown to this load balancer");
            return;
        };

        let prev = status
            .allocations
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |a| Some((a - 1).max(0)))
            .unwrap_or(0);
        if prev <= 0 {
            warn!(group = group.id(), "Group released more times than it was taken");
        }

        if success {
            match self.policy {
                LoadBalancerPolicy::LatencyAmortizedOverTime => {
                    status.decay_by_time(elapsed, self.origin.elapsed())
                }
                _ => status.decay_by_requests(elapsed),
            }
        }
    }

    /// Current allocations for a group
    pub fn allocations(&self, group_id: u32) -> Option<i64> {
        self.scoreboard
            .iter()
            .find(|s| s.group.id() == group_id)
            .map(|s| s.allocations.load(Ordering::Acquire))
    }

    /// Current latency estimate for a group, in seconds
    pub fn average_cost(&self, group_id: u32) -> Option<f64> {
        self.scoreboard
            .iter()
            .find(|s| s.group.id() == group_id)
            .map(|s| s.average_cost())
    }

    fn candidates(&self, excluded: &HashSet<u32>, require_coverage: bool) -> Vec<usize> {
        self.scoreboard
            .iter()
            .enumerate()
            .filter(|(_, s)| !excluded.contains(&s.group.id()))
            .filter(|(_, s)| !require_coverage || s.group.has_sufficient_coverage())
            .map(|(i, _)| i)
            .collect()
    }

    /// Walk the scoreboard from the needle, taking the first group with
    /// sufficient coverage, or the first allowed group if none has it.
    fn round_robin(&self, excluded: &HashSet<u32>) -> Option<usize> {
        let len = self.scoreboard.len();
        if len == 0 {
            return None;
        }
        let start = self.needle.load(Ordering::Relaxed) % len;
        let mut best: Option<usize> = None;

        for offset in 0..len {
            let index = (start + offset) % len;
            let candidate = &self.scoreboard[index];
            if excluded.contains(&candidate.group.id()) {
                continue;
            }
            match best {
                None => best = Some(index),
                Some(b) => {
                    if !self.scoreboard[b].group.has_sufficient_coverage()
                        && candidate.group.has_sufficient_coverage()
                    {
                        best = Some(index);
                    }
                }
            }
        }

        if let Some(b) = best {
            self.needle.store((b + 1) % len, Ordering::Relaxed);
        }
        best
    }

    fn best_of_random_2<R: Rng>(&self, excluded: &HashSet<u32>, rng: &mut R) -> Option<usize> {
        self.select_best_of_2(excluded, true, rng)
            .or_else(|| self.select_best_of_2(excluded, false, rng))
    }

    fn select_best_of_2<R: Rng>(
        &self,
        excluded: &HashSet<u32>,
        require_coverage: bool,
        rng: &mut R,
    ) -> Option<usize> {
        let mut candidates = self.candidates(excluded, require_coverage);
        let mut pick = |candidates: &mut Vec<usize>| -> Option<usize> {
            if candidates.is_empty() {
                None
            } else {
                Some(candidates.swap_remove(rng.gen_range(0..candidates.len())))
            }
        };
        let a = pick(&mut candidates);
        let b = pick(&mut candidates);
        match (a, b) {
            (Some(a), Some(b)) => {
                let alloc_a = self.scoreboard[a].allocations.load(Ordering::Acquire);
                let alloc_b = self.scoreboard[b].allocations.load(Ordering::Acquire);
                if alloc_b < alloc_a {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (a, b) => a.or(b),
        }
    }

    /// Pick a group with probability proportional to its inverse latency.
    fn latency_weighted<R: Rng>(&self, excluded: &HashSet<u32>, rng: &mut R) -> Option<usize> {
        let needle: f64 = rng.gen();
        self.select_weighted(needle, excluded, true)
            .or_else(|| self.select_weighted(needle, excluded, false))
    }

    fn select_weighted(&self, needle: f64, excluded: &HashSet<u32>, require_coverage: bool) -> Option<usize> {
        let candidates = self.candidates(excluded, require_coverage);
        let weights: Vec<f64> = candidates
            .iter()
            .map(|&i| 1.0 / self.scoreboard[i].average_cost())
            .collect();
        let norm: f64 = weights.iter().sum();
        if candidates.is_empty() || norm <= 0.0 {
            return None;
        }

        let mut accumulated = 0.0;
        for (&index, weight) in candidates.iter().zip(&weights) {
            accumulated += weight / norm;
            if needle < accumulated {
                return Some(index);
            }
        }
        // Rounding can leave the needle just past the last bucket
        candidates.last().copied()
    }
}

/// Per-group allocation count and latency estimate
struct GroupStatus {
    group: Arc<Group>,
    allocations: AtomicI64,
    queries: AtomicU64,
    /// f64 bits of the decayed average query time in seconds
    average_cost_bits: AtomicU64,
    /// Nanoseconds since balancer start at the previous sample
    last_sample_ns: AtomicU64,
}

impl GroupStatus {
    fn new(group: Arc<Group>) -> Self {
        Self {
            group,
            allocations: AtomicI64::new(0),
            queries: AtomicU64::new(0),
            average_cost_bits: AtomicU64::new(INITIAL_QUERY_TIME.to_bits()),
            last_sample_ns: AtomicU64::new(0),
        }
    }

    fn average_cost(&self) -> f64 {
        f64::from_bits(self.average_cost_bits.load(Ordering::Acquire))
    }

    fn update_average(&self, f: impl Fn(f64) -> f64) {
        let _ = self
            .average_cost_bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some(f(f64::from_bits(bits)).to_bits())
            });
    }

    fn decay_by_requests(&self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64().max(MIN_QUERY_TIME);
        let queries = self.queries.fetch_add(1, Ordering::AcqRel) as f64;
        let rate = (queries + MIN_LATENCY_DECAY_RATE).min(DEFAULT_LATENCY_DECAY_RATE);
        self.update_average(|avg| (sample + (rate - 1.0) * avg) / rate);
    }

    fn decay_by_time(&self, elapsed: Duration, now: Duration) {
        let sample = elapsed.as_secs_f64().max(MIN_QUERY_TIME);
        let now_ns = u64::try_from(now.as_nanos()).unwrap_or(u64::MAX);
        let prev_ns = self.last_sample_ns.swap(now_ns, Ordering::AcqRel);
        let rate = LATENCY_DECAY_TIME.as_secs_f64();
        let since_prev = Duration::from_nanos(now_ns.saturating_sub(prev_ns)).as_secs_f64();
        let weight = since_prev.min(rate / 2.0);
        self.update_average(|avg| (weight * sample + (rate - weight) * avg) / rate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Node;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn groups(n: u32) -> Vec<Arc<Group>> {
        (0..n)
            .map(|id| {
                let node = Arc::new(Node::new(id, "localhost", 8000, id, 0));
                Arc::new(Group::new(id, vec![node]))
            })
            .collect()
    }

    fn none() -> HashSet<u32> {
        HashSet::new()
    }

    #[test]
    fn test_round_robin_cycles() {
        let lb = LoadBalancer::new(&groups(3), LoadBalancerPolicy::RoundRobin);
        let picked: Vec<u32> = (0..6).map(|_| lb.take_group(&none()).unwrap().id()).collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_round_robin_prefers_covered_groups() {
        let groups = groups(3);
        groups[1].set_has_sufficient_coverage(false);
        let lb = LoadBalancer::new(&groups, LoadBalancerPolicy::RoundRobin);

        let picked: Vec<u32> = (0..4).map(|_| lb.take_group(&none()).unwrap().id()).collect();
        assert!(!picked.contains(&1));
    }

    #[test]
    fn test_excluded_groups_never_returned() {
        for policy in [
            LoadBalancerPolicy::RoundRobin,
            LoadBalancerPolicy::BestOfRandom2,
            LoadBalancerPolicy::LatencyAmortizedOverRequests,
            LoadBalancerPolicy::LatencyAmortizedOverTime,
        ] {
            let lb = LoadBalancer::new(&groups(3), policy);
            let excluded: HashSet<u32> = [0, 2].into_iter().collect();
            let mut rng = StdRng::seed_from_u64(7);
            for _ in 0..50 {
                let group = lb.take_group_with(&excluded, &mut rng).unwrap();
                assert_eq!(group.id(), 1, "policy {:?}", policy);
            }

            let all: HashSet<u32> = [0, 1, 2].into_iter().collect();
            assert!(lb.take_group_with(&all, &mut rng).is_none());
        }
    }

    #[test]
    fn test_allocation_tracking() {
        let groups = groups(2);
        let lb = LoadBalancer::new(&groups, LoadBalancerPolicy::RoundRobin);

        let g = lb.take_group(&none()).unwrap();
        assert_eq!(lb.allocations(g.id()), Some(1));
        lb.release_group(&g, true, Duration::from_millis(5));
        assert_eq!(lb.allocations(g.id()), Some(0));

        // Over-release never goes negative
        lb.release_group(&g, true, Duration::from_millis(5));
        assert_eq!(lb.allocations(g.id()), Some(0));
    }

    #[test]
    fn test_best_of_two_prefers_fewer_allocations() {
        let lb = LoadBalancer::new(&groups(2), LoadBalancerPolicy::BestOfRandom2);
        let mut rng = StdRng::seed_from_u64(42);

        // With two groups both are always sampled, so allocations alternate
        for _ in 0..10 {
            lb.take_group_with(&none(), &mut rng).unwrap();
        }
        assert_eq!(lb.allocations(0), Some(5));
        assert_eq!(lb.allocations(1), Some(5));
    }

    #[test]
    fn test_latency_weighting_favors_fast_group() {
        let groups = groups(2);
        let lb = LoadBalancer::new(&groups, LoadBalancerPolicy::LatencyAmortizedOverRequests);
        for _ in 0..200 {
            lb.release_group(&groups[0], true, Duration::from_millis(2));
            lb.release_group(&groups[1], true, Duration::from_millis(200));
        }
        assert!(lb.average_cost(0).unwrap() < lb.average_cost(1).unwrap());

        let mut rng = StdRng::seed_from_u64(1);
        let fast = (0..1000)
            .filter(|_| lb.take_group_with(&none(), &mut rng).unwrap().id() == 0)
            .count();
        assert!(fast > 800, "fast group picked {fast} of 1000 times");
    }

    #[test]
    fn test_failed_queries_do_not_move_latency() {
        let groups = groups(1);
        let lb = LoadBalancer::new(&groups, LoadBalancerPolicy::LatencyAmortizedOverRequests);
        lb.release_group(&groups[0], false, Duration::from_secs(10));
        assert_eq!(lb.average_cost(0), Some(INITIAL_QUERY_TIME));
    }

    #[test]
    fn test_concurrent_take_and_release() {
        let lb = Arc::new(LoadBalancer::new(&groups(4), LoadBalancerPolicy::BestOfRandom2));
        let mut handles = vec![];
        for _ in 0..4 {
            let lb = lb.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let g = lb.take_group(&HashSet::new()).unwrap();
                    lb.release_group(&g, true, Duration::from_millis(1));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for id in 0..4 {
            assert_eq!(lb.allocations(id), Some(0));
        }
    }
}
