//! Dispatch coordinator
//!
//! Entry point for queries. A query is routed by, in order:
//!
//! 1. its search-path directive, if it has one that selects any nodes,
//! 2. the single node of a one-node cluster,
//! 3. a group handed out by the load balancer, retried against other groups
//!    when the chosen one cannot be covered.
//!
//! Topology, load balancer and connection pool are swapped as one unit on
//! reconfiguration; see [`volatile`] for how in-flight queries keep the old
//! unit alive until they finish.

pub mod telemetry;
mod volatile;

use crate::clock::{Clock, TokioClock};
use crate::cluster::{ClusterMonitor, HealthPinger, LoadBalancer, TopologyDescriptor, TopologySnapshot};
use crate::config::{BlockingGroupPolicy, DispatchConfig};
use crate::invoker::{FillInvoker, InvokerFactory, ReleaseHook, SearchInvoker};
use crate::search::{
    Coverage, DispatchResult, ErrorMessage, FillResult, LeanHit, Query, SearchPath, TopKEstimator,
};
use crate::transport::Transport;
use crate::{Error, Result};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use volatile::{VolatileItems, VolatileLease};

pub struct Dispatcher {
    config: Arc<DispatchConfig>,
    transport: Arc<dyn Transport>,
    monitor: ClusterMonitor,
    clock: Arc<dyn Clock>,
    estimator: Arc<TopKEstimator>,
    volatile: ArcSwap<VolatileItems>,
    reconfigure_lock: Mutex<()>,
}

impl Dispatcher {
    pub fn new(
        config: DispatchConfig,
        topology: &TopologyDescriptor,
        transport: Arc<dyn Transport>,
        pinger: Arc<dyn HealthPinger>,
    ) -> Result<Self> {
        Self::with_clock(config, topology, transport, pinger, Arc::new(TokioClock))
    }

    pub fn with_clock(
        config: DispatchConfig,
        topology: &TopologyDescriptor,
        transport: Arc<dyn Transport>,
        pinger: Arc<dyn HealthPinger>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let estimator = Arc::new(TopKEstimator::new(
            config.top_k_degrees_of_freedom,
            config.top_k_probability,
        )?);
        let items = build_items(&config, &estimator, &clock, transport.as_ref(), topology, 1)?;

        info!(
            groups = items.topology().group_count(),
            nodes = items.topology().node_count(),
            policy = config.load_balancer_policy.as_str(),
            adaptive_timeout = config.adaptive_timeout_enabled(),
            "Dispatcher started"
        );

        Ok(Self {
            monitor: ClusterMonitor::new(pinger, config.health_check_interval),
            config,
            transport,
            clock,
            estimator,
            volatile: ArcSwap::from_pointee(items),
            reconfigure_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// The topology snapshot currently in use
    pub fn topology(&self) -> Arc<TopologySnapshot> {
        self.volatile.load().topology().clone()
    }

    pub fn generation(&self) -> u64 {
        self.volatile.load().generation()
    }

    /// Build the invoker for `query`. Never fails: problems such as a
    /// malformed search path or no usable group come back as an invoker
    /// whose result carries the error.
    pub fn search_invoker(&self, query: &Query) -> SearchInvoker {
        let lease = VolatileLease::acquire(&self.volatile);
        let factory = lease.invoker_factory().clone();
        let topology = lease.topology().clone();

        if let Some(path) = query.search_path() {
            match SearchPath::parse(path).and_then(|p| p.resolve(&topology)) {
                Ok(resolved) if !resolved.nodes.is_empty() => {
                    if let Some(mut invoker) = factory.create_search_invoker(&resolved.nodes, true) {
                        invoker.add_trace(format!("Dispatching with search path {path}"));
                        return invoker.with_release(hold(lease));
                    }
                }
                Ok(resolved) => {
                    debug!(
                        search_path = path,
                        group = resolved.group_id,
                        "Search path selected no nodes, using regular dispatch"
                    );
                }
                Err(e) => {
                    warn!(search_path = path, error = %e, "Rejected search path");
                    return InvokerFactory::error_invoker(ErrorMessage::from(&e), 0)
                        .with_release(hold(lease));
                }
            }
        }

        if let Some(node) = topology.local_dispatch_target() {
            if let Some(invoker) = factory.create_search_invoker(std::slice::from_ref(node), true) {
                return invoker.with_release(hold(lease));
            }
        }

        match self.invoker_from_load_balancer(lease) {
            Ok(invoker) => invoker,
            Err(e) => {
                warn!(error = %e, "Could not dispatch query");
                InvokerFactory::error_invoker(ErrorMessage::from(&e), 0)
            }
        }
    }

    fn invoker_from_load_balancer(&self, lease: VolatileLease) -> Result<SearchInvoker> {
        let topology = lease.topology().clone();
        let load_balancer = lease.load_balancer().clone();
        let factory = lease.invoker_factory().clone();

        let covered = topology.groups_with_sufficient_coverage().len();
        let max_attempts = (covered + 1)
            .min(topology.group_count())
            .min(self.config.max_group_selection_attempts as usize);
        let mut rejected = rejected_blocking_groups(&topology, self.config.blocking_group_policy);

        for attempt in 0..max_attempts {
            let Some(group) = load_balancer.take_group(&rejected) else {
                break;
            };
            let accept_incomplete = attempt + 1 == max_attempts;

            match factory.create_search_invoker(group.nodes(), accept_incomplete) {
                Some(mut invoker) => {
                    invoker.add_trace(format!(
                        "Dispatching to group {} after retries = {}",
                        group.id(),
                        attempt
                    ));
                    telemetry::record_group_selection(attempt as u32 + 1, true);
                    return Ok(invoker.with_release(Box::new(move |success, elapsed| {
                        load_balancer.release_group(&group, success, elapsed);
                        drop(lease);
                    })));
                }
                None => {
                    debug!(group = group.id(), attempt, "Group cannot serve query, trying another");
                    load_balancer.release_group(&group, false, Duration::ZERO);
                    rejected.insert(group.id());
                }
            }
        }

        telemetry::record_group_selection(max_attempts as u32, false);
        let mut rejected: Vec<u32> = rejected.into_iter().collect();
        rejected.sort_unstable();
        Err(Error::NoSuitableGroup { rejected })
    }

    /// Dispatch `query` and wait for the merged result.
    pub async fn search(&self, query: &Query) -> DispatchResult {
        let started = self.clock.now();
        let mut invoker = self.search_invoker(query);
        let kind = invoker.kind_name();
        let span = info_span!("dispatch", invoker = kind, keys = ?invoker.distribution_keys());

        let result = match invoker.search(query).instrument(span).await {
            Ok(result) => result,
            Err(e) => DispatchResult::from_error(ErrorMessage::from(&e), Coverage::default()),
        };
        let elapsed = self.clock.now().saturating_duration_since(started);
        telemetry::record_search(&result, kind, elapsed.as_secs_f64());
        result
    }

    pub fn fill_invoker(&self) -> FillInvoker {
        let lease = VolatileLease::acquire(&self.volatile);
        lease
            .invoker_factory()
            .create_fill_invoker()
            .with_release(hold(lease))
    }

    /// Fetch summaries for hits of a result of `query`.
    pub async fn fill(&self, query: &Query, hits: &[LeanHit]) -> FillResult {
        self.fill_invoker().fill(query, hits).await
    }

    /// Swap in a new topology. Queries already running finish against the
    /// old one; its connection pool is closed after the last of them.
    pub fn reconfigure(&self, topology: &TopologyDescriptor) -> Result<u64> {
        let _guard = self.reconfigure_lock.lock();
        let generation = self.volatile.load().generation() + 1;
        let items = build_items(
            &self.config,
            &self.estimator,
            &self.clock,
            self.transport.as_ref(),
            topology,
            generation,
        )?;
        let groups = items.topology().group_count();
        let nodes = items.topology().node_count();

        let old = self.volatile.swap(Arc::new(items));
        let in_flight = old.inflight().saturating_sub(1);
        old.count_down();

        telemetry::record_reconfiguration();
        info!(
            generation,
            groups,
            nodes,
            in_flight_on_previous = in_flight,
            "Applied new topology"
        );
        Ok(generation)
    }

    /// Run one health ping round against the current topology.
    pub async fn ping_once(&self) {
        let topology = self.topology();
        self.monitor.ping_iteration(&topology).await;
    }

    pub fn is_warm(&self) -> bool {
        self.monitor.is_warm()
    }

    /// Wait for the first completed ping round, up to the configured
    /// warmup timeout.
    pub async fn wait_for_warmup(&self) -> bool {
        self.monitor.wait_for_warmup(self.config.warmup_timeout).await
    }

    pub fn last_ping_error(&self, key: u32) -> Option<String> {
        self.monitor.last_error(key)
    }

    /// Ping the cluster every `health_check_interval` until the dispatcher
    /// is dropped.
    pub fn run_health_checks(self: &Arc<Self>) -> JoinHandle<()> {
        let dispatcher: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.health_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(dispatcher) = dispatcher.upgrade() else {
                    debug!("Dispatcher dropped, stopping health checks");
                    return;
                };
                dispatcher.ping_once().await;
            }
        })
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.volatile.load().count_down();
    }
}

fn build_items(
    config: &Arc<DispatchConfig>,
    estimator: &Arc<TopKEstimator>,
    clock: &Arc<dyn Clock>,
    transport: &dyn Transport,
    descriptor: &TopologyDescriptor,
    generation: u64,
) -> Result<VolatileItems> {
    let topology = Arc::new(TopologySnapshot::build(descriptor, config, generation)?);
    let pool = transport.create_pool(&topology)?;
    let load_balancer = Arc::new(LoadBalancer::new(
        topology.groups(),
        config.load_balancer_policy,
    ));
    let factory = Arc::new(InvokerFactory::new(
        topology.clone(),
        pool,
        config.clone(),
        estimator.clone(),
        clock.clone(),
    ));
    Ok(VolatileItems::new(generation, topology, load_balancer, factory))
}

/// A release hook that only keeps the lease alive until release.
fn hold(lease: VolatileLease) -> ReleaseHook {
    Box::new(move |_, _| drop(lease))
}

/// Groups kept out of load-balanced selection because they block writes.
pub(crate) fn rejected_blocking_groups(
    topology: &TopologySnapshot,
    policy: BlockingGroupPolicy,
) -> HashSet<u32> {
    let blocking: Vec<u32> = topology
        .groups()
        .iter()
        .filter(|g| g.is_blocking_writes())
        .map(|g| g.id())
        .collect();

    match policy {
        BlockingGroupPolicy::Ignore => HashSet::new(),
        BlockingGroupPolicy::ExcludeSingle => {
            if topology.group_count() > 1 && blocking.len() == 1 {
                blocking.into_iter().collect()
            } else {
                HashSet::new()
            }
        }
        BlockingGroupPolicy::ExcludeWhileAlternativesRemain => {
            if blocking.len() < topology.group_count() {
                blocking.into_iter().collect()
            } else {
                HashSet::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology_with_blocking(groups: u32, blocking: &[u32]) -> TopologySnapshot {
        let snapshot = TopologySnapshot::build(
            &TopologyDescriptor::uniform(groups, 2),
            &DispatchConfig::default(),
            1,
        )
        .unwrap();
        for node in snapshot.nodes() {
            node.set_working();
            node.update_docs(1000, 1000);
            node.set_blocking_writes(blocking.contains(&node.group()));
        }
        snapshot.ping_iteration_completed();
        snapshot
    }

    fn sorted(set: HashSet<u32>) -> Vec<u32> {
        let mut v: Vec<u32> = set.into_iter().collect();
        v.sort_unstable();
        v
    }

    #[test]
    fn test_exclude_single_blocking_group() {
        let policy = BlockingGroupPolicy::ExcludeSingle;
        assert_eq!(sorted(rejected_blocking_groups(&topology_with_blocking(3, &[1]), policy)), vec![1]);
        assert!(rejected_blocking_groups(&topology_with_blocking(3, &[0, 1]), policy).is_empty());
        assert!(rejected_blocking_groups(&topology_with_blocking(1, &[0]), policy).is_empty());
    }

    #[test]
    fn test_exclude_while_alternatives_remain() {
        let policy = BlockingGroupPolicy::ExcludeWhileAlternativesRemain;
        assert_eq!(
            sorted(rejected_blocking_groups(&topology_with_blocking(3, &[0, 1]), policy)),
            vec![0, 1]
        );
        assert!(rejected_blocking_groups(&topology_with_blocking(2, &[0, 1]), policy).is_empty());
    }

    #[test]
    fn test_ignore_policy() {
        let topology = topology_with_blocking(3, &[2]);
        assert!(rejected_blocking_groups(&topology, BlockingGroupPolicy::Ignore).is_empty());
    }
}
