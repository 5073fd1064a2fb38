//! Fan-out to every node of a group and merge of the partial results

use super::factory::hits_to_fetch;
use super::node::NodeInvoker;
use crate::cluster::Group;
use crate::clock::Clock;
use crate::config::DispatchConfig;
use crate::search::timeout::{timeout_handler, TimeoutHandler};
use crate::search::{
    join_keys, merge_lean_hits, trim_window, Coverage, CoverageAggregator, DispatchResult,
    ErrorMessage, GroupingAggregator, LeanHit, Query, SearchRequest, TopKEstimator,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// State between send and result
struct InFlight {
    responses: mpsc::Receiver<usize>,
    handler: Box<dyn TimeoutHandler>,
    asked_nodes: u32,
    offset: usize,
    hits: usize,
    needed: usize,
}

pub(crate) struct InterleavedInvoker {
    /// Per-node invokers, taken out as they answer
    invokers: Vec<Option<NodeInvoker>>,
    group: Option<Arc<Group>>,
    /// Nodes that could not be reached before anything was sent
    already_failed: Vec<u32>,
    config: Arc<DispatchConfig>,
    estimator: Arc<TopKEstimator>,
    clock: Arc<dyn Clock>,
    in_flight: Option<InFlight>,
}

impl InterleavedInvoker {
    pub(crate) fn new(
        invokers: Vec<NodeInvoker>,
        group: Option<Arc<Group>>,
        already_failed: Vec<u32>,
        config: Arc<DispatchConfig>,
        estimator: Arc<TopKEstimator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            invokers: invokers.into_iter().map(Some).collect(),
            group,
            already_failed,
            config,
            estimator,
            clock,
            in_flight: None,
        }
    }

    pub(crate) fn distribution_keys(&self) -> Vec<u32> {
        self.invokers
            .iter()
            .flatten()
            .map(|i| i.distribution_key())
            .collect()
    }

    pub(crate) fn send(&mut self, query: &Query) {
        let needed = query.needed();
        let asked_nodes = self.invokers.len() as u32;
        let per_node = hits_to_fetch(
            &self.estimator,
            &self.config,
            needed,
            asked_nodes,
            self.group.as_deref(),
            query.top_k_probability,
        );
        let timeout = query.time_left(self.clock.now());

        let (tx, rx) = mpsc::channel(self.invokers.len().max(1));
        for (index, invoker) in self.invokers.iter_mut().enumerate() {
            if let Some(invoker) = invoker {
                let request = SearchRequest {
                    payload: query.payload.clone(),
                    distribution_key: invoker.distribution_key(),
                    hits: per_node,
                    offset: 0,
                    timeout,
                };
                invoker.dispatch(request, Some((tx.clone(), index)));
            }
        }

        debug!(
            asked_nodes,
            needed,
            per_node,
            group = self.group.as_ref().map(|g| g.id()),
            "Interleaved query sent"
        );

        self.in_flight = Some(InFlight {
            responses: rx,
            handler: timeout_handler(&self.config, self.clock.clone(), query.deadline(), asked_nodes),
            asked_nodes,
            offset: query.offset as usize,
            hits: query.hits as usize,
            needed: needed as usize,
        });
    }

    pub(crate) async fn result(&mut self) -> DispatchResult {
        let Some(mut in_flight) = self.in_flight.take() else {
            return DispatchResult::from_error(
                ErrorMessage::internal("interleaved invoker result requested twice"),
                Coverage::none_answered(self.invokers.len() as u32),
            );
        };

        let mut coverage = CoverageAggregator::new(in_flight.asked_nodes);
        let mut merged: Vec<LeanHit> = Vec::new();
        let mut groupings = GroupingAggregator::new();
        let mut result = DispatchResult::default();
        let mut answered = 0u32;
        let mut next = in_flight.handler.next_timeout(answered);

        while answered < in_flight.asked_nodes {
            let index = match tokio::time::timeout(next, in_flight.responses.recv()).await {
                Ok(Some(index)) => index,
                Ok(None) | Err(_) => break,
            };
            let Some(mut invoker) = self.invokers.get_mut(index).and_then(Option::take) else {
                continue;
            };

            match invoker.take_reply().await {
                Ok(reply) => {
                    coverage.add(&reply.coverage);
                    merged = merge_lean_hits(merged, reply.hits, in_flight.needed);
                    result.total_hits += reply.total_hits;
                    groupings.merge(reply.groupings);
                    result.errors.extend(reply.errors);
                }
                Err(e) => {
                    let key = invoker.distribution_key();
                    warn!(distribution_key = key, error = %e, "Node returned an error");
                    coverage.add(&Coverage::default());
                    result.errors.push(ErrorMessage::backend_communication(format!(
                        "Error response from node {key}: {e}"
                    )));
                }
            }
            invoker.close();
            answered += 1;
            next = in_flight.handler.next_timeout(answered);
        }

        self.insert_network_errors(&mut result, &mut coverage, answered);
        self.close();

        result.coverage = coverage.finalize(self.config.searchable_copies, in_flight.handler.reason());
        result.groupings = groupings.into_groupings();
        result.hits = trim_window(merged, in_flight.offset, in_flight.hits);

        debug!(
            asked_nodes = in_flight.asked_nodes,
            answered_nodes = answered,
            hits = result.hits.len(),
            degraded = result.coverage.degraded.as_str(),
            "Interleaved merge completed"
        );
        result
    }

    /// Report nodes that never answered. Only when nobody answered does this
    /// become a hard error, otherwise it is a trace note.
    fn insert_network_errors(
        &self,
        result: &mut DispatchResult,
        coverage: &mut CoverageAggregator,
        answered: u32,
    ) {
        let as_errors = answered == 0;

        let pending = self.distribution_keys();
        if !pending.is_empty() {
            let keys = join_keys(&pending);
            if as_errors {
                result.errors.push(ErrorMessage::timeout(format!(
                    "Backend communication timeout on all nodes in group (distribution-keys: {keys})"
                )));
            } else {
                result.trace.push(format!(
                    "Backend communication timeout on nodes with distribution-keys: {keys}"
                ));
            }
            coverage.set_timed_out();
        }

        if !self.already_failed.is_empty() {
            let message = format!(
                "Connection failure on nodes with distribution-keys: {}",
                join_keys(&self.already_failed)
            );
            if as_errors {
                result.errors.push(ErrorMessage::backend_communication(message));
            } else {
                result.trace.push(message);
            }
            coverage.record_failed_nodes(self.already_failed.len() as u32);
        }
    }

    pub(crate) fn close(&mut self) {
        for invoker in self.invokers.iter_mut().flatten() {
            invoker.close();
        }
    }
}
