//! Search against a single content node

use crate::cluster::Node;
use crate::clock::Clock;
use crate::config::DispatchConfig;
use crate::search::{
    join_keys, merge_lean_hits, trim_window, Coverage, CoverageAggregator, DegradedReason,
    DispatchResult, ErrorMessage, GroupingAggregator, Query, SearchReply, SearchRequest,
};
use crate::transport::NodeConnection;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Caller window remembered between send and result
#[derive(Debug, Clone, Copy)]
struct Window {
    offset: usize,
    hits: usize,
    deadline: Instant,
}

pub(crate) struct NodeInvoker {
    node: Arc<Node>,
    connection: Arc<dyn NodeConnection>,
    config: Arc<DispatchConfig>,
    clock: Arc<dyn Clock>,
    task: Option<JoinHandle<()>>,
    reply: Option<oneshot::Receiver<Result<SearchReply>>>,
    window: Option<Window>,
}

impl NodeInvoker {
    pub(crate) fn new(
        node: Arc<Node>,
        connection: Arc<dyn NodeConnection>,
        config: Arc<DispatchConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            node,
            connection,
            config,
            clock,
            task: None,
            reply: None,
            window: None,
        }
    }

    pub(crate) fn distribution_key(&self) -> u32 {
        self.node.key()
    }

    /// Start the request in the background. When the reply is ready,
    /// `monitor` (if any) is told this invoker's index.
    pub(crate) fn dispatch(
        &mut self,
        request: SearchRequest,
        monitor: Option<(mpsc::Sender<usize>, usize)>,
    ) {
        let (tx, rx) = oneshot::channel();
        let connection = self.connection.clone();
        self.task = Some(tokio::spawn(async move {
            let reply = connection.search(request).await;
            let _ = tx.send(reply);
            if let Some((monitor, index)) = monitor {
                let _ = monitor.try_send(index);
            }
        }));
        self.reply = Some(rx);
    }

    /// The reply of the dispatched request. Waits if it is not there yet.
    pub(crate) async fn take_reply(&mut self) -> Result<SearchReply> {
        let Some(rx) = self.reply.take() else {
            return Err(Error::Internal(format!(
                "no request in flight to node {}",
                self.node.key()
            )));
        };
        match rx.await {
            Ok(reply) => reply,
            Err(_) => Err(Error::Transport(format!(
                "request to node {} was abandoned",
                self.node.key()
            ))),
        }
    }

    /// Standalone use: ask the node for the whole window.
    pub(crate) fn send(&mut self, query: &Query) {
        let now = self.clock.now();
        let hits = query.needed().min(self.config.max_hits_per_node);
        self.window = Some(Window {
            offset: query.offset as usize,
            hits: query.hits as usize,
            deadline: query.deadline(),
        });
        self.dispatch(
            SearchRequest {
                payload: query.payload.clone(),
                distribution_key: self.node.key(),
                hits,
                offset: 0,
                timeout: query.time_left(now),
            },
            None,
        );
    }

    pub(crate) async fn result(&mut self) -> DispatchResult {
        let Some(window) = self.window.take() else {
            return DispatchResult::from_error(
                ErrorMessage::internal("node invoker result requested twice"),
                Coverage::none_answered(1),
            );
        };
        let key = self.node.key();
        let timeout = window.deadline.saturating_duration_since(self.clock.now());
        let mut coverage = CoverageAggregator::new(1);
        let mut result = DispatchResult::default();

        match tokio::time::timeout(timeout, self.take_reply()).await {
            Ok(Ok(reply)) => {
                coverage.add(&reply.coverage);
                let needed = window.offset.saturating_add(window.hits);
                let hits = merge_lean_hits(Vec::new(), reply.hits, needed);
                result.hits = trim_window(hits, window.offset, window.hits);
                result.total_hits = reply.total_hits;
                let mut groupings = GroupingAggregator::new();
                groupings.merge(reply.groupings);
                result.groupings = groupings.into_groupings();
                result.errors = reply.errors;
            }
            Ok(Err(e)) => {
                debug!(distribution_key = key, error = %e, "Node search failed");
                coverage.add(&Coverage::default());
                result.errors.push(ErrorMessage::backend_communication(format!(
                    "Error response from node {key}: {e}"
                )));
            }
            Err(_) => {
                coverage.set_timed_out();
                result.errors.push(ErrorMessage::timeout(format!(
                    "Backend communication timeout on all nodes in group (distribution-keys: {})",
                    join_keys(&[key])
                )));
            }
        }

        result.coverage = coverage.finalize(self.config.searchable_copies, DegradedReason::TIMEOUT);
        result
    }

    pub(crate) fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.reply = None;
    }
}
