//! Summary fill fan-out
//!
//! Hits are grouped by the node that returned them and each node gets one
//! fill request. Requests run in parallel and are bounded by the query
//! deadline; a slow or failing node only costs its own summaries.

use super::ReleaseHook;
use crate::clock::Clock;
use crate::cluster::TopologySnapshot;
use crate::search::{ErrorMessage, FillRequest, FillResult, GlobalId, LeanHit, Query};
use crate::transport::ConnectionPool;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct FillInvoker {
    topology: Arc<TopologySnapshot>,
    pool: Arc<dyn ConnectionPool>,
    clock: Arc<dyn Clock>,
    release: Option<ReleaseHook>,
}

impl FillInvoker {
    pub(crate) fn new(
        topology: Arc<TopologySnapshot>,
        pool: Arc<dyn ConnectionPool>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            topology,
            pool,
            clock,
            release: None,
        }
    }

    pub(crate) fn with_release(mut self, hook: ReleaseHook) -> Self {
        self.release = Some(hook);
        self
    }

    /// Fetch summaries for `hits`.
    pub async fn fill(&self, query: &Query, hits: &[LeanHit]) -> FillResult {
        let mut result = FillResult::default();

        let mut by_node: BTreeMap<u32, Vec<GlobalId>> = BTreeMap::new();
        for hit in hits {
            by_node.entry(hit.distribution_key).or_default().push(hit.gid);
        }

        let deadline = query.deadline();
        let timeout = query.time_left(self.clock.now());
        let mut requests = Vec::with_capacity(by_node.len());
        for (key, gids) in by_node {
            let Some(node) = self.topology.node(key) else {
                result.errors.push(ErrorMessage::backend_communication(format!(
                    "Could not fill hits from unknown node {key}"
                )));
                continue;
            };
            let connection = match self.pool.open(node) {
                Ok(connection) => connection,
                Err(e) => {
                    result.errors.push(ErrorMessage::backend_communication(format!(
                        "Error response from node {key}: {e}"
                    )));
                    continue;
                }
            };
            let request = FillRequest {
                payload: query.payload.clone(),
                distribution_key: key,
                gids,
                timeout,
            };
            requests.push(async move {
                let reply = tokio::time::timeout_at(deadline, connection.fill(request)).await;
                (key, reply)
            });
        }

        for (key, reply) in join_all(requests).await {
            match reply {
                Ok(Ok(reply)) => {
                    result.summaries.extend(reply.summaries);
                    result.errors.extend(reply.errors);
                }
                Ok(Err(e)) => {
                    debug!(distribution_key = key, error = %e, "Fill failed");
                    result.errors.push(ErrorMessage::backend_communication(format!(
                        "Error response from node {key}: {e}"
                    )));
                }
                Err(_) => {
                    result.errors.push(ErrorMessage::timeout(format!(
                        "Timed out waiting for summaries from node {key}"
                    )));
                }
            }
        }
        result
    }
}

impl Drop for FillInvoker {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(true, Duration::ZERO);
        }
    }
}
