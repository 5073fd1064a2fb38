//! Boundary to the per-node transport
//!
//! Framing, compression and serialization belong to the transport. Dispatch
//! only opens connections through a pool, sends requests and closes the
//! pool when a topology generation is retired.

use crate::cluster::{Node, TopologySnapshot};
use crate::search::{FillReply, FillRequest, SearchReply, SearchRequest};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// An open channel to one content node
#[async_trait]
pub trait NodeConnection: Send + Sync {
    async fn search(&self, request: SearchRequest) -> Result<SearchReply>;

    async fn fill(&self, request: FillRequest) -> Result<FillReply>;
}

/// Connections for one topology generation
pub trait ConnectionPool: Send + Sync {
    /// Get a connection to `node`. Fails with [`crate::Error::NodeUnreachable`]
    /// if no connection can be established.
    fn open(&self, node: &Node) -> Result<Arc<dyn NodeConnection>>;

    /// Release every connection. Called once, after the last in-flight
    /// operation of the generation has finished.
    fn close(&self);
}

/// Factory for connection pools, one per topology generation
pub trait Transport: Send + Sync {
    fn create_pool(&self, topology: &TopologySnapshot) -> Result<Arc<dyn ConnectionPool>>;
}
