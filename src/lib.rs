//! # searchdispatch
//!
//! Query dispatch core for a search cluster of replicated node groups.
//!
//! A query is sent either to explicit nodes named by a search path, or to
//! every node of one group picked by the load balancer. Partial ranked hit
//! lists are merged into one globally ordered window, and a coverage verdict
//! tells the caller how much of the corpus was actually searched.
//!
//! ## Layout
//!
//! - **cluster**: nodes, groups, topology snapshots, health monitoring and
//!   load balancing
//! - **search**: query and result types, lean hit merge, coverage, timeout
//!   policies, top-k estimation and search-path directives
//! - **invoker**: single-use handles that run one search or fill
//! - **dispatcher**: the coordinator, including live reconfiguration
//! - **transport**: the per-node capability dispatch calls into

pub mod clock;
pub mod cluster;
pub mod config;
pub mod dispatcher;
pub mod invoker;
pub mod search;
pub mod telemetry;
pub mod transport;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::cluster::{HealthPinger, Pong, TopologyDescriptor};
    pub use crate::config::{BlockingGroupPolicy, DispatchConfig, LoadBalancerPolicy};
    pub use crate::dispatcher::Dispatcher;
    pub use crate::search::{
        Coverage, DegradedReason, DispatchResult, ErrorCode, ErrorMessage, LeanHit, Query,
    };
    pub use crate::transport::{ConnectionPool, NodeConnection, Transport};
    pub use crate::{Error, Result};
}
