//! Cluster model for dispatch
//!
//! Nodes are grouped into replica groups. A [`TopologySnapshot`] fixes the
//! membership for one generation; the [`ClusterMonitor`] keeps liveness and
//! document counts current, and the [`LoadBalancer`] picks which group serves
//! a query.

pub mod group;
pub mod load_balancer;
pub mod monitor;
pub mod node;
pub mod topology;

pub use group::Group;
pub use load_balancer::LoadBalancer;
pub use monitor::{ClusterMonitor, HealthPinger, Pong};
pub use node::{Node, NodeStatus};
pub use topology::{NodeDescriptor, TopologyDescriptor, TopologySnapshot};
