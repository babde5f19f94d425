//! Node route index
//!
//! Tracks the cluster's nodes and the routing state installed for them:
//!
//! - [`NodeIndex`] caches every `Node` observed on the cluster watch and enqueues the names of
//!   nodes whose routing-relevant fields changed.
//! - [`WorkQueue`] deduplicates node names so that each node is reconciled by at most one worker at
//!   a time, and rate-limits retries.
//! - [`InstalledNodes`] records what has actually been installed for each node and enforces that a
//!   pod CIDR is owned by at most one node.
//! - [`PodSubnets`] answers, for an arbitrary address, whether it belongs to a pod CIDR known to
//!   this node and whether it is that CIDR's gateway. It is consulted on the packet processing
//!   path, so lookups only ever take a read lock.
//!
//! ```text
//! [ Node watch ] -> [ NodeIndex ] -> [ WorkQueue ] -> controller -> [ InstalledNodes ]
//!                                                                -> [ PodSubnets ]
//! ```

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod installed;
pub mod metrics;
mod node;
mod pod_subnets;
mod queue;


pub use self::{
    installed::{CidrConflict, InstalledNodes, NodeRouteInfo},
    node::{InitialListRx, NodeIndex, SharedNodeIndex},
    pod_subnets::{PodSubnets, SubnetMatch},
    queue::{Backoff, WorkQueue},
};
