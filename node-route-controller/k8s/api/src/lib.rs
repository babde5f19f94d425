#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod node;

pub use self::node::{node_view, pod_cidrs, InvalidNode};
pub use k8s_openapi::api::core::v1::{Node, NodeAddress, NodeSpec, NodeStatus};
pub use kube::{
    api::{Api, ObjectMeta, ResourceExt},
    runtime::watcher,
    Client,
};
