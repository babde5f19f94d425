#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use noderoute_controller_core as core;
pub use noderoute_controller_k8s_api as k8s;
pub use noderoute_controller_k8s_index as index;

mod args;
mod controller;
mod dry_run;
mod metrics;
mod stale;
mod sync;
mod tunnel;


pub use self::{
    args::Args,
    controller::{Controller, SyncError},
    dry_run::DryRun,
    metrics::ControllerMetrics,
    sync::InitialSync,
    tunnel::{TunnelError, TunnelPortConfig, TunnelPortManager},
};
