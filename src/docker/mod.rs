//! Local container backend
//!
//! Nodes run as containers on a shared Docker network:
//! - identity is stored as container labels
//! - node state (expiry) is stored inside the container filesystem
//! - network partitions are simulated with iptables inside the container
//! - readiness is gated on the node's management API

mod controller;
mod deployer;
mod images;
mod runtime;
mod state;
mod traffic;

pub mod labels;

#[cfg(test)]
pub(crate) mod fake;

pub use controller::{ControllerOptions, DeployNodeOptions, NodeController, NodeInfo, CONTAINER_PREFIX};
pub use deployer::{summarize_clusters, DeployerOptions, DockerDeployer};
pub use images::{image_def_for, parse_tag, tag_for, ImageProvider, LocalImageProvider};
pub use labels::NodeLabels;
pub use runtime::{
    ContainerRuntime, ContainerSpec, ContainerSummary, DockerRuntime, ExecOutput, IpamBlock,
};
pub use state::{ContainerStateStore, STATE_DIR, STATE_ENTRY, STATE_PARENT_DIR};
pub use traffic::{partition_rules, FilterRule, NodeAddressing, TrafficController};
