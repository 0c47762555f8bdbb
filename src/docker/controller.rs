//! Node lifecycle on the container backend
//!
//! A node is one container on the shared network. Its identity lives in the
//! container labels, its expiry in the container filesystem, and it is only
//! handed out once the readiness probe has passed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Span};
use uuid::Uuid;

use super::labels::{self, NodeLabels};
use super::runtime::{ContainerRuntime, ContainerSpec, ContainerSummary};
use super::traffic::TrafficController;
use crate::config::Config;
use crate::error::{DeployError, ResourceContext, Result};
use crate::image::ImageRef;
use crate::poll::{poll_until, PollOptions};
use crate::readiness::ReadinessProbe;
use crate::state::{NodeState, NodeStateStore};

/// Prefix of every node container name
pub const CONTAINER_PREFIX: &str = "dynonode-";

/// Labels joined with persisted state for one node container
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub cluster_id: String,
    pub resource_id: String,
    pub name: String,
    pub creator: String,
    pub purpose: String,
    pub initial_server_version: String,
    pub image: String,
    pub ip_address: Option<String>,
    /// `None` when the persisted state is missing or unreadable
    pub expiry: Option<DateTime<Utc>>,
}

impl NodeInfo {
    fn from_container(container: ContainerSummary) -> Option<Self> {
        let labels = NodeLabels::from_labels(&container.labels)?;

        Some(Self {
            node_id: labels.node_id,
            cluster_id: labels.cluster_id,
            resource_id: container.id,
            name: labels.node_name,
            creator: labels.creator,
            purpose: labels.purpose,
            initial_server_version: labels.initial_server_version,
            image: container.image,
            ip_address: container.ip_address,
            expiry: None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DeployNodeOptions {
    pub purpose: String,
    /// Lifetime from now
    pub expiry: Duration,
    pub cluster_id: String,
    pub image: ImageRef,
    pub image_server_version: String,
    /// Display name; the container name is used when unset
    pub name: Option<String>,
    pub creator: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub network_name: String,
    pub mgmt_port: u16,
    pub removal_poll: PollOptions,
}

impl ControllerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            network_name: config.network_name.clone(),
            mgmt_port: config.mgmt_port,
            removal_poll: config.removal_poll(),
        }
    }
}

pub struct NodeController {
    runtime: Arc<dyn ContainerRuntime>,
    state_store: Arc<dyn NodeStateStore>,
    readiness: Arc<dyn ReadinessProbe>,
    traffic: TrafficController,
    options: ControllerOptions,
    span: Span,
}

/// Absolute expiry `lifetime` from now
fn expiry_from_now(lifetime: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(lifetime)
        .ok()
        .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
        .ok_or_else(|| {
            DeployError::Configuration(format!("expiry {:?} is out of range", lifetime))
        })
}

impl NodeController {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        state_store: Arc<dyn NodeStateStore>,
        readiness: Arc<dyn ReadinessProbe>,
        options: ControllerOptions,
    ) -> Self {
        let span = tracing::info_span!("node_controller", network = %options.network_name);
        let traffic = TrafficController::new(runtime.clone(), options.network_name.clone())
            .with_span(tracing::debug_span!(parent: &span, "traffic_control"));

        Self {
            runtime,
            state_store,
            readiness,
            traffic,
            options,
            span,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.traffic = self
            .traffic
            .with_span(tracing::debug_span!(parent: &span, "traffic_control"));
        self.span = span;
        self
    }

    /// Every managed node, running or not
    #[instrument(parent = &self.span, skip(self))]
    pub async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        debug!("listing nodes");

        let containers = self.runtime.list_containers(labels::CLUSTER_ID).await?;

        let mut nodes = Vec::new();
        for container in containers {
            let Some(mut node) = NodeInfo::from_container(container) else {
                continue;
            };

            match self.state_store.read_state(&node.resource_id).await {
                Ok(state) => node.expiry = state.map(|s| s.expiry),
                Err(e) if e.is_not_found() => {
                    debug!(container = %node.resource_id, "container vanished while reading state")
                }
                Err(e) => {
                    warn!(container = %node.resource_id, error = %e, "failed to read node state")
                }
            }

            nodes.push(node);
        }

        Ok(nodes)
    }

    pub async fn find_node(&self, resource_id: &str) -> Result<Option<NodeInfo>> {
        Ok(self
            .list_nodes()
            .await?
            .into_iter()
            .find(|node| node.resource_id == resource_id))
    }

    /// Create, start and persist a new node, then wait until it is ready.
    ///
    /// Nothing is rolled back on failure; the container carries its labels from
    /// the first step on and can be removed like any other node.
    #[instrument(parent = &self.span, skip_all, fields(cluster_id = %opts.cluster_id, node_id = tracing::field::Empty))]
    pub async fn deploy_node(
        &self,
        opts: &DeployNodeOptions,
        cancel: &CancellationToken,
    ) -> Result<NodeInfo> {
        let node_id = Uuid::new_v4().to_string();
        Span::current().record("node_id", node_id.as_str());

        let expiry = expiry_from_now(opts.expiry).for_resource(&node_id, "invalid node expiry")?;

        let container_name = format!("{}{}", CONTAINER_PREFIX, node_id);
        debug!(image = %opts.image.image_path, "deploying node");

        let node_labels = NodeLabels {
            cluster_id: opts.cluster_id.clone(),
            node_id: node_id.clone(),
            node_name: opts.name.clone().unwrap_or_else(|| container_name.clone()),
            creator: opts.creator.clone().unwrap_or_default(),
            purpose: opts.purpose.clone(),
            initial_server_version: opts.image_server_version.clone(),
        };

        let spec = ContainerSpec {
            name: container_name,
            image: opts.image.image_path.clone(),
            labels: node_labels.to_labels(),
            network: self.options.network_name.clone(),
            cap_add: vec!["NET_ADMIN".to_string()],
            // keeps node clocks in step with the host
            binds: vec!["/etc/localtime:/etc/localtime:ro".to_string()],
            auto_remove: true,
        };

        let resource_id = self
            .runtime
            .create_container(&spec)
            .await
            .for_resource(&node_id, "failed to create container")?;

        debug!(container = %resource_id, "container created, starting");

        self.runtime
            .start_container(&resource_id)
            .await
            .for_resource(&node_id, "failed to start container")?;

        self.state_store
            .write_state(&resource_id, &NodeState { expiry })
            .await
            .for_resource(&node_id, "failed to write node state")?;

        let node = self
            .find_node(&resource_id)
            .await
            .for_resource(&node_id, "failed to list nodes")?
            .ok_or_else(|| {
                DeployError::Consistency(format!(
                    "newly created container {} is not listed",
                    resource_id
                ))
                .for_resource(&node_id, "failed to find node")
            })?;

        let ip_address = node.ip_address.clone().ok_or_else(|| {
            DeployError::Consistency(format!("container {} has no address", resource_id))
                .for_resource(&node_id, "failed to find node address")
        })?;

        debug!(address = %ip_address, "container has started, waiting for it to get ready");

        let endpoint = format!("http://{}:{}", ip_address, self.options.mgmt_port);
        self.readiness
            .wait_until_ready(&endpoint, cancel)
            .await
            .for_resource(&node_id, "failed to wait for node readiness")?;

        info!(container = %resource_id, address = %ip_address, "node is ready");
        Ok(node)
    }

    /// Stop and remove a node container and wait until it is no longer listed.
    ///
    /// A container that is already gone counts as removed.
    #[instrument(parent = &self.span, skip(self, cancel))]
    pub async fn remove_node(&self, resource_id: &str, cancel: &CancellationToken) -> Result<()> {
        debug!("stopping container");

        match self.runtime.stop_container(resource_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("container already gone"),
            Err(e) => return Err(e.for_resource(resource_id, "failed to stop container")),
        }

        debug!("removing container");

        // auto-remove usually beats us to it
        if let Err(e) = self.runtime.remove_container(resource_id).await {
            if !e.is_not_found() {
                debug!(error = %e, "failed to remove container");
            }
        }

        debug!("waiting for container to disappear");

        poll_until(
            "node removal",
            self.options.removal_poll,
            cancel,
            move || async move { Ok(self.find_node(resource_id).await?.is_none()) },
        )
        .await
        .for_resource(resource_id, "failed to remove node")?;

        info!("node has been removed");
        Ok(())
    }

    pub async fn set_traffic_control(&self, resource_id: &str, blocked: bool) -> Result<()> {
        self.traffic.set_traffic_control(resource_id, blocked).await
    }
}
