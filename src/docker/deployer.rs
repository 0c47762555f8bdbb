//! [`Deployer`] for local containers
//!
//! Clusters are not stored anywhere: a cluster is the set of node containers
//! sharing a cluster id label, and everything about it is derived from those.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};
use uuid::Uuid;

use super::controller::{ControllerOptions, DeployNodeOptions, NodeController, NodeInfo};
use super::images::{image_def_for, ImageProvider, LocalImageProvider};
use super::runtime::DockerRuntime;
use super::state::ContainerStateStore;
use crate::clusterdef::{ClusterDef, NodeGroupDef, Service};
use crate::config::Config;
use crate::deployment::{
    BucketInfo, ClusterInfo, ClusterNodeInfo, ClusterState, ConnectInfo, CreateBucketOptions,
    CreateUserOptions, Deployer, ScopeInfo, UserInfo,
};
use crate::error::{DeployError, Result};
use crate::image::ImageDef;
use crate::mgmt::{ClusterInitOptions, ClusterTopology, NodeManager, RestTopology};
use crate::readiness::HttpReadinessProbe;

#[derive(Debug, Clone)]
pub struct DeployerOptions {
    pub mgmt_port: u16,
    pub query_port: u16,
    pub username: String,
    pub password: String,
    pub default_expiry: Duration,
    pub creator: Option<String>,
}

impl DeployerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            mgmt_port: config.mgmt_port,
            query_port: config.query_port,
            username: config.username.clone(),
            password: config.password.clone(),
            default_expiry: config.default_expiry(),
            creator: config.creator.clone(),
        }
    }
}

pub struct DockerDeployer {
    controller: NodeController,
    images: Arc<dyn ImageProvider>,
    topology: Arc<dyn ClusterTopology>,
    options: DeployerOptions,
    span: Span,
}

/// Nodes grouped into clusters, ordered by cluster id
pub fn summarize_clusters(nodes: Vec<NodeInfo>) -> Vec<ClusterInfo> {
    let mut clusters: BTreeMap<String, Vec<NodeInfo>> = BTreeMap::new();
    for node in nodes {
        clusters.entry(node.cluster_id.clone()).or_default().push(node);
    }

    clusters
        .into_iter()
        .map(|(cluster_id, nodes)| ClusterInfo {
            purpose: nodes
                .iter()
                .map(|n| n.purpose.clone())
                .find(|p| !p.is_empty())
                .unwrap_or_default(),
            expiry: earliest_expiry(&nodes),
            state: if nodes.iter().all(|n| n.ip_address.is_some()) {
                ClusterState::Ready
            } else {
                ClusterState::Pending
            },
            nodes: nodes
                .into_iter()
                .map(|n| ClusterNodeInfo {
                    node_id: n.node_id,
                    resource_id: n.resource_id,
                    name: n.name,
                    ip_address: n.ip_address,
                })
                .collect(),
            cluster_id,
        })
        .collect()
}

fn earliest_expiry(nodes: &[NodeInfo]) -> Option<DateTime<Utc>> {
    nodes.iter().filter_map(|n| n.expiry).min()
}

/// `7.2.0-1234` into version and build number
fn split_server_version(server_version: &str) -> (String, u32) {
    match server_version.rsplit_once('-') {
        Some((version, build)) => match build.parse() {
            Ok(build_no) => (version.to_string(), build_no),
            Err(_) => (server_version.to_string(), 0),
        },
        None => (server_version.to_string(), 0),
    }
}

/// Edition flags come from the image tag; the version label is the fallback
/// for images not tagged the way the local provider tags them
fn node_image_def(node: &NodeInfo) -> ImageDef {
    image_def_for(&node.image).unwrap_or_else(|| {
        let (version, build_no) = split_server_version(&node.initial_server_version);
        ImageDef {
            version,
            build_no,
            ..Default::default()
        }
    })
}

fn node_host(node: &NodeInfo) -> Result<&str> {
    node.ip_address.as_deref().ok_or_else(|| {
        DeployError::Consistency(format!("node {} has no address", node.node_id))
    })
}

impl DockerDeployer {
    pub fn new(
        controller: NodeController,
        images: Arc<dyn ImageProvider>,
        topology: Arc<dyn ClusterTopology>,
        options: DeployerOptions,
    ) -> Self {
        Self {
            controller,
            images,
            topology,
            options,
            span: tracing::info_span!("docker_deployer"),
        }
    }

    /// Wire up the Docker-backed stack from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let span = tracing::info_span!("docker_deployer");
        let controller_span =
            tracing::info_span!(parent: &span, "node_controller", network = %config.network_name);

        let runtime = Arc::new(DockerRuntime::connect(config.docker_host.as_deref())?);
        let state_store = Arc::new(
            ContainerStateStore::new(runtime.clone())
                .with_span(tracing::debug_span!(parent: &controller_span, "node_state")),
        );
        let readiness = Arc::new(HttpReadinessProbe::new(config.readiness_poll())?);

        let controller = NodeController::new(
            runtime.clone(),
            state_store,
            readiness,
            ControllerOptions::from_config(config),
        )
        .with_span(controller_span);
        let images = Arc::new(LocalImageProvider::new(
            runtime,
            config.image_repository.clone(),
        ));
        let topology = Arc::new(RestTopology {
            mgmt_port: config.mgmt_port,
            query_port: config.query_port,
            username: config.username.clone(),
            password: config.password.clone(),
            rebalance_poll: config.readiness_poll(),
        });

        Ok(Self {
            controller,
            images,
            topology,
            options: DeployerOptions::from_config(config),
            span,
        })
    }

    pub fn controller(&self) -> &NodeController {
        &self.controller
    }

    pub fn images(&self) -> &dyn ImageProvider {
        self.images.as_ref()
    }

    /// Nodes of one cluster; an unknown cluster is [`DeployError::ResourceNotFound`]
    async fn cluster_nodes(&self, cluster_id: &str) -> Result<Vec<NodeInfo>> {
        let nodes: Vec<NodeInfo> = self
            .controller
            .list_nodes()
            .await?
            .into_iter()
            .filter(|n| n.cluster_id == cluster_id)
            .collect();

        if nodes.is_empty() {
            return Err(DeployError::ResourceNotFound(format!(
                "cluster {} has no nodes",
                cluster_id
            )));
        }
        Ok(nodes)
    }

    async fn get_cluster(&self, cluster_id: &str) -> Result<ClusterInfo> {
        summarize_clusters(self.cluster_nodes(cluster_id).await?)
            .into_iter()
            .next()
            .ok_or_else(|| DeployError::ResourceNotFound(format!("cluster {}", cluster_id)))
    }

    async fn manager(&self, cluster_id: &str) -> Result<NodeManager> {
        let nodes = self.cluster_nodes(cluster_id).await?;
        let host = nodes
            .iter()
            .find_map(|n| n.ip_address.clone())
            .ok_or_else(|| {
                DeployError::Consistency(format!("no node of cluster {} has an address", cluster_id))
            })?;

        NodeManager::new(
            host,
            self.options.mgmt_port,
            self.options.query_port,
            self.options.username.clone(),
            self.options.password.clone(),
        )
    }

    /// Resolve images and build deploy options for each node to create
    async fn plan_nodes(
        &self,
        cluster_id: &str,
        purpose: &str,
        expiry: Duration,
        groups: &[&NodeGroupDef],
    ) -> Result<Vec<(DeployNodeOptions, Vec<Service>)>> {
        let mut plans = Vec::with_capacity(groups.len());
        for group in groups {
            let image_def = group.image_def();
            let image = self.images.get_image(&image_def).await?;

            plans.push((
                DeployNodeOptions {
                    purpose: purpose.to_string(),
                    expiry,
                    cluster_id: cluster_id.to_string(),
                    image,
                    image_server_version: image_def.server_version(),
                    name: None,
                    creator: self.options.creator.clone(),
                },
                group.effective_services(),
            ));
        }
        Ok(plans)
    }

    async fn deploy_all(
        &self,
        plans: &[(DeployNodeOptions, Vec<Service>)],
        cancel: &CancellationToken,
    ) -> Result<Vec<(NodeInfo, Vec<Service>)>> {
        try_join_all(plans.iter().map(|(opts, services)| async move {
            let node = self.controller.deploy_node(opts, cancel).await?;
            Ok::<_, DeployError>((node, services.clone()))
        }))
        .await
    }

    /// Bootstrap on the first node, join the rest and rebalance them in
    async fn form_cluster(
        &self,
        cluster_id: &str,
        nodes: &[(NodeInfo, Vec<Service>)],
        use_community_edition: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(((first, first_services), rest)) = nodes.split_first() else {
            return Ok(());
        };
        let host = node_host(first)?;

        let mut init = ClusterInitOptions::new(cluster_id, first_services.clone());
        init.use_community_edition = use_community_edition;
        self.topology.initialize(host, &init).await?;

        for (node, services) in rest {
            self.topology.join(host, node_host(node)?, services).await?;
        }

        if !rest.is_empty() {
            self.topology.rebalance(host, &[], cancel).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Deployer for DockerDeployer {
    async fn list_clusters(&self) -> Result<Vec<ClusterInfo>> {
        Ok(summarize_clusters(self.controller.list_nodes().await?))
    }

    async fn new_cluster(
        &self,
        def: &ClusterDef,
        cancel: &CancellationToken,
    ) -> Result<ClusterInfo> {
        let cluster_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!(parent: &self.span, "new_cluster", cluster_id = %cluster_id);

        async {
            def.validate()?;

            let expiry = def.expiry.unwrap_or(self.options.default_expiry);
            info!(nodes = def.node_count(), ?expiry, "deploying cluster");

            let plans = self
                .plan_nodes(&cluster_id, &def.purpose, expiry, &def.expand_nodes())
                .await?;
            let nodes = self.deploy_all(&plans, cancel).await?;

            let community = def.nodes.iter().any(|g| g.use_community_edition);
            self.form_cluster(&cluster_id, &nodes, community, cancel)
                .await?;

            info!("cluster is ready");
            self.get_cluster(&cluster_id).await
        }
        .instrument(span)
        .await
    }

    async fn get_definition(&self, cluster_id: &str) -> Result<ClusterDef> {
        let nodes = self.cluster_nodes(cluster_id).await?;

        let mut groups: Vec<NodeGroupDef> = Vec::new();
        for node in &nodes {
            let image_def = node_image_def(node);
            match groups.iter_mut().find(|g| g.image_def() == image_def) {
                Some(group) => group.count += 1,
                None => groups.push(NodeGroupDef::from_image_def(image_def, 1)),
            }
        }

        Ok(ClusterDef {
            purpose: nodes[0].purpose.clone(),
            expiry: earliest_expiry(&nodes)
                .map(|expiry| (expiry - Utc::now()).to_std().unwrap_or_default()),
            nodes: groups,
        })
    }

    async fn modify_cluster(
        &self,
        cluster_id: &str,
        def: &ClusterDef,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let span = tracing::info_span!(parent: &self.span, "modify_cluster", cluster_id);

        async {
            def.validate()?;

            let current = self.cluster_nodes(cluster_id).await?;
            let desired = def.expand_nodes();
            let host = node_host(&current[0])?.to_string();

            debug!(current = current.len(), desired = desired.len(), "reconciling node count");

            if desired.len() > current.len() {
                // new nodes expire with the rest of the cluster
                let expiry = earliest_expiry(&current)
                    .map(|expiry| (expiry - Utc::now()).to_std().unwrap_or_default())
                    .unwrap_or(self.options.default_expiry);

                let plans = self
                    .plan_nodes(
                        cluster_id,
                        &current[0].purpose,
                        expiry,
                        &desired[current.len()..],
                    )
                    .await?;
                let added = self.deploy_all(&plans, cancel).await?;

                for (node, services) in &added {
                    self.topology.join(&host, node_host(node)?, services).await?;
                }
                self.topology.rebalance(&host, &[], cancel).await?;

                info!(added = added.len(), "cluster grown");
            } else if desired.len() < current.len() {
                let surplus = &current[desired.len()..];
                let eject: Vec<String> = surplus
                    .iter()
                    .filter_map(|n| n.ip_address.clone())
                    .collect();

                self.topology.rebalance(&host, &eject, cancel).await?;

                for node in surplus {
                    self.controller.remove_node(&node.resource_id, cancel).await?;
                }

                info!(removed = surplus.len(), "cluster shrunk");
            } else {
                debug!("node count unchanged");
            }

            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn remove_cluster(&self, cluster_id: &str, cancel: &CancellationToken) -> Result<()> {
        let span = tracing::info_span!(parent: &self.span, "remove_cluster", cluster_id);

        async {
            let nodes = self.cluster_nodes(cluster_id).await?;
            try_join_all(
                nodes
                    .iter()
                    .map(|node| self.controller.remove_node(&node.resource_id, cancel)),
            )
            .await?;

            info!(nodes = nodes.len(), "cluster removed");
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn remove_all(&self, cancel: &CancellationToken) -> Result<()> {
        let span = tracing::info_span!(parent: &self.span, "remove_all");

        async {
            let nodes = self.controller.list_nodes().await?;
            try_join_all(
                nodes
                    .iter()
                    .map(|node| self.controller.remove_node(&node.resource_id, cancel)),
            )
            .await?;

            info!(nodes = nodes.len(), "all nodes removed");
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn cleanup(&self, cancel: &CancellationToken) -> Result<()> {
        let span = tracing::info_span!(parent: &self.span, "cleanup");

        async {
            let now = Utc::now();
            let mut first_failure = None;
            let mut failed = 0usize;

            for node in self.controller.list_nodes().await? {
                match node.expiry {
                    Some(expiry) if expiry <= now => {
                        info!(node_id = %node.node_id, cluster_id = %node.cluster_id, %expiry, "removing expired node");
                        if let Err(e) = self.controller.remove_node(&node.resource_id, cancel).await {
                            if e.is_cancelled() {
                                return Err(e);
                            }
                            warn!(node_id = %node.node_id, error = %e, "failed to remove expired node");
                            failed += 1;
                            first_failure.get_or_insert(e);
                        }
                    }
                    Some(_) => {}
                    None => {
                        warn!(node_id = %node.node_id, cluster_id = %node.cluster_id, "node expiry is unknown, leaving it in place")
                    }
                }
            }

            match first_failure {
                Some(e) => {
                    warn!(failed, "cleanup left expired nodes behind");
                    Err(e)
                }
                None => Ok(()),
            }
        }
        .instrument(span)
        .await
    }

    async fn get_connect_info(&self, cluster_id: &str) -> Result<ConnectInfo> {
        let nodes = self.cluster_nodes(cluster_id).await?;
        let hosts: Vec<&str> = nodes
            .iter()
            .filter_map(|n| n.ip_address.as_deref())
            .collect();

        let Some(first) = hosts.first() else {
            return Err(DeployError::Consistency(format!(
                "no node of cluster {} has an address",
                cluster_id
            )));
        };

        Ok(ConnectInfo {
            conn_str: format!("couchbase://{}", hosts.join(",")),
            mgmt: format!("http://{}:{}", first, self.options.mgmt_port),
        })
    }

    async fn list_users(&self, cluster_id: &str) -> Result<Vec<UserInfo>> {
        self.manager(cluster_id).await?.list_users().await
    }

    async fn create_user(&self, cluster_id: &str, opts: &CreateUserOptions) -> Result<()> {
        self.manager(cluster_id).await?.create_user(opts).await
    }

    async fn delete_user(&self, cluster_id: &str, username: &str) -> Result<()> {
        self.manager(cluster_id).await?.delete_user(username).await
    }

    async fn list_buckets(&self, cluster_id: &str) -> Result<Vec<BucketInfo>> {
        self.manager(cluster_id).await?.list_buckets().await
    }

    async fn create_bucket(&self, cluster_id: &str, opts: &CreateBucketOptions) -> Result<()> {
        self.manager(cluster_id).await?.create_bucket(opts).await
    }

    async fn delete_bucket(&self, cluster_id: &str, bucket_name: &str) -> Result<()> {
        self.manager(cluster_id)
            .await?
            .delete_bucket(bucket_name)
            .await
    }

    async fn get_certificate(&self, cluster_id: &str) -> Result<String> {
        self.manager(cluster_id).await?.get_certificate().await
    }

    async fn execute_query(&self, cluster_id: &str, query: &str) -> Result<String> {
        self.manager(cluster_id).await?.execute_query(query).await
    }

    async fn list_collections(
        &self,
        cluster_id: &str,
        bucket_name: &str,
    ) -> Result<Vec<ScopeInfo>> {
        self.manager(cluster_id)
            .await?
            .list_scopes(bucket_name)
            .await
    }

    async fn create_scope(
        &self,
        cluster_id: &str,
        bucket_name: &str,
        scope_name: &str,
    ) -> Result<()> {
        self.manager(cluster_id)
            .await?
            .create_scope(bucket_name, scope_name)
            .await
    }

    async fn create_collection(
        &self,
        cluster_id: &str,
        bucket_name: &str,
        scope_name: &str,
        collection_name: &str,
    ) -> Result<()> {
        self.manager(cluster_id)
            .await?
            .create_collection(bucket_name, scope_name, collection_name)
            .await
    }

    async fn delete_scope(
        &self,
        cluster_id: &str,
        bucket_name: &str,
        scope_name: &str,
    ) -> Result<()> {
        self.manager(cluster_id)
            .await?
            .delete_scope(bucket_name, scope_name)
            .await
    }

    async fn delete_collection(
        &self,
        cluster_id: &str,
        bucket_name: &str,
        scope_name: &str,
        collection_name: &str,
    ) -> Result<()> {
        self.manager(cluster_id)
            .await?
            .delete_collection(bucket_name, scope_name, collection_name)
            .await
    }
}
