//! Node management REST client
//!
//! Thin wrapper over the server's management (8091) and query (8093) HTTP
//! APIs, enough to bootstrap a cluster, grow or shrink it and manage users,
//! buckets, scopes and collections on it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::clusterdef::Service;
use crate::deployment::{
    BucketInfo, CollectionInfo, CreateBucketOptions, CreateUserOptions, ScopeInfo, UserInfo,
};
use crate::error::{DeployError, Result};
use crate::poll::{poll_until, PollOptions};

const DEFAULT_BUCKET_QUOTA_MB: u32 = 256;

/// Settings applied when a node bootstraps a new cluster
#[derive(Debug, Clone)]
pub struct ClusterInitOptions {
    pub cluster_name: String,
    pub services: Vec<Service>,
    pub kv_quota_mb: u32,
    pub index_quota_mb: u32,
    pub fts_quota_mb: u32,
    pub use_community_edition: bool,
}

impl ClusterInitOptions {
    pub fn new(cluster_name: impl Into<String>, services: Vec<Service>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            services,
            kv_quota_mb: 1024,
            index_quota_mb: 512,
            fts_quota_mb: 512,
            use_community_edition: false,
        }
    }
}

/// A cluster member as the management API reports it
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMember {
    pub otp_node: String,
    pub hostname: String,
}

impl ClusterMember {
    /// Host part of `hostname`, without the port
    pub fn host(&self) -> &str {
        self.hostname
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.hostname)
    }
}

#[derive(Debug, Deserialize)]
struct PoolDefault {
    #[serde(default)]
    nodes: Vec<ClusterMember>,
}

#[derive(Debug, Deserialize)]
struct RebalanceProgress {
    status: String,
}

#[derive(Debug, Deserialize)]
struct RawRole {
    role: String,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    id: String,
    #[serde(default)]
    roles: Vec<RawRole>,
}

#[derive(Debug, Deserialize)]
struct RawBucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawCollection {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawScope {
    name: String,
    #[serde(default)]
    collections: Vec<RawCollection>,
}

#[derive(Debug, Deserialize)]
struct RawScopes {
    #[serde(default)]
    scopes: Vec<RawScope>,
}

const READ_ROLES: &[&str] = &["data_reader[*]", "query_select[*]"];
const WRITE_ROLES: &[&str] = &[
    "data_writer[*]",
    "query_insert[*]",
    "query_update[*]",
    "query_delete[*]",
];

/// Role list granted for the requested access
fn roles_for(can_read: bool, can_write: bool) -> String {
    let mut roles: Vec<&str> = Vec::new();
    if can_read {
        roles.extend_from_slice(READ_ROLES);
    }
    if can_write {
        roles.extend_from_slice(WRITE_ROLES);
    }
    roles.join(",")
}

fn user_info(raw: RawUser) -> UserInfo {
    let has = |names: &[&str]| raw.roles.iter().any(|r| names.contains(&r.role.as_str()));

    UserInfo {
        can_read: has(&["admin", "data_reader", "ro_admin"]),
        can_write: has(&["admin", "data_writer"]),
        username: raw.id,
    }
}

fn scope_info(raw: RawScope) -> ScopeInfo {
    ScopeInfo {
        name: raw.name,
        collections: raw
            .collections
            .into_iter()
            .map(|c| CollectionInfo { name: c.name })
            .collect(),
    }
}

async fn expect_success(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(DeployError::Backend(format!(
        "{} failed with status {}: {}",
        what,
        status,
        body.trim()
    )))
}

pub struct NodeManager {
    client: reqwest::Client,
    host: String,
    mgmt_port: u16,
    query_port: u16,
    username: String,
    password: String,
}

impl NodeManager {
    pub fn new(
        host: impl Into<String>,
        mgmt_port: u16,
        query_port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            host: host.into(),
            mgmt_port,
            query_port,
            username: username.into(),
            password: password.into(),
        })
    }

    pub fn mgmt_endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.mgmt_port)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.mgmt_endpoint(), path)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = request
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        expect_success(response, what).await
    }

    /// Turn a fresh node into a single-node cluster and set the admin credentials
    #[instrument(skip(self, opts), fields(host = %self.host))]
    pub async fn cluster_init(&self, opts: &ClusterInitOptions) -> Result<()> {
        let storage_mode = if opts.use_community_edition {
            "forestdb"
        } else {
            "plasma"
        };

        let form = [
            ("hostname", self.host.clone()),
            ("services", Service::join(&opts.services)),
            ("username", self.username.clone()),
            ("password", self.password.clone()),
            ("port", "SAME".to_string()),
            ("clusterName", opts.cluster_name.clone()),
            ("memoryQuota", opts.kv_quota_mb.to_string()),
            ("indexMemoryQuota", opts.index_quota_mb.to_string()),
            ("ftsMemoryQuota", opts.fts_quota_mb.to_string()),
            ("indexerStorageMode", storage_mode.to_string()),
        ];

        self.send(
            self.client.post(self.url("/clusterInit")).form(&form),
            "cluster init",
        )
        .await?;

        info!("cluster initialized");
        Ok(())
    }

    #[instrument(skip(self, services), fields(host = %self.host))]
    pub async fn add_node(&self, hostname: &str, services: &[Service]) -> Result<()> {
        let form = [
            ("hostname", hostname.to_string()),
            ("user", self.username.clone()),
            ("password", self.password.clone()),
            ("services", Service::join(services)),
        ];

        self.send(
            self.client.post(self.url("/controller/addNode")).form(&form),
            "add node",
        )
        .await?;
        Ok(())
    }

    pub async fn list_members(&self) -> Result<Vec<ClusterMember>> {
        let pool: PoolDefault = self
            .send(self.client.get(self.url("/pools/default")), "list nodes")
            .await?
            .json()
            .await?;
        Ok(pool.nodes)
    }

    /// Rebalance every current member in, ejecting the members on `eject_hosts`
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn rebalance(&self, eject_hosts: &[String]) -> Result<()> {
        let members = self.list_members().await?;

        let known: Vec<&str> = members.iter().map(|m| m.otp_node.as_str()).collect();
        let ejected: Vec<&str> = members
            .iter()
            .filter(|m| eject_hosts.iter().any(|h| h == m.host()))
            .map(|m| m.otp_node.as_str())
            .collect();

        debug!(known = ?known, ejected = ?ejected, "starting rebalance");

        let form = [
            ("knownNodes", known.join(",")),
            ("ejectedNodes", ejected.join(",")),
        ];
        self.send(
            self.client.post(self.url("/controller/rebalance")).form(&form),
            "rebalance",
        )
        .await?;
        Ok(())
    }

    pub async fn rebalance_running(&self) -> Result<bool> {
        let progress: RebalanceProgress = self
            .send(
                self.client.get(self.url("/pools/default/rebalanceProgress")),
                "rebalance progress",
            )
            .await?
            .json()
            .await?;
        Ok(progress.status != "none")
    }

    pub async fn wait_for_rebalance(
        &self,
        opts: PollOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        poll_until("rebalance", opts, cancel, move || async move {
            Ok(!self.rebalance_running().await?)
        })
        .await
    }

    pub async fn list_users(&self) -> Result<Vec<UserInfo>> {
        let users: Vec<RawUser> = self
            .send(self.client.get(self.url("/settings/rbac/users")), "list users")
            .await?
            .json()
            .await?;
        Ok(users.into_iter().map(user_info).collect())
    }

    pub async fn create_user(&self, opts: &CreateUserOptions) -> Result<()> {
        let form = [
            ("password", opts.password.clone()),
            ("roles", roles_for(opts.can_read, opts.can_write)),
        ];
        let path = format!("/settings/rbac/users/local/{}", opts.username);

        self.send(self.client.put(self.url(&path)).form(&form), "create user")
            .await?;
        Ok(())
    }

    pub async fn delete_user(&self, username: &str) -> Result<()> {
        let path = format!("/settings/rbac/users/local/{}", username);
        self.send(self.client.delete(self.url(&path)), "delete user")
            .await?;
        Ok(())
    }

    pub async fn list_buckets(&self) -> Result<Vec<BucketInfo>> {
        let buckets: Vec<RawBucket> = self
            .send(
                self.client.get(self.url("/pools/default/buckets")),
                "list buckets",
            )
            .await?
            .json()
            .await?;
        Ok(buckets
            .into_iter()
            .map(|b| BucketInfo { name: b.name })
            .collect())
    }

    pub async fn create_bucket(&self, opts: &CreateBucketOptions) -> Result<()> {
        let quota = if opts.ram_quota_mb == 0 {
            DEFAULT_BUCKET_QUOTA_MB
        } else {
            opts.ram_quota_mb
        };
        let form = [
            ("name", opts.name.clone()),
            ("bucketType", "couchbase".to_string()),
            ("ramQuotaMB", quota.to_string()),
            ("flushEnabled", "1".to_string()),
        ];

        self.send(
            self.client
                .post(self.url("/pools/default/buckets"))
                .form(&form),
            "create bucket",
        )
        .await?;
        Ok(())
    }

    pub async fn delete_bucket(&self, bucket_name: &str) -> Result<()> {
        let path = format!("/pools/default/buckets/{}", bucket_name);
        self.send(self.client.delete(self.url(&path)), "delete bucket")
            .await?;
        Ok(())
    }

    pub async fn get_certificate(&self) -> Result<String> {
        Ok(self
            .send(
                self.client.get(self.url("/pools/default/certificate")),
                "get certificate",
            )
            .await?
            .text()
            .await?)
    }

    pub async fn execute_query(&self, statement: &str) -> Result<String> {
        let url = format!("http://{}:{}/query/service", self.host, self.query_port);
        Ok(self
            .send(
                self.client.post(url).form(&[("statement", statement)]),
                "execute query",
            )
            .await?
            .text()
            .await?)
    }

    pub async fn list_scopes(&self, bucket_name: &str) -> Result<Vec<ScopeInfo>> {
        let path = format!("/pools/default/buckets/{}/scopes", bucket_name);
        let scopes: RawScopes = self
            .send(self.client.get(self.url(&path)), "list collections")
            .await?
            .json()
            .await?;
        Ok(scopes.scopes.into_iter().map(scope_info).collect())
    }

    pub async fn create_scope(&self, bucket_name: &str, scope_name: &str) -> Result<()> {
        let path = format!("/pools/default/buckets/{}/scopes", bucket_name);
        self.send(
            self.client
                .post(self.url(&path))
                .form(&[("name", scope_name)]),
            "create scope",
        )
        .await?;
        Ok(())
    }

    pub async fn create_collection(
        &self,
        bucket_name: &str,
        scope_name: &str,
        collection_name: &str,
    ) -> Result<()> {
        let path = format!(
            "/pools/default/buckets/{}/scopes/{}/collections",
            bucket_name, scope_name
        );
        self.send(
            self.client
                .post(self.url(&path))
                .form(&[("name", collection_name)]),
            "create collection",
        )
        .await?;
        Ok(())
    }

    pub async fn delete_scope(&self, bucket_name: &str, scope_name: &str) -> Result<()> {
        let path = format!("/pools/default/buckets/{}/scopes/{}", bucket_name, scope_name);
        self.send(self.client.delete(self.url(&path)), "delete scope")
            .await?;
        Ok(())
    }

    pub async fn delete_collection(
        &self,
        bucket_name: &str,
        scope_name: &str,
        collection_name: &str,
    ) -> Result<()> {
        let path = format!(
            "/pools/default/buckets/{}/scopes/{}/collections/{}",
            bucket_name, scope_name, collection_name
        );
        self.send(self.client.delete(self.url(&path)), "delete collection")
            .await?;
        Ok(())
    }
}

/// Cluster membership changes, addressed by the host of a node already in the cluster
#[async_trait]
pub trait ClusterTopology: Send + Sync {
    /// Bootstrap a single-node cluster on `host`
    async fn initialize(&self, host: &str, opts: &ClusterInitOptions) -> Result<()>;

    /// Add `new_host` to the cluster `host` belongs to, without rebalancing
    async fn join(&self, host: &str, new_host: &str, services: &[Service]) -> Result<()>;

    /// Rebalance, ejecting `eject_hosts`, and wait for it to finish
    async fn rebalance(
        &self,
        host: &str,
        eject_hosts: &[String],
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// [`ClusterTopology`] over the management REST API
#[derive(Debug, Clone)]
pub struct RestTopology {
    pub mgmt_port: u16,
    pub query_port: u16,
    pub username: String,
    pub password: String,
    pub rebalance_poll: PollOptions,
}

impl RestTopology {
    pub fn manager(&self, host: &str) -> Result<NodeManager> {
        NodeManager::new(
            host,
            self.mgmt_port,
            self.query_port,
            self.username.clone(),
            self.password.clone(),
        )
    }
}

#[async_trait]
impl ClusterTopology for RestTopology {
    async fn initialize(&self, host: &str, opts: &ClusterInitOptions) -> Result<()> {
        self.manager(host)?.cluster_init(opts).await
    }

    async fn join(&self, host: &str, new_host: &str, services: &[Service]) -> Result<()> {
        self.manager(host)?.add_node(new_host, services).await
    }

    async fn rebalance(
        &self,
        host: &str,
        eject_hosts: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let manager = self.manager(host)?;
        manager.rebalance(eject_hosts).await?;
        manager.wait_for_rebalance(self.rebalance_poll, cancel).await
    }
}
