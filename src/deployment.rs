//! Backend-agnostic cluster deployment surface
//!
//! [`Deployer`] is what callers program against; the container backend in
//! [`crate::docker::deployer`] is one implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio_util::sync::CancellationToken;

use crate::clusterdef::ClusterDef;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ClusterState {
    /// Some node has no address yet
    Pending,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNodeInfo {
    pub node_id: String,
    pub resource_id: String,
    pub name: String,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub cluster_id: String,
    pub purpose: String,
    /// Earliest known node expiry; `None` when no node's expiry is known
    pub expiry: Option<DateTime<Utc>>,
    pub state: ClusterState,
    pub nodes: Vec<ClusterNodeInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectInfo {
    pub conn_str: String,
    pub mgmt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
    pub can_read: bool,
    pub can_write: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUserOptions {
    pub username: String,
    pub password: String,
    pub can_read: bool,
    pub can_write: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketInfo {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBucketOptions {
    pub name: String,
    /// Zero selects the server-side default quota
    pub ram_quota_mb: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeInfo {
    pub name: String,
    pub collections: Vec<CollectionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
}

/// An image a backend can deploy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub source: String,
    pub name: String,
    pub version: String,
}

#[async_trait]
pub trait Deployer: Send + Sync {
    async fn list_clusters(&self) -> Result<Vec<ClusterInfo>>;

    async fn new_cluster(&self, def: &ClusterDef, cancel: &CancellationToken)
        -> Result<ClusterInfo>;

    /// Definition reconstructed from the running nodes
    async fn get_definition(&self, cluster_id: &str) -> Result<ClusterDef>;

    async fn modify_cluster(
        &self,
        cluster_id: &str,
        def: &ClusterDef,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn remove_cluster(&self, cluster_id: &str, cancel: &CancellationToken) -> Result<()>;

    async fn remove_all(&self, cancel: &CancellationToken) -> Result<()>;

    /// Remove clusters whose expiry has passed
    async fn cleanup(&self, cancel: &CancellationToken) -> Result<()>;

    async fn get_connect_info(&self, cluster_id: &str) -> Result<ConnectInfo>;

    async fn list_users(&self, cluster_id: &str) -> Result<Vec<UserInfo>>;

    async fn create_user(&self, cluster_id: &str, opts: &CreateUserOptions) -> Result<()>;

    async fn delete_user(&self, cluster_id: &str, username: &str) -> Result<()>;

    async fn list_buckets(&self, cluster_id: &str) -> Result<Vec<BucketInfo>>;

    async fn create_bucket(&self, cluster_id: &str, opts: &CreateBucketOptions) -> Result<()>;

    async fn delete_bucket(&self, cluster_id: &str, bucket_name: &str) -> Result<()>;

    /// PEM-encoded cluster CA certificate
    async fn get_certificate(&self, cluster_id: &str) -> Result<String>;

    /// Raw JSON response of the query service
    async fn execute_query(&self, cluster_id: &str, query: &str) -> Result<String>;

    async fn list_collections(&self, cluster_id: &str, bucket_name: &str)
        -> Result<Vec<ScopeInfo>>;

    async fn create_scope(&self, cluster_id: &str, bucket_name: &str, scope_name: &str)
        -> Result<()>;

    async fn create_collection(
        &self,
        cluster_id: &str,
        bucket_name: &str,
        scope_name: &str,
        collection_name: &str,
    ) -> Result<()>;

    async fn delete_scope(&self, cluster_id: &str, bucket_name: &str, scope_name: &str)
        -> Result<()>;

    async fn delete_collection(
        &self,
        cluster_id: &str,
        bucket_name: &str,
        scope_name: &str,
        collection_name: &str,
    ) -> Result<()>;
}
