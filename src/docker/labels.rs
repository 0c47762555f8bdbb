//! Node identity label schema
//!
//! Identity is written as container labels at creation time and never changed.
//! A container without a cluster id label is not a managed node.

use std::collections::HashMap;

pub const CLUSTER_ID: &str = "com.dynocluster.cluster_id";
pub const NODE_ID: &str = "com.dynocluster.node_id";
pub const NODE_NAME: &str = "com.dynocluster.node_name";
pub const CREATOR: &str = "com.dynocluster.creator";
pub const PURPOSE: &str = "com.dynocluster.purpose";
pub const INITIAL_SERVER_VERSION: &str = "com.dynocluster.initial_server_version";

/// Typed view over the identity labels of one node container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeLabels {
    pub cluster_id: String,
    pub node_id: String,
    pub node_name: String,
    pub creator: String,
    pub purpose: String,
    pub initial_server_version: String,
}

impl NodeLabels {
    /// Label map for container creation. Empty optional values are left out.
    pub fn to_labels(&self) -> HashMap<String, String> {
        [
            (CLUSTER_ID, &self.cluster_id),
            (NODE_ID, &self.node_id),
            (NODE_NAME, &self.node_name),
            (CREATOR, &self.creator),
            (PURPOSE, &self.purpose),
            (INITIAL_SERVER_VERSION, &self.initial_server_version),
        ]
        .into_iter()
        .filter(|(key, value)| *key == CLUSTER_ID || !value.is_empty())
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
    }

    /// `None` unless the cluster id label is present and non-empty
    pub fn from_labels(labels: &HashMap<String, String>) -> Option<Self> {
        let get = |key: &str| labels.get(key).cloned().unwrap_or_default();

        let cluster_id = get(CLUSTER_ID);
        if cluster_id.is_empty() {
            return None;
        }

        Some(Self {
            cluster_id,
            node_id: get(NODE_ID),
            node_name: get(NODE_NAME),
            creator: get(CREATOR),
            purpose: get(PURPOSE),
            initial_server_version: get(INITIAL_SERVER_VERSION),
        })
    }
}
