//! Declarative cluster definitions
//!
//! A [`ClusterDef`] says how many nodes of which server image and which
//! services a cluster should have. Deployers turn it into running nodes and can
//! derive an approximate definition back from a running cluster.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{DeployError, Result};
use crate::image::ImageDef;

/// Server services a node can run, named as the management API names them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum Service {
    #[serde(rename = "kv")]
    #[strum(serialize = "kv")]
    Kv,
    #[serde(rename = "n1ql")]
    #[strum(serialize = "n1ql")]
    Query,
    #[serde(rename = "index")]
    #[strum(serialize = "index")]
    Index,
    #[serde(rename = "fts")]
    #[strum(serialize = "fts")]
    Search,
    #[serde(rename = "cbas")]
    #[strum(serialize = "cbas")]
    Analytics,
    #[serde(rename = "eventing")]
    #[strum(serialize = "eventing")]
    Eventing,
    #[serde(rename = "backup")]
    #[strum(serialize = "backup")]
    Backup,
}

impl Service {
    /// Services a node gets when its group names none
    pub fn defaults() -> Vec<Service> {
        vec![Service::Kv, Service::Query, Service::Index, Service::Search]
    }

    /// Comma-separated form used by `/clusterInit` and `/controller/addNode`
    pub fn join(services: &[Service]) -> String {
        services
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn parse_list(list: &str) -> Result<Vec<Service>> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                Service::from_str(s)
                    .map_err(|_| DeployError::Configuration(format!("unknown service `{}`", s)))
            })
            .collect()
    }
}

/// A group of identical nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroupDef {
    #[serde(default = "default_count")]
    pub count: usize,
    pub version: String,
    #[serde(default)]
    pub build_no: u32,
    #[serde(default)]
    pub use_community_edition: bool,
    #[serde(default)]
    pub use_serverless: bool,
    #[serde(default)]
    pub use_columnar: bool,
    #[serde(default)]
    pub services: Vec<Service>,
}

fn default_count() -> usize {
    1
}

impl NodeGroupDef {
    pub fn new(version: impl Into<String>, count: usize) -> Self {
        Self {
            count,
            version: version.into(),
            build_no: 0,
            use_community_edition: false,
            use_serverless: false,
            use_columnar: false,
            services: Vec::new(),
        }
    }

    /// A group of `count` nodes running `image`, with default services
    pub fn from_image_def(image: ImageDef, count: usize) -> Self {
        Self {
            count,
            version: image.version,
            build_no: image.build_no,
            use_community_edition: image.use_community_edition,
            use_serverless: image.use_serverless,
            use_columnar: image.use_columnar,
            services: Vec::new(),
        }
    }

    pub fn image_def(&self) -> ImageDef {
        ImageDef {
            version: self.version.clone(),
            build_no: self.build_no,
            use_community_edition: self.use_community_edition,
            use_serverless: self.use_serverless,
            use_columnar: self.use_columnar,
        }
    }

    /// Configured services, or the defaults when none are listed
    pub fn effective_services(&self) -> Vec<Service> {
        if self.services.is_empty() {
            Service::defaults()
        } else {
            self.services.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDef {
    #[serde(default)]
    pub purpose: String,
    /// Lifetime from creation; the deployer's default applies when unset
    #[serde(default)]
    pub expiry: Option<Duration>,
    pub nodes: Vec<NodeGroupDef>,
}

impl ClusterDef {
    pub fn node_count(&self) -> usize {
        self.nodes.iter().map(|group| group.count).sum()
    }

    /// Every node in the cluster, expanded from the groups in order
    pub fn expand_nodes(&self) -> Vec<&NodeGroupDef> {
        self.nodes
            .iter()
            .flat_map(|group| std::iter::repeat(group).take(group.count))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_count() == 0 {
            return Err(DeployError::Configuration(
                "cluster definition must contain at least one node".to_string(),
            ));
        }

        if let Some(group) = self.nodes.iter().find(|g| g.version.trim().is_empty()) {
            return Err(DeployError::Configuration(format!(
                "node group of {} node(s) has no server version",
                group.count
            )));
        }

        Ok(())
    }
}
