//! Out-of-band node metadata
//!
//! A node's persisted state is written once, right after its resource starts,
//! and lives exactly as long as the resource. Backends plug in their own
//! storage behind [`NodeStateStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub expiry: DateTime<Utc>,
}

#[async_trait]
pub trait NodeStateStore: Send + Sync {
    async fn write_state(&self, resource_id: &str, state: &NodeState) -> Result<()>;

    /// `Ok(None)` when nothing was ever written for this resource
    async fn read_state(&self, resource_id: &str) -> Result<Option<NodeState>>;
}
