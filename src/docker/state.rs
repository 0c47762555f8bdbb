//! Node state kept inside the node container's own filesystem
//!
//! Containers have no metadata store that can be written after creation, so
//! the state is JSON-encoded, wrapped as a single tar entry and copied to a
//! fixed path inside the container. It disappears with the container.

use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, Instrument, Span};

use super::runtime::ContainerRuntime;
use crate::error::{DeployError, Result};
use crate::state::{NodeState, NodeStateStore};

/// Directory the state archive is extracted into
pub const STATE_PARENT_DIR: &str = "/var/";
/// Directory read back when loading state
pub const STATE_DIR: &str = "/var/dynocluster";
/// Name of the state entry inside the archive
pub const STATE_ENTRY: &str = "dynocluster/state";

pub struct ContainerStateStore {
    runtime: Arc<dyn ContainerRuntime>,
    span: Span,
}

impl ContainerStateStore {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            span: tracing::debug_span!("node_state"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

/// Wrap the encoded state as the single archive entry
fn pack_state(state: &NodeState) -> Result<Vec<u8>> {
    let encoded = serde_json::to_vec(state)?;

    let mut header = tar::Header::new_gnu();
    header.set_size(encoded.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(Utc::now().timestamp().max(0) as u64);

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, STATE_ENTRY, encoded.as_slice())?;
    Ok(builder.into_inner()?)
}

/// Scan an archive for the state entry
fn unpack_state(archive: &[u8]) -> Result<Option<NodeState>> {
    let mut tar = tar::Archive::new(Cursor::new(archive));

    for entry in tar.entries()? {
        let mut entry = entry?;
        if entry.path()?.as_ref() != Path::new(STATE_ENTRY) {
            continue;
        }

        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        return Ok(Some(serde_json::from_slice(&data)?));
    }

    Ok(None)
}

#[async_trait]
impl NodeStateStore for ContainerStateStore {
    async fn write_state(&self, resource_id: &str, state: &NodeState) -> Result<()> {
        let span = tracing::debug_span!(parent: &self.span, "write_state", resource_id, expiry = %state.expiry);
        async {
            debug!("writing node state");

            let archive = pack_state(state)?;
            self.runtime
                .upload_archive(resource_id, STATE_PARENT_DIR, archive)
                .await
                .map_err(|e| e.for_resource(resource_id, "failed to write node state"))
        }
        .instrument(span)
        .await
    }

    async fn read_state(&self, resource_id: &str) -> Result<Option<NodeState>> {
        let span = tracing::debug_span!(parent: &self.span, "read_state", resource_id);
        async {
            debug!("reading node state");

            let archive = match self.runtime.download_archive(resource_id, STATE_DIR).await {
                Ok(Some(archive)) => archive,
                Ok(None) => return Ok(None),
                Err(e @ DeployError::ResourceNotFound(_)) => return Err(e),
                Err(e) => return Err(e.for_resource(resource_id, "failed to read node state")),
            };

            unpack_state(&archive)
                .map_err(|e| e.for_resource(resource_id, "failed to decode node state"))
        }
        .instrument(span)
        .await
    }
}
