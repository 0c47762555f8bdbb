//! Error types for DynoCluster
//!
//! Every library operation returns [`DeployError`]. Lifecycle operations wrap
//! failures in [`DeployError::Node`] so the node or resource id travels with the
//! error; [`DeployError::root`] strips that annotation again.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DeployError>;

#[derive(Debug, Error)]
pub enum DeployError {
    /// Missing or ambiguous environment configuration (network addressing etc.)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The backing resource vanished or never existed
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// A required tool is not installed inside the resource
    #[error("`{tool}` is not available in resource {resource}")]
    ToolMissing { tool: String, resource: String },

    /// A single backend call failed. Not retried at this layer.
    #[error("backend call failed: {0}")]
    Backend(String),

    /// A just-created resource is not visible in a subsequent listing
    #[error("consistency error: {0}")]
    Consistency(String),

    /// Caller cancellation or an expired wait bound
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("{context} (resource {resource}): {source}")]
    Node {
        resource: String,
        context: String,
        #[source]
        source: Box<DeployError>,
    },

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to encode or decode node state: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DeployError {
    /// Annotate an error with the resource it concerns.
    pub fn for_resource(self, resource: impl Into<String>, context: impl Into<String>) -> Self {
        DeployError::Node {
            resource: resource.into(),
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The underlying error with all resource annotations removed.
    pub fn root(&self) -> &DeployError {
        match self {
            DeployError::Node { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn into_root(self) -> DeployError {
        match self {
            DeployError::Node { source, .. } => source.into_root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), DeployError::ResourceNotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), DeployError::Cancelled(_))
    }
}

/// Extension for annotating results, in the spirit of `anyhow::Context`.
pub trait ResourceContext<T> {
    fn for_resource(self, resource: &str, context: &str) -> Result<T>;
}

impl<T> ResourceContext<T> for Result<T> {
    fn for_resource(self, resource: &str, context: &str) -> Result<T> {
        self.map_err(|e| e.for_resource(resource, context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_strips_annotations() {
        let err = DeployError::ResourceNotFound("abc".to_string())
            .for_resource("abc", "failed to stop container")
            .for_resource("abc", "failed to remove node");

        assert!(err.is_not_found());
        assert!(matches!(err.root(), DeployError::ResourceNotFound(_)));
        assert!(err.to_string().contains("failed to remove node"));
    }

    #[test]
    fn test_cancelled_detection() {
        let err = DeployError::Cancelled("timed out".to_string()).for_resource("n1", "wait");
        assert!(err.is_cancelled());
        assert!(!err.is_not_found());
        assert!(matches!(err.into_root(), DeployError::Cancelled(_)));
    }
}
