//! DynoCluster library
//!
//! Ephemeral multi-node database clusters for testing. The container backend
//! lives in [`docker`]; [`deployment::Deployer`] is the backend-agnostic
//! surface on top of it.

pub mod clusterdef;
pub mod config;
pub mod deployment;
pub mod docker;
pub mod error;
pub mod image;
pub mod mgmt;
pub mod poll;
pub mod readiness;
pub mod state;

pub use error::{DeployError, Result};
