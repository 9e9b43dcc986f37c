//! Deployment model and provisioning.
//!
//! This module provides the [`DeploymentProvisioner`] trait the lifecycle
//! controller drives, the [`NetworkDeployment`] it produces, and the
//! in-memory [`LocalProvisioner`] backend.

mod local;
mod provisioner;

pub use local::{
    LocalLimits, LocalProvisioner, NodeStatusMonitor, NodesActiveCheck, PlatformStatus,
};
pub use provisioner::{
    Capabilities, ConfigOverride, DeploymentId, DeploymentProvisioner, DeploymentSummary,
    NetworkDeployment, Node, NodeKind,
};
