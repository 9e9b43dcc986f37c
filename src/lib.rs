//! Testnet Orchestrator - lifecycle engine for tests against ephemeral networks
//!
//! This library provisions a multi-node deployment for a declared topology,
//! waits for it to become ready, runs the test body and registered checks
//! against it, and always tears it down again.

pub mod checks;
pub mod config;
pub mod deployment;
pub mod error;
pub mod lifecycle;
pub mod locator;
pub mod readiness;
pub mod runner;
pub mod topology;

use std::sync::Arc;

pub use checks::{
    CheckContext, CheckKind, CheckMutator, CheckOutcome, CheckScope, CheckSnapshot, Monitor,
    NodeCheckMutator, NodeCountValidator, ReadinessCheck, RegisteredCheck, ValidationResult,
    Validator,
};
pub use config::{ConfigIssues, TestConfig, TimeUnit, Validate, WaitDuration};
pub use deployment::{
    Capabilities, ConfigOverride, DeploymentId, DeploymentProvisioner, DeploymentSummary,
    LocalLimits, LocalProvisioner, NetworkDeployment, Node, NodeKind, NodeStatusMonitor,
    NodesActiveCheck, PlatformStatus,
};
pub use error::{CancelReason, Error, Result};
pub use lifecycle::{
    LifecycleController, LifecycleSettings, LifecycleState, RunPlan, RunReport, RunSummary,
    StateTransition, TestExecutionMode,
};
pub use locator::{ServiceLocationProvider, ServiceLocator, ServiceRegistry, ServiceSupplier};
pub use readiness::{ReadinessPoller, ReadinessReport, ReadinessStatus};
pub use runner::{AsyncCheckRunner, CheckReport, CheckResult};
pub use topology::{InstallType, NodeResources, Topology, TopologyBuilder};

/// Registry with the local provisioner and its built-in checks.
///
/// Registered names: provisioner `local`, readiness check `nodes-active`,
/// validator `node-count`, monitor `node-status`.
pub fn default_registry(local: &LocalProvisioner) -> ServiceRegistry {
    let mut registry = ServiceRegistry::new();

    let provisioner = local.clone();
    registry.register::<dyn DeploymentProvisioner, _>("local", move || {
        Arc::new(provisioner.clone()) as Arc<dyn DeploymentProvisioner>
    });

    let readiness = local.clone();
    registry.register::<dyn ReadinessCheck, _>("nodes-active", move || {
        Arc::new(readiness.readiness_check()) as Arc<dyn ReadinessCheck>
    });

    registry.register::<dyn Validator, _>("node-count", || {
        Arc::new(NodeCountValidator) as Arc<dyn Validator>
    });

    let monitor = local.clone();
    registry.register::<dyn Monitor, _>("node-status", move || {
        Arc::new(monitor.status_monitor()) as Arc<dyn Monitor>
    });

    registry
}
