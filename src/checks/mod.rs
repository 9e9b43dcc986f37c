//! Check contracts run against a live deployment.
//!
//! Three kinds of checks exist:
//! - [`ReadinessCheck`]: a polled predicate gating "started" from "usable".
//! - [`Validator`]: an asynchronous correctness check.
//! - [`Monitor`]: a synchronous health check.
//!
//! Checks are registered per test in a [`CheckMutator`](registry::CheckMutator).
//! None of them may mutate the deployment.

pub mod builtin;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::deployment::{NetworkDeployment, Node, NodeKind};
use crate::error::Result;

pub use builtin::NodeCountValidator;
pub use registry::{CheckMutator, CheckScope, CheckSnapshot, NodeCheckMutator, RegisteredCheck};

/// Default interval between readiness polls.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Default time a readiness check may take to become ready.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckOutcome {
    Success,
    Failure,
    /// The check could not decide. Not treated as a failure.
    Indeterminate,
}

impl CheckOutcome {
    /// Returns true for [`CheckOutcome::Failure`].
    pub fn is_failure(self) -> bool {
        self == Self::Failure
    }
}

/// Kind of a registered check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Readiness,
    Validator,
    Monitor,
}

/// Result returned by a validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub outcome: CheckOutcome,
    pub message: String,
}

impl ValidationResult {
    pub fn passed(message: impl Into<String>) -> Self {
        Self {
            outcome: CheckOutcome::Success,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            outcome: CheckOutcome::Failure,
            message: message.into(),
        }
    }

    pub fn indeterminate(message: impl Into<String>) -> Self {
        Self {
            outcome: CheckOutcome::Indeterminate,
            message: message.into(),
        }
    }
}

/// What a validator or monitor is checking: the deployment, and the node
/// when the check was registered for a single node.
#[derive(Debug, Clone)]
pub struct CheckContext {
    deployment: Arc<NetworkDeployment>,
    node: Option<usize>,
    cancel: CancellationToken,
}

impl CheckContext {
    pub fn new(
        deployment: Arc<NetworkDeployment>,
        node: Option<usize>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            deployment,
            node,
            cancel,
        }
    }

    /// The live deployment.
    pub fn deployment(&self) -> &NetworkDeployment {
        &self.deployment
    }

    /// The target node for node-scoped checks.
    pub fn node(&self) -> Option<&Node> {
        self.node.and_then(|index| self.deployment.node(index))
    }

    /// Nodes in scope: the target node, or every node for global checks.
    pub fn nodes_in_scope(&self) -> Vec<&Node> {
        match self.node() {
            Some(node) => vec![node],
            None => self.deployment.nodes().iter().collect(),
        }
    }

    /// Cancellation signal for long-running validators.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// A polled predicate over a deployment.
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    /// Returns the name used in reports.
    fn name(&self) -> &str;

    /// Returns true once the deployment is usable from this check's point of view.
    async fn ready(&self, deployment: &NetworkDeployment) -> bool;

    /// Pause between polls.
    fn check_interval(&self) -> Duration {
        DEFAULT_CHECK_INTERVAL
    }

    /// How long this check may keep polling.
    fn check_timeout(&self) -> Duration {
        DEFAULT_CHECK_TIMEOUT
    }

    /// Whether the check concerns nodes of `kind`.
    fn applies_to(&self, _kind: NodeKind) -> bool {
        true
    }
}

/// An asynchronous correctness check.
///
/// Returning an error (or panicking) is recorded as a failure of this
/// validator only.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Returns the name used in reports.
    fn name(&self) -> &str;

    /// Validates the deployment.
    async fn validate(&self, ctx: &CheckContext) -> Result<ValidationResult>;
}

/// A synchronous health check.
pub trait Monitor: Send + Sync {
    /// Returns the name used in reports.
    fn name(&self) -> &str;

    /// Samples the deployment's health.
    fn check(&self, ctx: &CheckContext) -> CheckOutcome;
}
