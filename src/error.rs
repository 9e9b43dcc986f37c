//! Error types for the testnet orchestrator.

use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::LifecycleState;
use crate::runner::CheckReport;

/// Why a run was cancelled before it could finish on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller aborted the run through its cancellation token.
    Aborted,
    /// The configured test-level timeout elapsed.
    TimedOut(Duration),
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aborted => write!(f, "aborted by caller"),
            Self::TimedOut(limit) => write!(f, "test timeout of {:?} elapsed", limit),
        }
    }
}

/// Top-level error type for lifecycle operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The provisioner rejected the topology, or the topology itself is invalid.
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// One or more readiness checks never reported ready.
    #[error("deployment not ready after {waited:?}; still waiting on: {}", not_ready.join(", "))]
    ReadinessTimeout {
        not_ready: Vec<String>,
        waited: Duration,
    },

    /// At least one validator failed. Carries every outcome of the run.
    #[error("validation failed: {0}")]
    ValidationFailure(CheckReport),

    /// At least one monitor raised an alert. Carries every outcome of the run.
    #[error("monitor alert: {0}")]
    MonitorAlert(CheckReport),

    /// No, ambiguous, or incompatible service suppliers for a capability.
    #[error("service location failed for {capability}: {reason}")]
    ServiceLocation {
        capability: &'static str,
        reason: String,
    },

    /// The run was cancelled from outside the test logic.
    #[error("run cancelled: {0}")]
    Cancelled(CancelReason),

    /// The test body returned an error or panicked.
    #[error("test body failed: {0}")]
    TestBody(String),

    /// An individual check raised an error.
    #[error("check error: {0}")]
    Check(String),

    /// A provisioner failed to configure, start or tear down a deployment.
    #[error("deployment operation failed: {0}")]
    Deployment(String),

    /// The controller attempted a transition the state machine does not allow.
    #[error("invalid lifecycle transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error while loading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if this error is a cancellation rather than a test failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Returns the aggregated check report for check failures.
    pub fn check_report(&self) -> Option<&CheckReport> {
        match self {
            Self::ValidationFailure(report) | Self::MonitorAlert(report) => Some(report),
            _ => None,
        }
    }
}

/// Result type alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;
