//! Concurrent execution of validators and monitors.
//!
//! Every check runs as its own task. A check that errors, panics or
//! overruns the budget becomes a failing result attributed to that check;
//! siblings are unaffected and the runner always waits for every result.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::checks::{
    CheckContext, CheckKind, CheckOutcome, CheckScope, CheckSnapshot, Monitor, ValidationResult,
    Validator,
};
use crate::deployment::NetworkDeployment;
use crate::error::{CancelReason, Error, Result};

/// Stand-in deadline for budgets too large to add to an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Result of one validator or monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub kind: CheckKind,
    /// Target node for node-scoped checks.
    pub node: Option<usize>,
    pub outcome: CheckOutcome,
    pub message: String,
    /// The check did not finish within the budget.
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CheckResult {
    /// Returns true if this result fails the run.
    pub fn is_failure(&self) -> bool {
        self.outcome.is_failure()
    }
}

/// Every result of one check run, in registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub results: Vec<CheckResult>,
}

impl CheckReport {
    /// Failing results.
    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|r| r.is_failure())
    }

    /// Returns true if no result failed.
    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Result for the check named `name`.
    pub fn get(&self, name: &str) -> Option<&CheckResult> {
        self.results.iter().find(|r| r.name == name)
    }

    /// Converts the report into the run's overall result.
    ///
    /// Validator failures take precedence over monitor alerts; either way the
    /// error carries the whole report.
    pub fn into_result(self) -> Result<CheckReport> {
        let validator_failed = self.failures().any(|r| r.kind == CheckKind::Validator);
        let monitor_failed = self.failures().any(|r| r.kind == CheckKind::Monitor);
        if validator_failed {
            Err(Error::ValidationFailure(self))
        } else if monitor_failed {
            Err(Error::MonitorAlert(self))
        } else {
            Ok(self)
        }
    }
}

impl std::fmt::Display for CheckReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let failures: Vec<String> = self
            .failures()
            .map(|r| format!("{} ({})", r.name, r.message))
            .collect();
        write!(
            f,
            "{} of {} checks failed",
            failures.len(),
            self.results.len()
        )?;
        if !failures.is_empty() {
            write!(f, ": {}", failures.join("; "))?;
        }
        Ok(())
    }
}

#[derive(Clone)]
enum CheckJob {
    Validator(Arc<dyn Validator>),
    Monitor(Arc<dyn Monitor>),
}

struct CheckUnit {
    name: String,
    kind: CheckKind,
    scope: CheckScope,
    job: CheckJob,
}

impl CheckUnit {
    fn result(&self, outcome: CheckOutcome, message: impl Into<String>, started: Instant) -> CheckResult {
        CheckResult {
            name: self.name.clone(),
            kind: self.kind,
            node: self.scope.node(),
            outcome,
            message: message.into(),
            timed_out: false,
            elapsed: started.elapsed(),
        }
    }

    fn timed_out(&self, started: Instant) -> CheckResult {
        CheckResult {
            timed_out: true,
            ..self.result(
                CheckOutcome::Failure,
                "did not complete within the check budget",
                started,
            )
        }
    }
}

/// Runs validators and monitors against a live deployment.
#[derive(Debug, Clone)]
pub struct AsyncCheckRunner {
    worker_limit: usize,
}

impl AsyncCheckRunner {
    /// Creates a runner executing at most `worker_limit` checks at once.
    pub fn new(worker_limit: usize) -> Self {
        Self {
            worker_limit: worker_limit.max(1),
        }
    }

    /// Runs every check and aggregates the outcomes.
    ///
    /// Returns [`Error::ValidationFailure`] or [`Error::MonitorAlert`]
    /// carrying all results if any check failed.
    pub async fn run(
        &self,
        snapshot: &CheckSnapshot,
        deployment: Arc<NetworkDeployment>,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<CheckReport> {
        self.collect(snapshot, deployment, budget, cancel)
            .await?
            .into_result()
    }

    /// Runs every check and returns the raw report without judging it.
    pub async fn collect(
        &self,
        snapshot: &CheckSnapshot,
        deployment: Arc<NetworkDeployment>,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<CheckReport> {
        let units: Vec<CheckUnit> = snapshot
            .validators()
            .into_iter()
            .map(|(scope, check)| CheckUnit {
                name: check.name().to_string(),
                kind: CheckKind::Validator,
                scope,
                job: CheckJob::Validator(check),
            })
            .chain(snapshot.monitors().into_iter().map(|(scope, check)| CheckUnit {
                name: check.name().to_string(),
                kind: CheckKind::Monitor,
                scope,
                job: CheckJob::Monitor(check),
            }))
            .collect();

        let started = Instant::now();
        let deadline = budget_deadline(started, budget);
        let permits = Arc::new(Semaphore::new(self.worker_limit));
        let mut results: Vec<Option<CheckResult>> = vec![None; units.len()];
        let names: Vec<(String, CheckKind, CheckScope)> = units
            .iter()
            .map(|u| (u.name.clone(), u.kind, u.scope))
            .collect();

        tracing::info!(
            deployment = %deployment.id(),
            checks = units.len(),
            budget = ?budget,
            "running checks"
        );

        let mut tasks = JoinSet::new();
        for (slot, unit) in units.into_iter().enumerate() {
            let deployment = Arc::clone(&deployment);
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = execute(unit, deployment, permits, deadline, cancel).await;
                (slot, result)
            });
        }

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(Error::Cancelled(CancelReason::Aborted));
                }
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((slot, result))) => {
                        if result.is_failure() {
                            tracing::warn!(check = %result.name, message = %result.message, "check failed");
                        }
                        results[slot] = Some(result);
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "check task aborted");
                    }
                },
            }
        }

        let results = results
            .into_iter()
            .zip(names)
            .map(|(result, (name, kind, scope))| {
                result.unwrap_or_else(|| CheckResult {
                    name,
                    kind,
                    node: scope.node(),
                    outcome: CheckOutcome::Failure,
                    message: "check task aborted".to_string(),
                    timed_out: false,
                    elapsed: started.elapsed(),
                })
            })
            .collect();

        Ok(CheckReport { results })
    }
}

async fn execute(
    unit: CheckUnit,
    deployment: Arc<NetworkDeployment>,
    permits: Arc<Semaphore>,
    deadline: Instant,
    cancel: CancellationToken,
) -> CheckResult {
    let started = Instant::now();

    let _permit = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            return unit.result(CheckOutcome::Indeterminate, "cancelled before dispatch", started);
        }
        () = sleep_until(deadline) => return unit.timed_out(started),
        permit = permits.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return unit.result(CheckOutcome::Failure, "worker pool closed", started),
        },
    };
    if cancel.is_cancelled() {
        return unit.result(CheckOutcome::Indeterminate, "cancelled before dispatch", started);
    }

    let ctx = CheckContext::new(deployment, unit.scope.node(), cancel.clone());
    let handle: JoinHandle<Result<ValidationResult>> = match unit.job.clone() {
        CheckJob::Validator(check) => tokio::spawn(async move { check.validate(&ctx).await }),
        CheckJob::Monitor(check) => {
            tokio::task::spawn_blocking(move || {
                let outcome = check.check(&ctx);
                Ok(ValidationResult {
                    outcome,
                    message: format!("monitor reported {:?}", outcome).to_lowercase(),
                })
            })
        }
    };
    let abort = handle.abort_handle();

    let joined = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            abort.abort();
            return unit.result(CheckOutcome::Indeterminate, "cancelled", started);
        }
        joined = timeout_at(deadline, handle) => joined,
    };

    match joined {
        Err(_) => {
            abort.abort();
            unit.timed_out(started)
        }
        Ok(Err(join_error)) => unit.result(
            CheckOutcome::Failure,
            format!("check panicked: {}", panic_message(join_error)),
            started,
        ),
        Ok(Ok(Err(e))) => unit.result(CheckOutcome::Failure, e.to_string(), started),
        Ok(Ok(Ok(result))) => unit.result(result.outcome, result.message, started),
    }
}

fn budget_deadline(started: Instant, budget: Duration) -> Instant {
    started
        .checked_add(budget)
        .or_else(|| started.checked_add(FAR_FUTURE))
        .unwrap_or(started)
}

/// Extracts a readable message from a failed task.
pub(crate) fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload: Box<dyn Any + Send> = error.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
