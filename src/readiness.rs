//! Readiness polling.
//!
//! Each applicable [`ReadinessCheck`] gets its own poll loop: invoke,
//! sleep `check_interval`, retry, until the check reports ready or its own
//! `check_timeout` elapses. Loops run concurrently and a check is never
//! invoked again before its previous invocation returned. The overall wait
//! succeeds once every check is ready and fails once the largest
//! `check_timeout` has elapsed.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::checks::ReadinessCheck;
use crate::deployment::NetworkDeployment;
use crate::error::{CancelReason, Error, Result};

/// Final state of one readiness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessStatus {
    pub name: String,
    pub ready: bool,
    /// Number of `ready` invocations that completed.
    pub polls: u32,
    /// Time from the start of the wait until the loop finished.
    pub elapsed: Duration,
}

/// Result of a successful readiness wait.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReadinessReport {
    pub checks: Vec<ReadinessStatus>,
    pub elapsed: Duration,
}

/// Drives readiness checks until the deployment is usable.
#[derive(Debug, Clone)]
pub struct ReadinessPoller {
    worker_limit: usize,
}

impl ReadinessPoller {
    /// Creates a poller allowing at most `worker_limit` concurrent `ready` invocations.
    pub fn new(worker_limit: usize) -> Self {
        Self {
            worker_limit: worker_limit.max(1),
        }
    }

    /// Waits until every check reports ready.
    ///
    /// Fails with [`Error::ReadinessTimeout`] naming every check that is not
    /// ready once the largest `check_timeout` has elapsed, or with
    /// [`Error::Cancelled`] as soon as `cancel` fires.
    pub async fn wait_until_ready(
        &self,
        deployment: Arc<NetworkDeployment>,
        checks: Vec<Arc<dyn ReadinessCheck>>,
        cancel: &CancellationToken,
    ) -> Result<ReadinessReport> {
        let started = Instant::now();
        if checks.is_empty() {
            tracing::debug!(deployment = %deployment.id(), "no applicable readiness checks");
            return Ok(ReadinessReport::default());
        }

        let overall = checks
            .iter()
            .map(|check| check.check_timeout())
            .max()
            .unwrap_or_default();
        // No deadline if the largest timeout cannot be represented.
        let deadline = started.checked_add(overall);
        let permits = Arc::new(Semaphore::new(self.worker_limit));

        let mut statuses: Vec<ReadinessStatus> = checks
            .iter()
            .map(|check| ReadinessStatus {
                name: check.name().to_string(),
                ready: false,
                polls: 0,
                elapsed: Duration::ZERO,
            })
            .collect();

        let mut loops = JoinSet::new();
        for (slot, check) in checks.into_iter().enumerate() {
            let deployment = Arc::clone(&deployment);
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();
            loops.spawn(async move {
                let status = poll_until_ready(check, deployment, permits, cancel, started).await;
                (slot, status)
            });
        }

        tracing::info!(
            deployment = %deployment.id(),
            checks = statuses.len(),
            timeout = ?overall,
            "awaiting readiness"
        );

        // A loop that exhausted its own timeout stops polling, but the wait
        // as a whole only fails at the overall deadline.
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    loops.abort_all();
                    return Err(Error::Cancelled(CancelReason::Aborted));
                }
                joined = loops.join_next(), if !loops.is_empty() => match joined {
                    Some(Ok((slot, status))) => {
                        tracing::debug!(check = %status.name, ready = status.ready, polls = status.polls, "readiness loop finished");
                        statuses[slot] = status;
                        if statuses.iter().all(|s| s.ready) {
                            return Ok(ReadinessReport {
                                checks: statuses,
                                elapsed: started.elapsed(),
                            });
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "readiness loop panicked");
                    }
                    None => {}
                },
                () = sleep_until(deadline.unwrap_or(started)), if deadline.is_some() => {
                    loops.abort_all();
                    break;
                }
                else => break,
            }
        }

        let not_ready: Vec<String> = statuses
            .iter()
            .filter(|s| !s.ready)
            .map(|s| s.name.clone())
            .collect();
        tracing::warn!(
            deployment = %deployment.id(),
            not_ready = ?not_ready,
            "readiness timed out"
        );
        Err(Error::ReadinessTimeout {
            not_ready,
            waited: started.elapsed(),
        })
    }
}

async fn poll_until_ready(
    check: Arc<dyn ReadinessCheck>,
    deployment: Arc<NetworkDeployment>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    started: Instant,
) -> ReadinessStatus {
    let timeout = check.check_timeout();
    let interval = check.check_interval();
    let mut polls = 0;

    let ready = loop {
        if cancel.is_cancelled() {
            break false;
        }

        let ready = {
            let Ok(_permit) = permits.acquire().await else {
                break false;
            };
            polls += 1;
            check.ready(&deployment).await
        };
        if ready {
            break true;
        }

        // Every poll starts strictly before the check's timeout.
        if started.elapsed().saturating_add(interval) >= timeout {
            break false;
        }
        tracing::debug!(check = %check.name(), polls, "not ready yet");

        tokio::select! {
            () = cancel.cancelled() => break false,
            () = sleep(interval) => {}
        }
    };

    ReadinessStatus {
        name: check.name().to_string(),
        ready,
        polls,
        elapsed: started.elapsed(),
    }
}
