//! Lifecycle controller.
//!
//! Sequences one run against one deployment:
//!
//! ```text
//! PENDING → PROVISIONING → CONFIGURING → STARTING → AWAITING_READINESS
//!         → [WAITING_DURATION] → RUNNING → TEARING_DOWN → TERMINATED
//! ```
//!
//! Any non-terminal state may fail. Once a deployment exists the failure
//! path is `… → TEARING_DOWN → FAILED`, so teardown is attempted exactly
//! once whatever happened before it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::checks::{CheckMutator, Monitor, ReadinessCheck, RegisteredCheck, Validator};
use crate::config::TestConfig;
use crate::deployment::{ConfigOverride, DeploymentProvisioner, NetworkDeployment};
use crate::error::{CancelReason, Error, Result};
use crate::locator::ServiceLocator;
use crate::readiness::{ReadinessPoller, ReadinessReport};
use crate::runner::{panic_message, AsyncCheckRunner, CheckReport};
use crate::topology::Topology;

/// State of a lifecycle run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    #[default]
    Pending,
    Provisioning,
    Configuring,
    Starting,
    AwaitingReadiness,
    WaitingDuration,
    Running,
    TearingDown,
    Terminated,
    Failed,
}

impl LifecycleState {
    /// Returns true for `TERMINATED` and `FAILED`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// Returns true if the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Failed)
                | (Pending, Provisioning)
                | (Provisioning, Configuring)
                | (Provisioning, Running)
                | (Configuring, Starting)
                | (Starting, AwaitingReadiness)
                | (AwaitingReadiness, WaitingDuration)
                | (AwaitingReadiness, Running)
                | (WaitingDuration, Running)
                | (
                    Provisioning | Configuring | Starting | AwaitingReadiness | WaitingDuration
                        | Running,
                    TearingDown
                )
                | (TearingDown, Terminated)
        )
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Provisioning => "PROVISIONING",
            Self::Configuring => "CONFIGURING",
            Self::Starting => "STARTING",
            Self::AwaitingReadiness => "AWAITING_READINESS",
            Self::WaitingDuration => "WAITING_DURATION",
            Self::Running => "RUNNING",
            Self::TearingDown => "TEARING_DOWN",
            Self::Terminated => "TERMINATED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Which lifecycle stages a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestExecutionMode {
    /// Every stage except the fixed wait.
    #[default]
    Default,
    /// Every stage, with a fixed wait between readiness and the test body.
    TimedExecution,
    /// Provision, run the body, tear down. Nothing else.
    ProvisionOnly,
}

/// Immutable description of one run.
#[derive(Debug, Clone)]
pub struct RunPlan {
    topology: Topology,
    mode: TestExecutionMode,
    wait: Option<Duration>,
    overrides: Vec<ConfigOverride>,
    test_timeout: Option<Duration>,
}

impl RunPlan {
    pub fn new(topology: Topology) -> Self {
        Self {
            topology,
            mode: TestExecutionMode::default(),
            wait: None,
            overrides: Vec::new(),
            test_timeout: None,
        }
    }

    pub fn with_mode(mut self, mode: TestExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the fixed wait used in [`TestExecutionMode::TimedExecution`].
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }

    /// Adds a configuration override applied before startup.
    pub fn with_override(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push(ConfigOverride::new(name, value));
        self
    }

    pub fn with_overrides(mut self, overrides: impl IntoIterator<Item = ConfigOverride>) -> Self {
        self.overrides.extend(overrides);
        self
    }

    /// Cancels the run with [`CancelReason::TimedOut`] once `limit` has elapsed.
    pub fn with_test_timeout(mut self, limit: Duration) -> Self {
        self.test_timeout = Some(limit);
        self
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn mode(&self) -> TestExecutionMode {
        self.mode
    }

    /// The fixed wait, if the mode uses one.
    pub fn wait(&self) -> Option<Duration> {
        match self.mode {
            TestExecutionMode::TimedExecution => Some(self.wait.unwrap_or_default()),
            _ => None,
        }
    }

    pub fn overrides(&self) -> &[ConfigOverride] {
        &self.overrides
    }

    pub fn test_timeout(&self) -> Option<Duration> {
        self.test_timeout
    }
}

/// Controller tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleSettings {
    /// Maximum concurrently executing checks.
    pub worker_limit: usize,
    /// Budget for validators and monitors in [`TestExecutionMode::Default`].
    pub check_budget: Duration,
    /// Added to the fixed wait to form the check budget in timed execution.
    pub grace_period: Duration,
    /// Upper bound for deleting the deployment.
    pub teardown_timeout: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            worker_limit: 8,
            check_budget: Duration::from_secs(300),
            grace_period: Duration::from_secs(30),
            teardown_timeout: Duration::from_secs(120),
        }
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub at: DateTime<Utc>,
    /// Time since the run started.
    pub elapsed: Duration,
}

/// What a successful run produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub readiness: Option<ReadinessReport>,
    pub checks: Option<CheckReport>,
}

/// Everything a run produced, successful or not.
#[derive(Debug)]
pub struct RunReport {
    /// The deployment, if provisioning got that far.
    pub deployment: Option<Arc<NetworkDeployment>>,
    pub outcome: Result<RunSummary>,
    pub transitions: Vec<StateTransition>,
    /// Secondary failure while deleting the deployment.
    pub teardown_error: Option<Error>,
}

impl RunReport {
    /// Every state the run visited, starting with `PENDING`.
    pub fn states(&self) -> Vec<LifecycleState> {
        std::iter::once(LifecycleState::Pending)
            .chain(self.transitions.iter().map(|t| t.to))
            .collect()
    }

    pub fn final_state(&self) -> LifecycleState {
        self.transitions
            .last()
            .map(|t| t.to)
            .unwrap_or(LifecycleState::Pending)
    }

    /// Time since run start at which `state` was entered.
    pub fn entered(&self, state: LifecycleState) -> Option<Duration> {
        self.transitions
            .iter()
            .find(|t| t.to == state)
            .map(|t| t.elapsed)
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn into_result(self) -> Result<RunSummary> {
        self.outcome
    }

    /// Machine-readable form of the report.
    pub fn to_json(&self) -> serde_json::Value {
        let deployment = self.deployment.as_ref().map(|d| d.summary());
        let error = self.outcome.as_ref().err().map(ToString::to_string);
        let readiness = self.outcome.as_ref().ok().and_then(|s| s.readiness.as_ref());
        let checks = match &self.outcome {
            Ok(summary) => summary.checks.as_ref(),
            Err(e) => e.check_report(),
        };
        let teardown_error = self.teardown_error.as_ref().map(ToString::to_string);

        serde_json::json!({
            "deployment": deployment,
            "final_state": self.final_state(),
            "success": self.is_success(),
            "error": error,
            "readiness": readiness,
            "checks": checks,
            "transitions": self.transitions,
            "teardown_error": teardown_error,
        })
    }
}

/// Aborts a spawned task when dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct RunState {
    state: LifecycleState,
    started: Instant,
    transitions: Vec<StateTransition>,
    deployment: Option<Arc<NetworkDeployment>>,
}

impl RunState {
    fn new() -> Self {
        Self {
            state: LifecycleState::Pending,
            started: Instant::now(),
            transitions: Vec::new(),
            deployment: None,
        }
    }

    fn transition(&mut self, to: LifecycleState) -> Result<()> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }

        self.transitions.push(StateTransition {
            from,
            to,
            at: Utc::now(),
            elapsed: self.started.elapsed(),
        });
        self.state = to;
        if let Some(deployment) = &self.deployment {
            deployment.set_status(to);
        }

        tracing::info!(
            deployment = ?self.deployment.as_ref().map(|d| d.id().as_str()),
            from = %from,
            to = %to,
            "lifecycle transition"
        );
        Ok(())
    }

    fn attach(&mut self, deployment: Arc<NetworkDeployment>) {
        deployment.set_status(self.state);
        self.deployment = Some(deployment);
    }
}

/// Drives deployments through the lifecycle.
///
/// One controller runs one deployment at a time; independent runs use
/// independent controllers.
pub struct LifecycleController {
    provisioner: Arc<dyn DeploymentProvisioner>,
    checks: CheckMutator,
    settings: LifecycleSettings,
    cancel: CancellationToken,
}

impl LifecycleController {
    pub fn new(provisioner: Arc<dyn DeploymentProvisioner>, settings: LifecycleSettings) -> Self {
        Self {
            provisioner,
            checks: CheckMutator::new(),
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Builds a controller from a declarative configuration, resolving the
    /// provisioner and named checks through `locator`.
    pub fn from_config(config: &TestConfig, locator: &ServiceLocator) -> Result<Self> {
        let provisioner = locator.find::<dyn DeploymentProvisioner>(&config.provisioner)?;
        let mut controller = Self::new(provisioner, config.settings());

        for name in &config.readiness {
            let check = locator.find::<dyn ReadinessCheck>(name)?;
            controller.checks.add(RegisteredCheck::Readiness(check));
        }
        for name in &config.validators {
            let check = locator.find::<dyn Validator>(name)?;
            controller.checks.add(RegisteredCheck::Validator(check));
        }
        for name in &config.monitors {
            let check = locator.find::<dyn Monitor>(name)?;
            controller.checks.add(RegisteredCheck::Monitor(check));
        }

        tracing::debug!(
            test = %config.name,
            provisioner = controller.provisioner.name(),
            checks = controller.checks.len(),
            "controller configured"
        );
        Ok(controller)
    }

    /// Checks for the next run.
    pub fn checks_mut(&mut self) -> &mut CheckMutator {
        &mut self.checks
    }

    pub fn checks(&self) -> &CheckMutator {
        &self.checks
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Token that aborts the current and any later run when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs `plan`, calling `body` once the deployment is usable.
    ///
    /// The returned report always carries the state sequence; its outcome
    /// is the first failure, never a teardown failure.
    pub async fn run<F, Fut>(&mut self, plan: &RunPlan, body: F) -> RunReport
    where
        F: FnOnce(Arc<NetworkDeployment>) -> Fut + Send,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let cancel = self.cancel.child_token();
        // A limit too large to add to the clock never expires.
        let deadline = plan
            .test_timeout()
            .and_then(|limit| Instant::now().checked_add(limit).map(|at| (at, limit)));
        let mut run = RunState::new();

        let outcome = self
            .drive(plan, body, &mut run, &cancel, deadline)
            .await;
        if let Err(e) = &outcome {
            tracing::warn!(state = %run.state, error = %e, "run failed");
        }

        let mut teardown_error = None;
        if let Some(deployment) = run.deployment.clone() {
            if let Err(e) = run.transition(LifecycleState::TearingDown) {
                tracing::error!(error = %e, "cannot enter teardown");
            }
            teardown_error = self.teardown(&deployment).await;
        }

        let last = if outcome.is_ok() {
            LifecycleState::Terminated
        } else {
            LifecycleState::Failed
        };
        if let Err(e) = run.transition(last) {
            tracing::error!(error = %e, "cannot finish run");
        }

        RunReport {
            deployment: run.deployment,
            outcome,
            transitions: run.transitions,
            teardown_error,
        }
    }

    async fn drive<F, Fut>(
        &self,
        plan: &RunPlan,
        body: F,
        run: &mut RunState,
        cancel: &CancellationToken,
        deadline: Option<(Instant, Duration)>,
    ) -> Result<RunSummary>
    where
        F: FnOnce(Arc<NetworkDeployment>) -> Fut + Send,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let snapshot = self.checks.snapshot();
        let mut summary = RunSummary::default();

        if cancel.is_cancelled() {
            return Err(Error::Cancelled(CancelReason::Aborted));
        }
        run.transition(LifecycleState::Provisioning)?;
        let deployment = self.provision(plan, run, cancel, deadline).await?;

        if plan.mode() != TestExecutionMode::ProvisionOnly {
            snapshot.validate_scopes(&deployment)?;

            run.transition(LifecycleState::Configuring)?;
            guard(
                cancel,
                deadline,
                self.provisioner.configure(&deployment, plan.overrides()),
            )
            .await?;

            run.transition(LifecycleState::Starting)?;
            guard(cancel, deadline, self.provisioner.start(&deployment)).await?;

            run.transition(LifecycleState::AwaitingReadiness)?;
            let poller = ReadinessPoller::new(self.settings.worker_limit);
            let readiness = snapshot.readiness_for(&deployment);
            summary.readiness = Some(
                guard(
                    cancel,
                    deadline,
                    poller.wait_until_ready(Arc::clone(&deployment), readiness, cancel),
                )
                .await?,
            );

            if let Some(wait) = plan.wait() {
                run.transition(LifecycleState::WaitingDuration)?;
                tracing::info!(deployment = %deployment.id(), wait = ?wait, "waiting before test body");
                guard(cancel, deadline, async {
                    sleep(wait).await;
                    Ok(())
                })
                .await?;
            }
        }

        run.transition(LifecycleState::Running)?;
        guard(cancel, deadline, run_body(body, Arc::clone(&deployment))).await?;

        if plan.mode() != TestExecutionMode::ProvisionOnly {
            let budget = match plan.wait() {
                Some(wait) => wait.saturating_add(self.settings.grace_period),
                None => self.settings.check_budget,
            };
            let runner = AsyncCheckRunner::new(self.settings.worker_limit);
            summary.checks = Some(
                guard(
                    cancel,
                    deadline,
                    runner.run(&snapshot, Arc::clone(&deployment), budget, cancel),
                )
                .await?,
            );
        }

        Ok(summary)
    }

    /// Creates the deployment and attaches it to the run.
    ///
    /// A create interrupted by cancellation is still allowed to finish,
    /// within `teardown_timeout`, so whatever it committed gets torn down.
    async fn provision(
        &self,
        plan: &RunPlan,
        run: &mut RunState,
        cancel: &CancellationToken,
        deadline: Option<(Instant, Duration)>,
    ) -> Result<Arc<NetworkDeployment>> {
        let create = self.provisioner.create(plan.topology());
        tokio::pin!(create);

        match guard(cancel, deadline, create.as_mut()).await {
            Ok(deployment) => {
                run.attach(Arc::clone(&deployment));
                Ok(deployment)
            }
            Err(e) if e.is_cancelled() => {
                tracing::info!(error = %e, "run cancelled during provisioning, waiting for create");
                match timeout(self.settings.teardown_timeout, create).await {
                    Ok(Ok(deployment)) => run.attach(deployment),
                    Ok(Err(create_error)) => {
                        tracing::debug!(error = %create_error, "interrupted create failed");
                    }
                    Err(_) => tracing::warn!(
                        limit = ?self.settings.teardown_timeout,
                        "interrupted create did not finish; deployment may leak"
                    ),
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn teardown(&self, deployment: &NetworkDeployment) -> Option<Error> {
        let limit = self.settings.teardown_timeout;
        let error = match timeout(limit, self.provisioner.delete(deployment.id())).await {
            Ok(Ok(true)) => None,
            Ok(Ok(false)) => Some(Error::Deployment(format!(
                "deployment {} was already gone at teardown",
                deployment.id()
            ))),
            Ok(Err(e)) => Some(e),
            Err(_) => Some(Error::Deployment(format!(
                "teardown of {} did not finish within {:?}",
                deployment.id(),
                limit
            ))),
        };

        match &error {
            None => tracing::info!(deployment = %deployment.id(), "deployment torn down"),
            Some(e) => tracing::warn!(deployment = %deployment.id(), error = %e, "teardown failed"),
        }
        error
    }
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("provisioner", &self.provisioner.name())
            .field("checks", &self.checks)
            .field("settings", &self.settings)
            .finish()
    }
}

/// Runs one stage unless the run is cancelled or the test timeout expires first.
async fn guard<T>(
    cancel: &CancellationToken,
    deadline: Option<(Instant, Duration)>,
    stage: impl Future<Output = Result<T>>,
) -> Result<T> {
    let expiry = async move {
        match deadline {
            Some((at, limit)) => {
                sleep_until(at).await;
                limit
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled(CancelReason::Aborted)),
        limit = expiry => {
            cancel.cancel();
            Err(Error::Cancelled(CancelReason::TimedOut(limit)))
        }
        result = stage => result,
    }
}

async fn run_body<F, Fut>(body: F, deployment: Arc<NetworkDeployment>) -> Result<()>
where
    F: FnOnce(Arc<NetworkDeployment>) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let handle = tokio::spawn(body(deployment));
    let _abort = AbortOnDrop(handle.abort_handle());

    match handle.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e @ Error::TestBody(_))) => Err(e),
        Ok(Err(e)) => Err(Error::TestBody(e.to_string())),
        Err(e) => Err(Error::TestBody(format!("panicked: {}", panic_message(e)))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::checks::{CheckContext, ValidationResult};
    use crate::deployment::{DeploymentId, LocalLimits, LocalProvisioner, NodeKind};

    use super::LifecycleState::*;

    #[derive(Clone, Copy)]
    enum DeleteBehaviour {
        Normal,
        Fail,
        Hang,
    }

    /// Records every provisioner call.
    struct Recording {
        inner: LocalProvisioner,
        calls: Arc<Mutex<Vec<&'static str>>>,
        create_delay: Duration,
        delete: DeleteBehaviour,
    }

    type CallLog = Arc<Mutex<Vec<&'static str>>>;

    impl Recording {
        fn build(
            inner: LocalProvisioner,
            create_delay: Duration,
            delete: DeleteBehaviour,
        ) -> (Arc<Self>, CallLog) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            let provisioner = Arc::new(Self {
                inner,
                calls: Arc::clone(&calls),
                create_delay,
                delete,
            });
            (provisioner, calls)
        }

        fn new(inner: LocalProvisioner) -> (Arc<Self>, CallLog) {
            Self::build(inner, Duration::ZERO, DeleteBehaviour::Normal)
        }

        fn failing_delete(inner: LocalProvisioner) -> (Arc<Self>, CallLog) {
            Self::build(inner, Duration::ZERO, DeleteBehaviour::Fail)
        }

        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl DeploymentProvisioner for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn create(&self, topology: &Topology) -> Result<Arc<NetworkDeployment>> {
            self.record("create");
            sleep(self.create_delay).await;
            self.inner.create(topology).await
        }

        async fn configure(
            &self,
            deployment: &NetworkDeployment,
            overrides: &[ConfigOverride],
        ) -> Result<()> {
            self.record("configure");
            self.inner.configure(deployment, overrides).await
        }

        async fn start(&self, deployment: &NetworkDeployment) -> Result<()> {
            self.record("start");
            self.inner.start(deployment).await
        }

        async fn delete(&self, id: &DeploymentId) -> Result<bool> {
            self.record("delete");
            match self.delete {
                DeleteBehaviour::Normal => self.inner.delete(id).await,
                DeleteBehaviour::Fail => Err(Error::Deployment("cluster unreachable".to_string())),
                DeleteBehaviour::Hang => {
                    sleep(Duration::from_secs(3600)).await;
                    self.inner.delete(id).await
                }
            }
        }

        async fn list(&self) -> Result<Vec<Arc<NetworkDeployment>>> {
            self.inner.list().await
        }

        async fn by_id(&self, id: &DeploymentId) -> Result<Option<Arc<NetworkDeployment>>> {
            self.inner.by_id(id).await
        }
    }

    struct CountingValidator {
        calls: Arc<AtomicUsize>,
        passes: bool,
    }

    #[async_trait]
    impl Validator for CountingValidator {
        fn name(&self) -> &str {
            "counting"
        }

        async fn validate(&self, _ctx: &CheckContext) -> Result<ValidationResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(if self.passes {
                ValidationResult::passed("ok")
            } else {
                ValidationResult::failed("ledger diverged")
            })
        }
    }

    struct CountingReadiness {
        calls: Arc<AtomicUsize>,
        ready: bool,
    }

    #[async_trait]
    impl ReadinessCheck for CountingReadiness {
        fn name(&self) -> &str {
            "counting-ready"
        }

        async fn ready(&self, _deployment: &NetworkDeployment) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.ready
        }

        fn check_timeout(&self) -> Duration {
            Duration::from_secs(10)
        }
    }

    /// Passes after `hang`.
    struct SlowValidator {
        hang: Duration,
    }

    #[async_trait]
    impl Validator for SlowValidator {
        fn name(&self) -> &str {
            "slow"
        }

        async fn validate(&self, _ctx: &CheckContext) -> Result<ValidationResult> {
            sleep(self.hang).await;
            Ok(ValidationResult::passed("settled"))
        }
    }

    /// Ready on the second poll, with no practical timeout.
    struct UnboundedReadiness {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ReadinessCheck for UnboundedReadiness {
        fn name(&self) -> &str {
            "unbounded"
        }

        async fn ready(&self, _deployment: &NetworkDeployment) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) >= 1
        }

        fn check_timeout(&self) -> Duration {
            Duration::MAX
        }
    }

    fn topology(nodes: usize) -> Topology {
        Topology::builder().nodes(nodes).build().unwrap()
    }

    fn calls(log: &Arc<Mutex<Vec<&'static str>>>) -> Vec<&'static str> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn state_machine_rejects_illegal_transitions() {
        assert!(Pending.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(Running));
        assert!(Running.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Running));
        assert!(!Running.can_transition_to(Terminated));
        assert!(!Terminated.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(TearingDown));
    }

    #[test]
    fn states_serialize_in_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&AwaitingReadiness).unwrap(),
            "\"AWAITING_READINESS\""
        );
        assert_eq!(WaitingDuration.to_string(), "WAITING_DURATION");
    }

    #[test]
    fn wait_only_applies_to_timed_execution() {
        let plan = RunPlan::new(topology(1)).with_wait(Duration::from_secs(5));
        assert_eq!(plan.wait(), None);

        let timed = plan.with_mode(TestExecutionMode::TimedExecution);
        assert_eq!(timed.wait(), Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn provision_only_runs_create_body_delete_and_nothing_else() {
        let (provisioner, log) = Recording::new(LocalProvisioner::default());
        let mut controller = LifecycleController::new(provisioner, LifecycleSettings::default());
        let validations = Arc::new(AtomicUsize::new(0));
        let polls = Arc::new(AtomicUsize::new(0));
        controller
            .checks_mut()
            .add_validator(CountingValidator {
                calls: Arc::clone(&validations),
                passes: true,
            })
            .add_readiness(CountingReadiness {
                calls: Arc::clone(&polls),
                ready: true,
            });
        let body_ran = Arc::new(AtomicUsize::new(0));
        let body_counter = Arc::clone(&body_ran);

        let plan = RunPlan::new(topology(1)).with_mode(TestExecutionMode::ProvisionOnly);
        let report = controller
            .run(&plan, move |_| async move {
                body_counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(report.is_success());
        assert_eq!(calls(&log), vec!["create", "delete"]);
        assert_eq!(report.states(), vec![Pending, Provisioning, Running, TearingDown, Terminated]);
        assert_eq!(body_ran.load(Ordering::SeqCst), 1);
        assert_eq!(validations.load(Ordering::SeqCst), 0);
        assert_eq!(polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_execution_visits_every_stage_and_waits_before_the_body() {
        let local = LocalProvisioner::default().with_startup_delay(Duration::from_secs(2));
        let (provisioner, log) = Recording::new(local.clone());
        let mut controller = LifecycleController::new(provisioner, LifecycleSettings::default());
        let validations = Arc::new(AtomicUsize::new(0));
        controller
            .checks_mut()
            .add_readiness(local.readiness_check().with_interval(Duration::from_millis(500)))
            .add_validator(CountingValidator {
                calls: Arc::clone(&validations),
                passes: true,
            });

        let started = Instant::now();
        let body_started = Arc::new(Mutex::new(None));
        let body_clock = Arc::clone(&body_started);
        let plan = RunPlan::new(topology(2))
            .with_mode(TestExecutionMode::TimedExecution)
            .with_wait(Duration::from_secs(5))
            .with_override("consensus.maxTps", "500");

        let report = controller
            .run(&plan, move |deployment| async move {
                assert_eq!(deployment.status(), Running);
                *body_clock.lock().unwrap() = Some(Instant::now());
                Ok(())
            })
            .await;

        assert!(report.is_success(), "{:?}", report.outcome);
        assert_eq!(
            report.states(),
            vec![
                Pending,
                Provisioning,
                Configuring,
                Starting,
                AwaitingReadiness,
                WaitingDuration,
                Running,
                TearingDown,
                Terminated
            ]
        );
        let ready_at = report.entered(WaitingDuration).unwrap();
        let body_at = body_started.lock().unwrap().unwrap() - started;
        assert!(ready_at >= Duration::from_secs(2));
        assert!(body_at >= ready_at + Duration::from_secs(5));
        assert_eq!(calls(&log), vec!["create", "configure", "start", "delete"]);
        assert_eq!(validations.load(Ordering::SeqCst), 1);
        assert_eq!(report.deployment.as_ref().unwrap().status(), Terminated);
        assert_eq!(local.deployment_count(), 0);
    }

    #[tokio::test]
    async fn body_error_still_tears_down_exactly_once() {
        let (provisioner, log) = Recording::new(LocalProvisioner::default());
        let mut controller = LifecycleController::new(provisioner, LifecycleSettings::default());
        let validations = Arc::new(AtomicUsize::new(0));
        controller.checks_mut().add_validator(CountingValidator {
            calls: Arc::clone(&validations),
            passes: true,
        });

        let report = controller
            .run(&RunPlan::new(topology(1)), |_| async {
                Err(Error::Check("transfer rejected".to_string()))
            })
            .await;

        let err = report.outcome.as_ref().unwrap_err();
        assert!(matches!(err, Error::TestBody(msg) if msg.contains("transfer rejected")));
        assert_eq!(report.states()[report.states().len() - 3..], [Running, TearingDown, Failed]);
        assert_eq!(calls(&log).iter().filter(|c| **c == "delete").count(), 1);
        assert_eq!(validations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn body_panic_still_tears_down_exactly_once() {
        let (provisioner, log) = Recording::new(LocalProvisioner::default());
        let mut controller = LifecycleController::new(provisioner, LifecycleSettings::default());

        let report = controller
            .run(&RunPlan::new(topology(1)), |_| async {
                panic!("assertion in test body");
            })
            .await;

        let err = report.outcome.as_ref().unwrap_err();
        assert!(err.to_string().contains("assertion in test body"));
        assert_eq!(report.final_state(), Failed);
        assert_eq!(calls(&log).iter().filter(|c| **c == "delete").count(), 1);
    }

    #[tokio::test]
    async fn provisioning_failure_skips_teardown() {
        let local = LocalProvisioner::new(LocalLimits {
            max_nodes_per_deployment: 1,
            ..Default::default()
        });
        let (provisioner, log) = Recording::new(local);
        let mut controller = LifecycleController::new(provisioner, LifecycleSettings::default());

        let report = controller
            .run(&RunPlan::new(topology(2)), |_| async { Ok(()) })
            .await;

        assert!(matches!(report.outcome, Err(Error::Provisioning(_))));
        assert_eq!(report.states(), vec![Pending, Provisioning, Failed]);
        assert!(report.deployment.is_none());
        assert_eq!(calls(&log), vec!["create"]);
    }

    #[tokio::test]
    async fn teardown_failure_never_masks_the_primary_failure() {
        let (provisioner, _log) = Recording::failing_delete(LocalProvisioner::default());
        let mut controller = LifecycleController::new(provisioner, LifecycleSettings::default());
        let validations = Arc::new(AtomicUsize::new(0));
        controller.checks_mut().add_validator(CountingValidator {
            calls: validations,
            passes: false,
        });

        let report = controller
            .run(&RunPlan::new(topology(1)), |_| async { Ok(()) })
            .await;

        let err = report.outcome.as_ref().unwrap_err();
        assert!(matches!(err, Error::ValidationFailure(_)));
        assert_eq!(err.check_report().unwrap().results.len(), 1);
        assert!(matches!(report.teardown_error, Some(Error::Deployment(_))));
        assert_eq!(report.final_state(), Failed);
    }

    #[tokio::test]
    async fn teardown_failure_after_success_is_recorded_separately() {
        let (provisioner, _log) = Recording::failing_delete(LocalProvisioner::default());
        let mut controller = LifecycleController::new(provisioner, LifecycleSettings::default());

        let report = controller
            .run(&RunPlan::new(topology(1)), |_| async { Ok(()) })
            .await;

        assert!(report.is_success());
        assert!(report.teardown_error.is_some());
        assert_eq!(report.final_state(), Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_timeout_fails_and_tears_down() {
        let (provisioner, log) = Recording::new(LocalProvisioner::default());
        let mut controller = LifecycleController::new(provisioner, LifecycleSettings::default());
        controller.checks_mut().add_readiness(CountingReadiness {
            calls: Arc::new(AtomicUsize::new(0)),
            ready: false,
        });
        let body_ran = Arc::new(AtomicUsize::new(0));
        let body_counter = Arc::clone(&body_ran);

        let report = controller
            .run(&RunPlan::new(topology(1)), move |_| async move {
                body_counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        match &report.outcome {
            Err(Error::ReadinessTimeout { not_ready, .. }) => {
                assert_eq!(not_ready, &vec!["counting-ready".to_string()]);
            }
            other => panic!("expected readiness timeout, got {:?}", other),
        }
        assert_eq!(report.states()[report.states().len() - 3..], [AwaitingReadiness, TearingDown, Failed]);
        assert_eq!(body_ran.load(Ordering::SeqCst), 0);
        assert_eq!(calls(&log).last(), Some(&"delete"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_reported_as_cancellation() {
        let (provisioner, log) = Recording::new(LocalProvisioner::default());
        let mut controller = LifecycleController::new(provisioner, LifecycleSettings::default());
        let plan = RunPlan::new(topology(1)).with_test_timeout(Duration::from_secs(30));

        let report = controller
            .run(&plan, |_| async {
                sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await;

        let err = report.outcome.as_ref().unwrap_err();
        assert!(err.is_cancelled());
        assert!(matches!(
            err,
            Error::Cancelled(CancelReason::TimedOut(limit)) if *limit == Duration::from_secs(30)
        ));
        assert_eq!(calls(&log).iter().filter(|c| **c == "delete").count(), 1);
        assert_eq!(report.final_state(), Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_abort_is_distinct_from_timeout() {
        let (provisioner, log) = Recording::new(LocalProvisioner::default());
        let mut controller = LifecycleController::new(provisioner, LifecycleSettings::default());
        let token = controller.cancel_token();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let report = controller
            .run(&RunPlan::new(topology(1)), |_| async {
                sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await;

        assert!(matches!(
            report.outcome,
            Err(Error::Cancelled(CancelReason::Aborted))
        ));
        assert_eq!(calls(&log).iter().filter(|c| **c == "delete").count(), 1);
    }

    #[tokio::test]
    async fn checks_scoped_to_missing_nodes_fail_the_run() {
        let (provisioner, log) = Recording::new(LocalProvisioner::default());
        let mut controller = LifecycleController::new(provisioner, LifecycleSettings::default());
        controller.checks_mut().node(5).add_validator(CountingValidator {
            calls: Arc::new(AtomicUsize::new(0)),
            passes: true,
        });

        let report = controller
            .run(&RunPlan::new(topology(2)), |_| async { Ok(()) })
            .await;

        assert!(matches!(report.outcome, Err(Error::Config(_))));
        assert_eq!(report.states(), vec![Pending, Provisioning, TearingDown, Failed]);
        assert_eq!(calls(&log), vec!["create", "delete"]);
    }

    #[tokio::test]
    async fn default_mode_applies_overrides_and_reports_json() {
        let local = LocalProvisioner::default();
        let mut controller =
            LifecycleController::new(Arc::new(local.clone()), LifecycleSettings::default());
        controller
            .checks_mut()
            .add_readiness(local.readiness_check().with_interval(Duration::from_millis(10)));
        let seen = Arc::new(Mutex::new(None));
        let applied_slot = Arc::clone(&seen);
        let inspector = local.clone();
        let topology = Topology::builder()
            .nodes(2)
            .node_kind(1, NodeKind::Relay)
            .build()
            .unwrap();

        let report = controller
            .run(
                &RunPlan::new(topology).with_override("relay.rateLimit", "off"),
                move |deployment| async move {
                    *applied_slot.lock().unwrap() = inspector.applied_config(deployment.id());
                    Ok(())
                },
            )
            .await;

        assert!(report.is_success(), "{:?}", report.outcome);
        let applied = seen.lock().unwrap().clone().unwrap();
        assert_eq!(applied.get("relay.rateLimit").map(String::as_str), Some("off"));
        assert!(!report.states().contains(&WaitingDuration));

        let json = report.to_json();
        assert_eq!(json["final_state"], "TERMINATED");
        assert_eq!(json["success"], true);
        assert_eq!(json["deployment"]["nodes"].as_array().unwrap().len(), 2);
        assert!(json["error"].is_null());
    }

    #[tokio::test(start_paused = true)]
    async fn check_budget_depends_on_the_mode() {
        let (provisioner, _log) = Recording::new(LocalProvisioner::default());
        let settings = LifecycleSettings {
            check_budget: Duration::from_secs(60),
            grace_period: Duration::from_secs(2),
            ..LifecycleSettings::default()
        };
        let mut controller = LifecycleController::new(provisioner, settings);
        controller.checks_mut().add_validator(SlowValidator {
            hang: Duration::from_secs(10),
        });

        // Timed: wait 1s + grace 2s leaves a 3s budget.
        let timed = RunPlan::new(topology(1))
            .with_mode(TestExecutionMode::TimedExecution)
            .with_wait(Duration::from_secs(1));
        let report = controller.run(&timed, |_| async { Ok(()) }).await;

        let err = report.outcome.as_ref().unwrap_err();
        assert!(matches!(err, Error::ValidationFailure(_)));
        let slow = err.check_report().unwrap().get("slow").unwrap();
        assert!(slow.timed_out);
        assert_eq!(report.final_state(), Failed);

        let report = controller
            .run(&RunPlan::new(topology(1)), |_| async { Ok(()) })
            .await;

        assert!(report.is_success(), "{:?}", report.outcome);
        let checks = report.outcome.as_ref().unwrap().checks.as_ref().unwrap();
        assert!(!checks.get("slow").unwrap().timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_is_bounded_by_teardown_timeout() {
        let (provisioner, log) =
            Recording::build(LocalProvisioner::default(), Duration::ZERO, DeleteBehaviour::Hang);
        let settings = LifecycleSettings {
            teardown_timeout: Duration::from_secs(5),
            ..LifecycleSettings::default()
        };
        let mut controller = LifecycleController::new(provisioner, settings);
        let started = Instant::now();

        let report = controller
            .run(&RunPlan::new(topology(1)), |_| async {
                Err(Error::Check("ledger diverged".to_string()))
            })
            .await;

        assert!(matches!(&report.outcome, Err(Error::TestBody(msg)) if msg.contains("ledger diverged")));
        match &report.teardown_error {
            Some(Error::Deployment(msg)) => assert!(msg.contains("did not finish")),
            other => panic!("expected teardown timeout, got {:?}", other),
        }
        assert_eq!(report.states()[report.states().len() - 2..], [TearingDown, Failed]);
        assert_eq!(calls(&log).iter().filter(|c| **c == "delete").count(), 1);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_create_still_tears_down_the_deployment() {
        let local = LocalProvisioner::default();
        let (provisioner, log) =
            Recording::build(local.clone(), Duration::from_secs(10), DeleteBehaviour::Normal);
        let mut controller = LifecycleController::new(provisioner, LifecycleSettings::default());
        let token = controller.cancel_token();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let report = controller
            .run(&RunPlan::new(topology(1)), |_| async { Ok(()) })
            .await;

        assert!(matches!(
            report.outcome,
            Err(Error::Cancelled(CancelReason::Aborted))
        ));
        assert_eq!(report.states(), vec![Pending, Provisioning, TearingDown, Failed]);
        assert!(report.deployment.is_some());
        assert_eq!(calls(&log), vec!["create", "delete"]);
        assert_eq!(local.deployment_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_timeouts_never_overflow_the_clock() {
        let local = LocalProvisioner::default();
        let (provisioner, log) = Recording::new(local.clone());
        let mut controller = LifecycleController::new(provisioner, LifecycleSettings::default());
        let polls = Arc::new(AtomicUsize::new(0));
        controller.checks_mut().add_readiness(UnboundedReadiness {
            calls: Arc::clone(&polls),
        });
        let plan = RunPlan::new(topology(1)).with_test_timeout(Duration::from_secs(u64::MAX));

        let report = controller.run(&plan, |_| async { Ok(()) }).await;

        assert!(report.is_success(), "{:?}", report.outcome);
        assert_eq!(polls.load(Ordering::SeqCst), 2);
        assert_eq!(calls(&log), vec!["create", "configure", "start", "delete"]);
        assert_eq!(local.deployment_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_grace_period_saturates_the_check_budget() {
        let (provisioner, _log) = Recording::new(LocalProvisioner::default());
        let settings = LifecycleSettings {
            grace_period: Duration::MAX,
            ..LifecycleSettings::default()
        };
        let mut controller = LifecycleController::new(provisioner, settings);
        controller.checks_mut().add_validator(SlowValidator {
            hang: Duration::from_secs(10),
        });
        let plan = RunPlan::new(topology(1))
            .with_mode(TestExecutionMode::TimedExecution)
            .with_wait(Duration::from_secs(1));

        let report = controller.run(&plan, |_| async { Ok(()) }).await;

        assert!(report.is_success(), "{:?}", report.outcome);
        assert_eq!(report.final_state(), Terminated);
    }
}
