//! Lifecycle integration tests.
//!
//! Drive the public API end-to-end against the local provisioner, using
//! the configurations under `tests/fixtures/`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use testnet_orchestrator::{
    default_registry, CheckOutcome, Error, LifecycleController, LocalProvisioner, ServiceLocator,
    TestConfig,
};
use tokio::time::Instant;

use testnet_orchestrator::LifecycleState::*;

fn fixture(name: &str) -> TestConfig {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name);
    TestConfig::load(path).unwrap()
}

fn setup(name: &str, local: &LocalProvisioner) -> (TestConfig, LifecycleController) {
    let config = fixture(name);
    let locator = ServiceLocator::new(default_registry(local));
    let controller = LifecycleController::from_config(&config, &locator).unwrap();
    (config, controller)
}

#[tokio::test(start_paused = true)]
async fn timed_two_node_run_follows_the_full_lifecycle() {
    let local = LocalProvisioner::default().with_startup_delay(Duration::from_secs(2));
    let (config, mut controller) = setup("timed_two_nodes.yaml", &local);
    let plan = config.to_plan().unwrap();

    let started = Instant::now();
    let body_started = Arc::new(Mutex::new(None));
    let clock = Arc::clone(&body_started);
    let inspector = local.clone();

    let report = controller
        .run(&plan, move |deployment| async move {
            assert_eq!(deployment.nodes().len(), 2);
            let applied = inspector.applied_config(deployment.id()).unwrap();
            assert_eq!(applied["consensus.roundTimeout"], "2s");
            *clock.lock().unwrap() = Some(Instant::now());
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
    assert!(body_at >= ready_at + Duration::from_secs(5));

    let summary = report.outcome.as_ref().unwrap();
    let readiness = summary.readiness.as_ref().unwrap();
    assert!(readiness.checks.iter().all(|c| c.ready));
    let checks = summary.checks.as_ref().unwrap();
    assert_eq!(checks.get("node-count").unwrap().outcome, CheckOutcome::Success);
    assert_eq!(local.deployment_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn timed_run_tears_down_once_when_the_body_panics() {
    let local = LocalProvisioner::default().with_startup_delay(Duration::from_secs(1));
    let (config, mut controller) = setup("timed_two_nodes.yaml", &local);
    let plan = config.to_plan().unwrap();

    let report = controller
        .run(&plan, |_| async {
            panic!("balance mismatch");
        })
        .await;

    assert!(matches!(report.outcome, Err(Error::TestBody(_))));
    assert!(report.teardown_error.is_none());
    let states = report.states();
    assert_eq!(states.iter().filter(|s| **s == TearingDown).count(), 1);
    assert_eq!(report.final_state(), Failed);
    assert_eq!(local.deployment_count(), 0);
}

#[tokio::test]
async fn default_run_reports_every_check() {
    let local = LocalProvisioner::default();
    let (config, mut controller) = setup("default_checks.yaml", &local);

    let report = controller
        .run(&config.to_plan().unwrap(), |_| async { Ok(()) })
        .await;

    assert!(report.is_success(), "{:?}", report.outcome);
    assert!(!report.states().contains(&WaitingDuration));
    let checks = report.outcome.as_ref().unwrap().checks.as_ref().unwrap();
    assert_eq!(checks.results.len(), 2);
    assert_eq!(checks.get("node-status").unwrap().outcome, CheckOutcome::Success);

    let json = report.to_json();
    assert_eq!(json["deployment"]["nodes"][1]["kind"], "relay");
    assert_eq!(json["checks"]["results"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn provision_only_run_skips_every_intermediate_stage() {
    let local = LocalProvisioner::default();
    let (config, mut controller) = setup("provision_only.yaml", &local);
    let body_runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&body_runs);

    let report = controller
        .run(&config.to_plan().unwrap(), move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

    assert_eq!(
        report.states(),
        vec![Pending, Provisioning, Running, TearingDown, Terminated]
    );
    assert_eq!(body_runs.load(Ordering::SeqCst), 1);
    assert!(report.outcome.as_ref().unwrap().readiness.is_none());
}

#[tokio::test]
async fn topology_over_provisioner_limits_fails_before_any_deployment_exists() {
    let local = LocalProvisioner::default();
    let (config, mut controller) = setup("over_limit.yaml", &local);

    let report = controller
        .run(&config.to_plan().unwrap(), |_| async { Ok(()) })
        .await;

    assert!(matches!(report.outcome, Err(Error::Provisioning(_))));
    assert_eq!(report.states(), vec![Pending, Provisioning, Failed]);
    assert!(report.deployment.is_none());
    assert_eq!(local.deployment_count(), 0);
}

#[test]
fn unknown_check_names_fail_service_location() {
    let local = LocalProvisioner::default();
    let config = fixture("unknown_validator.yaml");
    let locator = ServiceLocator::new(default_registry(&local));

    let err = LifecycleController::from_config(&config, &locator).unwrap_err();
    assert!(matches!(err, Error::ServiceLocation { .. }));
    assert!(err.to_string().contains("ledger-balance"));
}

#[tokio::test]
async fn independent_runs_proceed_in_parallel() {
    let local = LocalProvisioner::default();
    let (config, mut first) = setup("default_checks.yaml", &local);
    let (_, mut second) = setup("default_checks.yaml", &local);
    let plan = config.to_plan().unwrap();

    let (a, b) = tokio::join!(
        first.run(&plan, |_| async { Ok(()) }),
        second.run(&plan, |_| async { Ok(()) }),
    );

    assert!(a.is_success(), "{:?}", a.outcome);
    assert!(b.is_success(), "{:?}", b.outcome);
    let (a_id, b_id) = (a.deployment.unwrap(), b.deployment.unwrap());
    assert_ne!(a_id.id(), b_id.id());
    assert_eq!(local.deployment_count(), 0);
}
