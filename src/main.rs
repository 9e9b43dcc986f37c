//! Testnet Orchestrator CLI
//!
//! Runs one lifecycle from a test configuration file against the local
//! provisioner and prints the run report as JSON.

use std::time::Duration;

use testnet_orchestrator::{
    default_registry, LifecycleController, LocalProvisioner, ServiceLocator, TestConfig,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <config.yaml|config.toml>", args[0]);
        eprintln!("\nProvisions the configured network, waits for readiness, runs the");
        eprintln!("configured checks and tears the network down again.");
        eprintln!("\nEnvironment variables:");
        eprintln!("  LOCAL_STARTUP_DELAY_MS=<ms>  Simulated node startup time (default: 0)");
        std::process::exit(1);
    }

    let config = match TestConfig::load(&args[1]) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args[1], e);
            std::process::exit(1);
        }
    };

    let startup_delay = std::env::var("LOCAL_STARTUP_DELAY_MS")
        .ok()
        .and_then(|ms| ms.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or_default();
    let local = LocalProvisioner::default().with_startup_delay(startup_delay);
    let locator = ServiceLocator::new(default_registry(&local));

    let plan = match config.to_plan() {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    let mut controller = match LifecycleController::from_config(&config, &locator) {
        Ok(controller) => controller,
        Err(e) => {
            eprintln!("Failed to set up {}: {}", config.name, e);
            std::process::exit(1);
        }
    };

    let cancel = controller.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, aborting run");
            cancel.cancel();
        }
    });

    tracing::info!(test = %config.name, mode = ?config.mode, nodes = config.nodes, "starting run");

    let report = controller
        .run(&plan, |deployment| async move {
            tracing::info!(deployment = %deployment.id(), nodes = deployment.nodes().len(), "deployment usable");
            Ok(())
        })
        .await;

    match serde_json::to_string_pretty(&report.to_json()) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to render report: {}", e),
    }

    if !report.is_success() {
        std::process::exit(1);
    }
}
