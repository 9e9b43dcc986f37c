//! In-memory deployment backend.
//!
//! Simulates a platform: deployments are rendered into nodes with
//! endpoints, configuration overrides are recorded, and nodes become
//! active a fixed delay after they are started.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;

use crate::checks::{
    CheckContext, CheckOutcome, Monitor, ReadinessCheck, DEFAULT_CHECK_INTERVAL,
    DEFAULT_CHECK_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::topology::Topology;

use super::provisioner::{
    ConfigOverride, DeploymentId, DeploymentProvisioner, NetworkDeployment, Node, NodeKind,
};

/// Platform status of a local deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformStatus {
    Created,
    Configured,
    Starting,
    Active,
}

/// Resource limits enforced by [`LocalProvisioner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalLimits {
    pub max_nodes_per_deployment: usize,
    pub max_deployments: usize,
    pub max_ram_mib_per_node: u32,
}

impl Default for LocalLimits {
    fn default() -> Self {
        Self {
            max_nodes_per_deployment: 16,
            max_deployments: 4,
            max_ram_mib_per_node: 16 * 1024,
        }
    }
}

struct LocalEntry {
    deployment: Arc<NetworkDeployment>,
    applied_config: BTreeMap<String, String>,
    status: PlatformStatus,
    started_at: Option<Instant>,
}

/// Provisioner that keeps deployments in memory.
///
/// Clones share the same deployments.
#[derive(Clone)]
pub struct LocalProvisioner {
    limits: LocalLimits,
    startup_delay: Duration,
    entries: Arc<Mutex<HashMap<DeploymentId, LocalEntry>>>,
}

impl Default for LocalProvisioner {
    fn default() -> Self {
        Self::new(LocalLimits::default())
    }
}

impl LocalProvisioner {
    /// Creates a provisioner with the given limits and no startup delay.
    pub fn new(limits: LocalLimits) -> Self {
        Self {
            limits,
            startup_delay: Duration::ZERO,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sets how long started nodes take to become active.
    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    /// Returns the enforced limits.
    pub fn limits(&self) -> LocalLimits {
        self.limits
    }

    /// Returns the platform status of a deployment.
    pub fn platform_status(&self, id: &DeploymentId) -> Option<PlatformStatus> {
        self.entries().get(id).map(|entry| match entry.status {
            PlatformStatus::Starting
                if entry
                    .started_at
                    .is_some_and(|at| at.elapsed() >= self.startup_delay) =>
            {
                PlatformStatus::Active
            }
            status => status,
        })
    }

    /// Returns the configuration overrides applied to a deployment.
    pub fn applied_config(&self, id: &DeploymentId) -> Option<BTreeMap<String, String>> {
        self.entries().get(id).map(|entry| entry.applied_config.clone())
    }

    /// Number of live deployments.
    pub fn deployment_count(&self) -> usize {
        self.entries().len()
    }

    /// Readiness check that waits for this provisioner's nodes to become active.
    pub fn readiness_check(&self) -> NodesActiveCheck {
        NodesActiveCheck::new(self.clone())
    }

    /// Monitor reporting this provisioner's platform status.
    pub fn status_monitor(&self) -> NodeStatusMonitor {
        NodeStatusMonitor::new(self.clone())
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<DeploymentId, LocalEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_limits(&self, topology: &Topology, live: usize) -> Result<()> {
        if topology.node_count() > self.limits.max_nodes_per_deployment {
            return Err(Error::Provisioning(format!(
                "{} nodes requested, limit is {}",
                topology.node_count(),
                self.limits.max_nodes_per_deployment
            )));
        }
        if topology.resources().ram_mib > self.limits.max_ram_mib_per_node {
            return Err(Error::Provisioning(format!(
                "{} MiB per node requested, limit is {} MiB",
                topology.resources().ram_mib,
                self.limits.max_ram_mib_per_node
            )));
        }
        if live >= self.limits.max_deployments {
            return Err(Error::Provisioning(format!(
                "deployment limit of {} reached",
                self.limits.max_deployments
            )));
        }
        Ok(())
    }

    fn update(
        &self,
        id: &DeploymentId,
        apply: impl FnOnce(&mut LocalEntry),
    ) -> Result<()> {
        let mut entries = self.entries();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| Error::Deployment(format!("unknown deployment {}", id)))?;
        apply(entry);
        Ok(())
    }
}

fn render_node(id: &DeploymentId, index: usize, kind: NodeKind) -> Node {
    let short: String = id.as_str().chars().take(8).collect();
    let host = format!("node{}-{}.local", index, short);

    let node = Node::new(index, kind).with_tag(match kind {
        NodeKind::Consensus => "consensus",
        NodeKind::Relay => "relay",
        NodeKind::Mirror => "mirror",
    });

    match kind {
        NodeKind::Consensus => node
            .with_endpoint("grpc", format!("{}:50211", host))
            .with_endpoint("gossip", format!("{}:50111", host)),
        NodeKind::Relay => node.with_endpoint("json-rpc", format!("{}:7546", host)),
        NodeKind::Mirror => node
            .with_endpoint("rest", format!("{}:5551", host))
            .with_endpoint("grpc", format!("{}:5600", host)),
    }
}

#[async_trait]
impl DeploymentProvisioner for LocalProvisioner {
    fn name(&self) -> &str {
        "local"
    }

    async fn create(&self, topology: &Topology) -> Result<Arc<NetworkDeployment>> {
        let mut entries = self.entries();
        self.check_limits(topology, entries.len())?;

        let id = DeploymentId::generate();
        let nodes = topology
            .node_kinds()
            .iter()
            .enumerate()
            .map(|(index, kind)| render_node(&id, index, *kind))
            .collect();
        let deployment = Arc::new(NetworkDeployment::new(
            id.clone(),
            topology.clone(),
            nodes,
        )?);

        entries.insert(
            id.clone(),
            LocalEntry {
                deployment: Arc::clone(&deployment),
                applied_config: BTreeMap::new(),
                status: PlatformStatus::Created,
                started_at: None,
            },
        );

        tracing::info!(
            deployment = %id,
            nodes = topology.node_count(),
            install = ?topology.install_type(),
            "created local deployment"
        );
        Ok(deployment)
    }

    async fn configure(
        &self,
        deployment: &NetworkDeployment,
        overrides: &[ConfigOverride],
    ) -> Result<()> {
        self.update(deployment.id(), |entry| {
            for o in overrides {
                entry.applied_config.insert(o.name.clone(), o.value.clone());
            }
            entry.status = PlatformStatus::Configured;
        })?;
        tracing::debug!(deployment = %deployment.id(), overrides = overrides.len(), "applied configuration");
        Ok(())
    }

    async fn start(&self, deployment: &NetworkDeployment) -> Result<()> {
        self.update(deployment.id(), |entry| {
            entry.status = PlatformStatus::Starting;
            entry.started_at = Some(Instant::now());
        })
    }

    async fn delete(&self, id: &DeploymentId) -> Result<bool> {
        let removed = self.entries().remove(id).is_some();
        if removed {
            tracing::info!(deployment = %id, "deleted local deployment");
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<Arc<NetworkDeployment>>> {
        Ok(self
            .entries()
            .values()
            .map(|entry| Arc::clone(&entry.deployment))
            .collect())
    }

    async fn by_id(&self, id: &DeploymentId) -> Result<Option<Arc<NetworkDeployment>>> {
        Ok(self
            .entries()
            .get(id)
            .map(|entry| Arc::clone(&entry.deployment)))
    }
}

/// Readiness check: every consensus node of a local deployment is active.
#[derive(Clone)]
pub struct NodesActiveCheck {
    provisioner: LocalProvisioner,
    interval: Duration,
    timeout: Duration,
}

impl NodesActiveCheck {
    pub fn new(provisioner: LocalProvisioner) -> Self {
        Self {
            provisioner,
            interval: DEFAULT_CHECK_INTERVAL,
            timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ReadinessCheck for NodesActiveCheck {
    fn name(&self) -> &str {
        "nodes-active"
    }

    async fn ready(&self, deployment: &NetworkDeployment) -> bool {
        self.provisioner.platform_status(deployment.id()) == Some(PlatformStatus::Active)
    }

    fn check_interval(&self) -> Duration {
        self.interval
    }

    fn check_timeout(&self) -> Duration {
        self.timeout
    }

    fn applies_to(&self, kind: NodeKind) -> bool {
        kind == NodeKind::Consensus
    }
}

/// Monitor: fails if the deployment disappeared, indeterminate while starting.
#[derive(Clone)]
pub struct NodeStatusMonitor {
    provisioner: LocalProvisioner,
}

impl NodeStatusMonitor {
    pub fn new(provisioner: LocalProvisioner) -> Self {
        Self { provisioner }
    }
}

impl Monitor for NodeStatusMonitor {
    fn name(&self) -> &str {
        "node-status"
    }

    fn check(&self, ctx: &CheckContext) -> CheckOutcome {
        match self.provisioner.platform_status(ctx.deployment().id()) {
            Some(PlatformStatus::Active) => CheckOutcome::Success,
            Some(_) => CheckOutcome::Indeterminate,
            None => CheckOutcome::Failure,
        }
    }
}
