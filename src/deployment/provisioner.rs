//! Deployment provisioner trait and types.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lifecycle::LifecycleState;
use crate::topology::Topology;

/// Workload kind of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// A consensus node.
    #[default]
    Consensus,
    /// A relay fronting consensus nodes.
    Relay,
    /// A mirror node exporting history.
    Mirror,
}

/// Capabilities a workload kind supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// Files on the node can be read and copied.
    pub file_access: bool,
    /// Node logs can be collected.
    pub logs: bool,
    /// Commands can be executed on the node.
    pub exec: bool,
    /// The node exposes service endpoints.
    pub endpoints: bool,
}

impl NodeKind {
    /// Returns the capability table for this kind.
    pub fn capabilities(self) -> Capabilities {
        match self {
            Self::Consensus => Capabilities {
                file_access: true,
                logs: true,
                exec: true,
                endpoints: true,
            },
            Self::Relay => Capabilities {
                file_access: false,
                logs: true,
                exec: false,
                endpoints: true,
            },
            Self::Mirror => Capabilities {
                file_access: true,
                logs: true,
                exec: false,
                endpoints: true,
            },
        }
    }
}

/// A provisioned node. Immutable once the deployment exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    index: usize,
    kind: NodeKind,
    tags: BTreeSet<String>,
    endpoints: BTreeMap<String, String>,
}

impl Node {
    /// Creates a node at `index` with the given kind.
    pub fn new(index: usize, kind: NodeKind) -> Self {
        Self {
            index,
            kind,
            tags: BTreeSet::new(),
            endpoints: BTreeMap::new(),
        }
    }

    /// Adds a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Adds a named endpoint.
    pub fn with_endpoint(mut self, name: impl Into<String>, address: impl Into<String>) -> Self {
        self.endpoints.insert(name.into(), address.into());
        self
    }

    /// Zero-based index, assigned at creation.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Workload kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Tags.
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Returns true if the node carries `tag`.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Endpoint map.
    pub fn endpoints(&self) -> &BTreeMap<String, String> {
        &self.endpoints
    }

    /// Looks up a named endpoint.
    pub fn endpoint(&self, name: &str) -> Option<&str> {
        self.endpoints.get(name).map(String::as_str)
    }
}

/// Unique identifier of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(String);

impl DeploymentId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeploymentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name/value pair applied to the rendered platform configuration before startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigOverride {
    pub name: String,
    pub value: String,
}

impl ConfigOverride {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A provisioned network, owned by exactly one lifecycle run.
#[derive(Debug)]
pub struct NetworkDeployment {
    id: DeploymentId,
    topology: Topology,
    nodes: Vec<Node>,
    status: RwLock<LifecycleState>,
}

impl NetworkDeployment {
    /// Creates a deployment from the provisioned nodes.
    ///
    /// Node indices must be dense, zero-based and in order, and the node
    /// count must match the topology.
    pub fn new(id: DeploymentId, topology: Topology, nodes: Vec<Node>) -> Result<Self> {
        if nodes.len() != topology.node_count() {
            return Err(Error::Provisioning(format!(
                "topology requested {} nodes but {} were provisioned",
                topology.node_count(),
                nodes.len()
            )));
        }
        if let Some((expected, node)) = nodes
            .iter()
            .enumerate()
            .find(|(i, node)| node.index() != *i)
        {
            return Err(Error::Provisioning(format!(
                "node at position {} has index {}",
                expected,
                node.index()
            )));
        }

        Ok(Self {
            id,
            topology,
            nodes,
            status: RwLock::new(LifecycleState::Provisioning),
        })
    }

    /// Deployment identifier.
    pub fn id(&self) -> &DeploymentId {
        &self.id
    }

    /// Topology snapshot the deployment was created from.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Nodes ordered by index.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Node at `index`, if present.
    pub fn node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    /// Current lifecycle status.
    pub fn status(&self) -> LifecycleState {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_status(&self, state: LifecycleState) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Serializable summary for reports.
    pub fn summary(&self) -> DeploymentSummary {
        DeploymentSummary {
            id: self.id.clone(),
            status: self.status(),
            topology: self.topology.clone(),
            nodes: self.nodes.clone(),
        }
    }
}

/// Serializable view of a deployment.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentSummary {
    pub id: DeploymentId,
    pub status: LifecycleState,
    pub topology: Topology,
    pub nodes: Vec<Node>,
}

/// Provider for creating and destroying network deployments.
///
/// The lifecycle controller only knows this capability; how charts and
/// cluster resources are rendered is up to the implementation.
#[async_trait]
pub trait DeploymentProvisioner: Send + Sync {
    /// Returns the name of this provisioner.
    fn name(&self) -> &str;

    /// Creates a deployment for `topology`.
    ///
    /// Fails with [`Error::Provisioning`] when the topology is rejected,
    /// before any resources are committed. A run cancelled meanwhile still
    /// awaits this call, bounded by the teardown timeout, and deletes what
    /// it returns.
    async fn create(&self, topology: &Topology) -> Result<Arc<NetworkDeployment>>;

    /// Applies configuration overrides before the nodes start.
    async fn configure(
        &self,
        _deployment: &NetworkDeployment,
        _overrides: &[ConfigOverride],
    ) -> Result<()> {
        Ok(())
    }

    /// Starts the deployment's nodes.
    async fn start(&self, _deployment: &NetworkDeployment) -> Result<()> {
        Ok(())
    }

    /// Deletes a deployment. Returns false if it did not exist.
    async fn delete(&self, id: &DeploymentId) -> Result<bool>;

    /// Lists live deployments.
    async fn list(&self) -> Result<Vec<Arc<NetworkDeployment>>>;

    /// Looks up a deployment by id.
    async fn by_id(&self, id: &DeploymentId) -> Result<Option<Arc<NetworkDeployment>>>;
}
