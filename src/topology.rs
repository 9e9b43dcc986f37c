//! Declarative network topology.
//!
//! A [`Topology`] is produced by [`TopologyBuilder`] and is frozen once
//! built: it only exposes getters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::deployment::NodeKind;
use crate::error::{Error, Result};

/// How the deployment is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstallType {
    /// Installed into a Kubernetes cluster.
    #[default]
    Kubernetes,
    /// Installed as local processes.
    Local,
}

/// Per-node resource request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResources {
    /// Memory per node in MiB.
    #[serde(default = "default_ram_mib")]
    pub ram_mib: u32,
    /// CPU per node in millicores.
    #[serde(default = "default_cpu_millis")]
    pub cpu_millis: u32,
}

fn default_ram_mib() -> u32 {
    2048
}

fn default_cpu_millis() -> u32 {
    1000
}

impl Default for NodeResources {
    fn default() -> Self {
        Self {
            ram_mib: default_ram_mib(),
            cpu_millis: default_cpu_millis(),
        }
    }
}

/// Immutable description of the network to provision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Topology {
    node_kinds: Vec<NodeKind>,
    resources: NodeResources,
    install_type: InstallType,
}

impl Topology {
    /// Starts building a topology.
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    /// Number of nodes requested.
    pub fn node_count(&self) -> usize {
        self.node_kinds.len()
    }

    /// Workload kind of every node, by index.
    pub fn node_kinds(&self) -> &[NodeKind] {
        &self.node_kinds
    }

    /// Workload kind of the node at `index`, if it exists.
    pub fn kind_of(&self, index: usize) -> Option<NodeKind> {
        self.node_kinds.get(index).copied()
    }

    /// Per-node resource request.
    pub fn resources(&self) -> NodeResources {
        self.resources
    }

    /// Install type.
    pub fn install_type(&self) -> InstallType {
        self.install_type
    }
}

/// Builder for [`Topology`].
#[derive(Debug, Clone)]
pub struct TopologyBuilder {
    node_count: usize,
    kinds: BTreeMap<usize, NodeKind>,
    resources: NodeResources,
    install_type: InstallType,
}

impl Default for TopologyBuilder {
    fn default() -> Self {
        Self {
            node_count: 1,
            kinds: BTreeMap::new(),
            resources: NodeResources::default(),
            install_type: InstallType::default(),
        }
    }
}

impl TopologyBuilder {
    /// Sets the number of nodes.
    pub fn nodes(mut self, count: usize) -> Self {
        self.node_count = count;
        self
    }

    /// Overrides the workload kind of one node. Unset nodes are consensus nodes.
    pub fn node_kind(mut self, index: usize, kind: NodeKind) -> Self {
        self.kinds.insert(index, kind);
        self
    }

    /// Sets the per-node resource request.
    pub fn resources(mut self, resources: NodeResources) -> Self {
        self.resources = resources;
        self
    }

    /// Sets memory per node in MiB.
    pub fn ram_mib(mut self, ram_mib: u32) -> Self {
        self.resources.ram_mib = ram_mib;
        self
    }

    /// Sets CPU per node in millicores.
    pub fn cpu_millis(mut self, cpu_millis: u32) -> Self {
        self.resources.cpu_millis = cpu_millis;
        self
    }

    /// Sets the install type.
    pub fn install_type(mut self, install_type: InstallType) -> Self {
        self.install_type = install_type;
        self
    }

    /// Validates the request and freezes it.
    pub fn build(self) -> Result<Topology> {
        if self.node_count == 0 {
            return Err(Error::Provisioning(
                "topology must contain at least one node".to_string(),
            ));
        }
        if self.resources.ram_mib == 0 || self.resources.cpu_millis == 0 {
            return Err(Error::Provisioning(
                "per-node RAM and CPU must be greater than zero".to_string(),
            ));
        }
        if let Some((&index, _)) = self.kinds.range(self.node_count..).next() {
            return Err(Error::Provisioning(format!(
                "node kind set for index {} but topology has {} nodes",
                index, self.node_count
            )));
        }

        let node_kinds = (0..self.node_count)
            .map(|i| self.kinds.get(&i).copied().unwrap_or_default())
            .collect();

        Ok(Topology {
            node_kinds,
            resources: self.resources,
            install_type: self.install_type,
        })
    }
}
