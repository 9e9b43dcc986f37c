//! Per-test registry of checks.
//!
//! [`CheckMutator`] keeps an ordered list of registrations, each scoped to
//! all nodes or to one node. The lifecycle controller takes a
//! [`CheckSnapshot`] when a run starts; the registry is only reachable
//! through `&mut` on the controller, so it cannot change while a run is in
//! flight.

use std::sync::Arc;

use crate::deployment::NetworkDeployment;
use crate::error::{Error, Result};

use super::{CheckKind, Monitor, ReadinessCheck, Validator};

/// Which nodes a registration applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckScope {
    AllNodes,
    Node(usize),
}

impl CheckScope {
    /// The node index for node-scoped registrations.
    pub fn node(self) -> Option<usize> {
        match self {
            Self::AllNodes => None,
            Self::Node(index) => Some(index),
        }
    }
}

/// A check of any kind.
#[derive(Clone)]
pub enum RegisteredCheck {
    Readiness(Arc<dyn ReadinessCheck>),
    Validator(Arc<dyn Validator>),
    Monitor(Arc<dyn Monitor>),
}

impl RegisteredCheck {
    pub fn name(&self) -> &str {
        match self {
            Self::Readiness(check) => check.name(),
            Self::Validator(check) => check.name(),
            Self::Monitor(check) => check.name(),
        }
    }

    pub fn kind(&self) -> CheckKind {
        match self {
            Self::Readiness(_) => CheckKind::Readiness,
            Self::Validator(_) => CheckKind::Validator,
            Self::Monitor(_) => CheckKind::Monitor,
        }
    }
}

impl std::fmt::Debug for RegisteredCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredCheck")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}

/// A check together with its scope.
#[derive(Debug, Clone)]
pub struct Registration {
    pub scope: CheckScope,
    pub check: RegisteredCheck,
}

/// Mutable per-test collection of checks.
#[derive(Debug, Clone, Default)]
pub struct CheckMutator {
    registrations: Vec<Registration>,
}

impl CheckMutator {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a readiness check for all nodes.
    pub fn add_readiness(&mut self, check: impl ReadinessCheck + 'static) -> &mut Self {
        self.add(RegisteredCheck::Readiness(Arc::new(check)))
    }

    /// Registers a validator for all nodes.
    pub fn add_validator(&mut self, check: impl Validator + 'static) -> &mut Self {
        self.add(RegisteredCheck::Validator(Arc::new(check)))
    }

    /// Registers a monitor for all nodes.
    pub fn add_monitor(&mut self, check: impl Monitor + 'static) -> &mut Self {
        self.add(RegisteredCheck::Monitor(Arc::new(check)))
    }

    /// Registers an already shared check for all nodes.
    pub fn add(&mut self, check: RegisteredCheck) -> &mut Self {
        self.push(CheckScope::AllNodes, check);
        self
    }

    /// Removes every all-nodes registration named `name`.
    pub fn remove(&mut self, name: &str) -> &mut Self {
        self.retain_unless(CheckScope::AllNodes, Some(name));
        self
    }

    /// Removes every registration, global and node-scoped.
    pub fn clear(&mut self) -> &mut Self {
        self.registrations.clear();
        self
    }

    /// Returns a view that registers checks for the node at `index`.
    pub fn node(&mut self, index: usize) -> NodeCheckMutator<'_> {
        NodeCheckMutator {
            registry: self,
            index,
        }
    }

    /// Registrations in insertion order.
    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Freezes the current registrations for a run.
    pub fn snapshot(&self) -> CheckSnapshot {
        CheckSnapshot {
            registrations: self.registrations.clone().into(),
        }
    }

    fn push(&mut self, scope: CheckScope, check: RegisteredCheck) {
        tracing::debug!(check = %check.name(), kind = ?check.kind(), scope = ?scope, "registered check");
        self.registrations.push(Registration { scope, check });
    }

    fn retain_unless(&mut self, scope: CheckScope, name: Option<&str>) {
        self.registrations.retain(|r| {
            let matches = r.scope == scope && name.map_or(true, |n| r.check.name() == n);
            !matches
        });
    }
}

/// Node-scoped view of a [`CheckMutator`].
pub struct NodeCheckMutator<'a> {
    registry: &'a mut CheckMutator,
    index: usize,
}

impl<'a> NodeCheckMutator<'a> {
    /// Registers a readiness check for this node.
    pub fn add_readiness(&mut self, check: impl ReadinessCheck + 'static) -> &mut Self {
        self.add(RegisteredCheck::Readiness(Arc::new(check)))
    }

    /// Registers a validator for this node.
    pub fn add_validator(&mut self, check: impl Validator + 'static) -> &mut Self {
        self.add(RegisteredCheck::Validator(Arc::new(check)))
    }

    /// Registers a monitor for this node.
    pub fn add_monitor(&mut self, check: impl Monitor + 'static) -> &mut Self {
        self.add(RegisteredCheck::Monitor(Arc::new(check)))
    }

    /// Registers an already shared check for this node.
    pub fn add(&mut self, check: RegisteredCheck) -> &mut Self {
        self.registry.push(CheckScope::Node(self.index), check);
        self
    }

    /// Removes this node's registrations named `name`.
    pub fn remove(&mut self, name: &str) -> &mut Self {
        self.registry
            .retain_unless(CheckScope::Node(self.index), Some(name));
        self
    }

    /// Removes every registration for this node.
    pub fn clear(&mut self) -> &mut Self {
        self.registry.retain_unless(CheckScope::Node(self.index), None);
        self
    }

    /// Index of the node this view targets.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns to the all-nodes registry.
    pub fn all_nodes(self) -> &'a mut CheckMutator {
        self.registry
    }
}

/// Immutable view of the registrations taken when a run starts.
#[derive(Debug, Clone, Default)]
pub struct CheckSnapshot {
    registrations: Arc<[Registration]>,
}

impl CheckSnapshot {
    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Fails if a node-scoped registration targets a node the deployment does not have.
    pub fn validate_scopes(&self, deployment: &NetworkDeployment) -> Result<()> {
        let node_count = deployment.nodes().len();
        let out_of_range: Vec<String> = self
            .registrations
            .iter()
            .filter_map(|r| match r.scope {
                CheckScope::Node(index) if index >= node_count => {
                    Some(format!("{} (node {})", r.check.name(), index))
                }
                _ => None,
            })
            .collect();

        if out_of_range.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "checks registered for nodes outside a {}-node deployment: {}",
                node_count,
                out_of_range.join(", ")
            )))
        }
    }

    /// Readiness checks that apply to at least one node in their scope.
    pub fn readiness_for(&self, deployment: &NetworkDeployment) -> Vec<Arc<dyn ReadinessCheck>> {
        self.registrations
            .iter()
            .filter_map(|r| match &r.check {
                RegisteredCheck::Readiness(check) => Some((r.scope, check)),
                _ => None,
            })
            .filter(|(scope, check)| match scope {
                CheckScope::AllNodes => deployment.nodes().iter().any(|n| check.applies_to(n.kind())),
                CheckScope::Node(index) => deployment
                    .node(*index)
                    .is_some_and(|n| check.applies_to(n.kind())),
            })
            .map(|(_, check)| Arc::clone(check))
            .collect()
    }

    /// Validators with their scopes, in registration order.
    pub fn validators(&self) -> Vec<(CheckScope, Arc<dyn Validator>)> {
        self.registrations
            .iter()
            .filter_map(|r| match &r.check {
                RegisteredCheck::Validator(check) => Some((r.scope, Arc::clone(check))),
                _ => None,
            })
            .collect()
    }

    /// Monitors with their scopes, in registration order.
    pub fn monitors(&self) -> Vec<(CheckScope, Arc<dyn Monitor>)> {
        self.registrations
            .iter()
            .filter_map(|r| match &r.check {
                RegisteredCheck::Monitor(check) => Some((r.scope, Arc::clone(check))),
                _ => None,
            })
            .collect()
    }
}
