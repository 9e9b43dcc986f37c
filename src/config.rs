//! Declarative test configuration.
//!
//! A [`TestConfig`] is loaded from YAML or TOML, validated, and turned into
//! the immutable [`RunPlan`] and [`LifecycleSettings`] the controller runs.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::deployment::{ConfigOverride, NodeKind};
use crate::error::{Error, Result};
use crate::lifecycle::{LifecycleSettings, RunPlan, TestExecutionMode};
use crate::topology::{InstallType, NodeResources, Topology};

/// Unit of a fixed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Milliseconds,
    #[default]
    Seconds,
    Minutes,
}

/// Fixed wait between readiness and the test body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitDuration {
    pub amount: u64,
    #[serde(default)]
    pub unit: TimeUnit,
}

impl WaitDuration {
    /// The wait as a [`Duration`], or `None` if it cannot be represented.
    pub fn checked_duration(&self) -> Option<Duration> {
        match self.unit {
            TimeUnit::Milliseconds => Some(Duration::from_millis(self.amount)),
            TimeUnit::Seconds => Some(Duration::from_secs(self.amount)),
            TimeUnit::Minutes => self.amount.checked_mul(60).map(Duration::from_secs),
        }
    }

    /// The wait as a [`Duration`], saturating at [`Duration::MAX`].
    pub fn as_duration(&self) -> Duration {
        self.checked_duration().unwrap_or(Duration::MAX)
    }
}

/// Configuration for one test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestConfig {
    /// Test name, used in logs and reports.
    pub name: String,

    /// Which lifecycle stages run.
    #[serde(default)]
    pub mode: TestExecutionMode,

    /// Fixed wait, used only in timed execution.
    #[serde(default)]
    pub wait: Option<WaitDuration>,

    /// Number of nodes.
    #[serde(default = "default_nodes")]
    pub nodes: usize,

    /// Workload kinds of the first nodes; the rest are consensus nodes.
    #[serde(default)]
    pub node_kinds: Vec<NodeKind>,

    /// Name of the deployment provisioner.
    #[serde(default = "default_provisioner")]
    pub provisioner: String,

    #[serde(default)]
    pub resources: NodeResources,

    #[serde(default)]
    pub install_type: InstallType,

    /// Name/value pairs applied before startup.
    #[serde(default)]
    pub config: Vec<ConfigOverride>,

    /// Names of readiness checks.
    #[serde(default)]
    pub readiness: Vec<String>,

    /// Names of validators.
    #[serde(default)]
    pub validators: Vec<String>,

    /// Names of monitors.
    #[serde(default)]
    pub monitors: Vec<String>,

    /// Test-level timeout in seconds.
    #[serde(default)]
    pub test_timeout_secs: Option<u64>,

    /// Maximum concurrently executing checks.
    #[serde(default = "default_worker_limit")]
    pub worker_limit: usize,

    /// Check budget in seconds outside timed execution.
    #[serde(default = "default_check_budget_secs")]
    pub check_budget_secs: u64,

    /// Added to the wait in timed execution to form the check budget.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

fn default_nodes() -> usize {
    1
}

fn default_provisioner() -> String {
    "local".to_string()
}

fn default_worker_limit() -> usize {
    8
}

fn default_check_budget_secs() -> u64 {
    300
}

fn default_grace_period_secs() -> u64 {
    30
}

impl TestConfig {
    /// Creates a configuration with defaults for everything but the name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: TestExecutionMode::default(),
            wait: None,
            nodes: default_nodes(),
            node_kinds: Vec::new(),
            provisioner: default_provisioner(),
            resources: NodeResources::default(),
            install_type: InstallType::default(),
            config: Vec::new(),
            readiness: Vec::new(),
            validators: Vec::new(),
            monitors: Vec::new(),
            test_timeout_secs: None,
            worker_limit: default_worker_limit(),
            check_budget_secs: default_check_budget_secs(),
            grace_period_secs: default_grace_period_secs(),
        }
    }

    /// Loads a configuration from a `.yaml`, `.yml` or `.toml` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(Error::Io)?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("toml") => Self::from_toml_str(&content),
            _ => Err(Error::Config(format!(
                "unsupported config format: {}",
                path.display()
            ))),
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse YAML config: {}", e)))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse TOML config: {}", e)))
    }

    /// Builds the topology this configuration asks for.
    pub fn topology(&self) -> Result<Topology> {
        let mut builder = Topology::builder()
            .nodes(self.nodes)
            .resources(self.resources)
            .install_type(self.install_type);
        for (index, kind) in self.node_kinds.iter().enumerate() {
            builder = builder.node_kind(index, *kind);
        }
        builder.build()
    }

    /// Validates the configuration and builds the run plan.
    pub fn to_plan(&self) -> Result<RunPlan> {
        for warning in self.validate().into_result()? {
            tracing::warn!(test = %self.name, "{}", warning);
        }

        let mut plan = RunPlan::new(self.topology()?)
            .with_mode(self.mode)
            .with_overrides(self.config.iter().cloned());
        if let Some(wait) = self.wait {
            plan = plan.with_wait(wait.as_duration());
        }
        if let Some(secs) = self.test_timeout_secs {
            plan = plan.with_test_timeout(Duration::from_secs(secs));
        }
        Ok(plan)
    }

    /// Controller settings derived from this configuration.
    pub fn settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            worker_limit: self.worker_limit,
            check_budget: Duration::from_secs(self.check_budget_secs),
            grace_period: Duration::from_secs(self.grace_period_secs),
            ..LifecycleSettings::default()
        }
    }
}

/// Issues found while validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigIssues {
    /// Fatal problems.
    pub errors: Vec<String>,
    /// Suspicious but runnable settings.
    pub warnings: Vec<String>,
}

impl ConfigIssues {
    /// Returns true if there are no errors.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Converts to a Result carrying the warnings, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    fn validate(&self) -> ConfigIssues;
}

impl Validate for TestConfig {
    fn validate(&self) -> ConfigIssues {
        let mut issues = ConfigIssues::default();

        if self.name.trim().is_empty() {
            issues.add_error("name cannot be empty");
        }

        if self.nodes == 0 {
            issues.add_error("nodes must be at least 1");
        }

        if self.node_kinds.len() > self.nodes {
            issues.add_error(format!(
                "{} node kinds given for {} nodes",
                self.node_kinds.len(),
                self.nodes
            ));
        }

        if self.worker_limit == 0 {
            issues.add_error("worker_limit must be at least 1");
        }

        match (self.mode, self.wait) {
            (TestExecutionMode::TimedExecution, None) => {
                issues.add_error("timed_execution requires a wait duration");
            }
            (TestExecutionMode::TimedExecution, Some(_)) => {}
            (mode, Some(_)) => {
                issues.add_warning(format!("wait is ignored in {:?} mode", mode));
            }
            (_, None) => {}
        }

        if let Some(wait) = self.wait {
            if wait.checked_duration().is_none() {
                issues.add_error(format!(
                    "wait of {} {:?} is out of range",
                    wait.amount, wait.unit
                ));
            }
        }

        if self.mode == TestExecutionMode::ProvisionOnly
            && !(self.readiness.is_empty() && self.validators.is_empty() && self.monitors.is_empty())
        {
            issues.add_warning("checks are never run in provision_only mode");
        }

        if self.test_timeout_secs == Some(0) {
            issues.add_error("test_timeout_secs must be greater than 0");
        }

        if self.provisioner.trim().is_empty() {
            issues.add_warning("provisioner name is empty");
        }

        let mut seen = HashSet::new();
        for o in &self.config {
            if !seen.insert(o.name.as_str()) {
                issues.add_warning(format!("config override '{}' is set more than once", o.name));
            }
        }

        issues
    }
}
