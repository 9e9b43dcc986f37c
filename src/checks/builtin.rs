//! Checks that only depend on the deployment model.

use async_trait::async_trait;

use crate::error::Result;

use super::{CheckContext, ValidationResult, Validator};

/// Validates that the deployment has the nodes its topology asked for,
/// with dense zero-based indices.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeCountValidator;

#[async_trait]
impl Validator for NodeCountValidator {
    fn name(&self) -> &str {
        "node-count"
    }

    async fn validate(&self, ctx: &CheckContext) -> Result<ValidationResult> {
        let deployment = ctx.deployment();
        let expected = deployment.topology().node_count();
        let actual = deployment.nodes().len();

        if actual != expected {
            return Ok(ValidationResult::failed(format!(
                "expected {} nodes, found {}",
                expected, actual
            )));
        }

        let misplaced: Vec<usize> = deployment
            .nodes()
            .iter()
            .enumerate()
            .filter(|(i, node)| node.index() != *i)
            .map(|(i, _)| i)
            .collect();
        if !misplaced.is_empty() {
            return Ok(ValidationResult::failed(format!(
                "node indices are not dense at positions {:?}",
                misplaced
            )));
        }

        Ok(ValidationResult::passed(format!("{} nodes present", actual)))
    }
}
