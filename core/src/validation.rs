use std::collections::{BTreeMap, BTreeSet};

use crate::{
    config::ValidationLevel,
    error::{PmError, Result},
    models::FlowReference,
};

/// A non-fatal finding produced by smart validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFinding {
    pub reference: String,
    pub message: String,
}

/// Resolvable flow surface used to check references: flow id -> the step ids
/// declared for it. Built by the flow index; kept as plain data here so the
/// check needs no I/O.
#[derive(Debug, Clone, Default)]
pub struct FlowCatalog {
    steps_by_flow: BTreeMap<String, BTreeSet<String>>,
    files_by_flow: BTreeMap<String, String>,
}

impl FlowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_flow(
        &mut self,
        flow_id: &str,
        flow_file: &str,
        step_ids: impl IntoIterator<Item = String>,
    ) {
        self.steps_by_flow
            .insert(flow_id.to_string(), step_ids.into_iter().collect());
        self.files_by_flow
            .insert(flow_id.to_string(), flow_file.to_string());
    }

    pub fn contains_flow(&self, flow_id: &str) -> bool {
        self.steps_by_flow.contains_key(flow_id)
    }

    pub fn contains_step(&self, flow_id: &str, step_id: &str) -> bool {
        self.steps_by_flow
            .get(flow_id)
            .map(|steps| steps.contains(step_id))
            .unwrap_or(false)
    }

    pub fn flow_file(&self, flow_id: &str) -> Option<&str> {
        self.files_by_flow.get(flow_id).map(String::as_str)
    }
}

/// Validator for flow references on subtasks and cross-flow step
/// dependencies.
///
/// Behavior by level: `Smart` (default) reports unresolved references as
/// findings and lets the operation proceed; `Strict` fails the operation
/// with `UnknownFlowReference`; `Disabled` checks nothing.
pub struct FlowRefValidator;

impl FlowRefValidator {
    /// Validate a set of flow references against the catalog.
    ///
    /// Returns the findings collected in smart mode (empty in disabled
    /// mode or when everything resolves).
    pub fn validate(
        level: ValidationLevel,
        catalog: &FlowCatalog,
        references: &[FlowReference],
    ) -> Result<Vec<ValidationFinding>> {
        if level == ValidationLevel::Disabled {
            return Ok(Vec::new());
        }

        let mut findings = Vec::new();

        for reference in references {
            if !catalog.contains_flow(&reference.flow_id) {
                Self::report(
                    level,
                    &mut findings,
                    &reference.flow_id,
                    format!("flow '{}' is not in the flow index", reference.flow_id),
                )?;
                continue;
            }

            if let Some(known_file) = catalog.flow_file(&reference.flow_id) {
                if known_file != reference.flow_file {
                    Self::report(
                        level,
                        &mut findings,
                        &reference.flow_id,
                        format!(
                            "flow '{}' lives in '{}', reference names '{}'",
                            reference.flow_id, known_file, reference.flow_file
                        ),
                    )?;
                }
            }

            for step_id in &reference.step_ids {
                if !catalog.contains_step(&reference.flow_id, step_id) {
                    Self::report(
                        level,
                        &mut findings,
                        &format!("{}:{}", reference.flow_id, step_id),
                        format!(
                            "step '{}' does not exist in flow '{}'",
                            step_id, reference.flow_id
                        ),
                    )?;
                }
            }
        }

        Ok(findings)
    }

    /// Validate a cross-flow step dependency of the form `flow-id:step-id`
    /// (or a bare step id, which the caller resolves locally).
    pub fn validate_cross_flow_dep(
        level: ValidationLevel,
        catalog: &FlowCatalog,
        dependency: &str,
    ) -> Result<Option<ValidationFinding>> {
        if level == ValidationLevel::Disabled {
            return Ok(None);
        }
        let Some((flow_id, step_id)) = dependency.split_once(':') else {
            return Ok(None);
        };

        if catalog.contains_step(flow_id, step_id) {
            return Ok(None);
        }

        let finding = ValidationFinding {
            reference: dependency.to_string(),
            message: format!("cross-flow dependency '{dependency}' does not resolve"),
        };
        if level == ValidationLevel::Strict {
            return Err(PmError::UnknownFlowReference(finding.reference));
        }
        Ok(Some(finding))
    }

    fn report(
        level: ValidationLevel,
        findings: &mut Vec<ValidationFinding>,
        reference: &str,
        message: String,
    ) -> Result<()> {
        if level == ValidationLevel::Strict {
            return Err(PmError::UnknownFlowReference(reference.to_string()));
        }
        findings.push(ValidationFinding {
            reference: reference.to_string(),
            message,
        });
        Ok(())
    }
}
