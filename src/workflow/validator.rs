//! Workflow Validation
//!
//! Structural checks run right after a document is parsed:
//! - Node names are present, unique and not reserved
//! - Each step type carries the fields it needs
//! - Nested steps (foreach bodies, parallel children) are checked too
//! - Flow modules point at a document path
//! - Conditions parse and function fields call a known built-in
//!
//! Reference checks (`depends_on`, decision targets, cycles) belong to
//! the graph builder.

use std::collections::HashSet;

use log::{debug, info, warn};

use super::expression;
use super::model::{DocumentKind, ModuleRef, StepRunner, StepSpec, StepType, WorkflowDocument, END_TARGET};
use crate::error::{Result, WorkflowError};

/// Validates a parsed document, failing on the first problem found.
///
/// Steps are checked in declaration order so the reported problem is
/// deterministic.
pub fn validate_document(document: &WorkflowDocument) -> Result<()> {
    info!("Validating {} '{}'", document.kind, document.name);

    validate_params(document)?;

    match document.kind {
        DocumentKind::Module => {
            if document.steps.is_empty() {
                return Err(WorkflowError::schema(Some(&document.name), "module has no steps"));
            }
            if !document.modules.is_empty() {
                warn!("Module '{}' declares 'modules'; they are ignored", document.name);
            }
            let mut seen = HashSet::new();
            for step in &document.steps {
                if !seen.insert(step.name.as_str()) {
                    return Err(WorkflowError::schema(
                        Some(&step.name),
                        format!("duplicate step name '{}'", step.name),
                    ));
                }
                validate_step(step)?;
            }
        }
        DocumentKind::Flow => {
            if document.modules.is_empty() {
                return Err(WorkflowError::schema(Some(&document.name), "flow has no modules"));
            }
            if !document.steps.is_empty() {
                warn!("Flow '{}' declares 'steps'; they are ignored", document.name);
            }
            let mut seen = HashSet::new();
            for module in &document.modules {
                if !seen.insert(module.name.as_str()) {
                    return Err(WorkflowError::schema(
                        Some(&module.name),
                        format!("duplicate module name '{}'", module.name),
                    ));
                }
                validate_module_ref(module)?;
            }
        }
    }

    info!("Document '{}' validated: {} nodes", document.name, document.len());
    Ok(())
}

fn validate_params(document: &WorkflowDocument) -> Result<()> {
    let mut seen = HashSet::new();
    for param in &document.params {
        if param.name.trim().is_empty() {
            return Err(WorkflowError::schema(Some(&document.name), "parameter with empty name"));
        }
        if !seen.insert(param.name.as_str()) {
            return Err(WorkflowError::schema(
                Some(&document.name),
                format!("duplicate parameter '{}'", param.name),
            ));
        }
        if param.required && param.default.is_some() {
            warn!(
                "Parameter '{}' is required; its default is ignored",
                param.name
            );
        }
    }
    Ok(())
}

fn validate_node_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(WorkflowError::schema(None, "node has an empty name"));
    }
    if name == END_TARGET {
        return Err(WorkflowError::schema(
            Some(name),
            format!("'{}' is reserved for decision targets", END_TARGET),
        ));
    }
    Ok(())
}

/// Rejects conditions that can never parse. Placeholders are bound as
/// values, so templated conditions are checked too.
fn validate_expression(node: &str, field: &str, source: &str) -> Result<()> {
    expression::check(source).map_err(|e| {
        WorkflowError::schema(Some(node), format!("invalid {} '{}': {}", field, source, e))
    })
}

fn validate_call(node: &str, source: &str) -> Result<()> {
    expression::check_call(source).map_err(|e| {
        WorkflowError::schema(Some(node), format!("invalid function call '{}': {}", source, e))
    })
}

/// Validates a single step and its nested steps.
pub fn validate_step(step: &StepSpec) -> Result<()> {
    validate_node_name(&step.name)?;
    let fail = |message: &str| Err(WorkflowError::schema(Some(&step.name), message));

    match step.step_type {
        StepType::Bash | StepType::RemoteBash => {
            let has_command = step.command.as_deref().is_some_and(|c| !c.trim().is_empty())
                || !step.commands.is_empty()
                || !step.parallel_commands.is_empty();
            if !has_command {
                return fail("needs 'command', 'commands' or 'parallel_commands'");
            }
            if step.step_type == StepType::RemoteBash {
                if step.step_runner != Some(StepRunner::Docker) {
                    return fail("remote-bash needs 'step_runner: docker'");
                }
                let has_image = step
                    .step_runner_config
                    .as_ref()
                    .and_then(|c| c.image.as_deref())
                    .is_some_and(|i| !i.trim().is_empty());
                if !has_image {
                    return fail("remote-bash needs 'step_runner_config.image'");
                }
            }
        }
        StepType::Function => {
            let has_function = step.function.as_deref().is_some_and(|f| !f.trim().is_empty())
                || !step.functions.is_empty()
                || !step.parallel_functions.is_empty();
            if !has_function {
                return fail("needs 'function', 'functions' or 'parallel_functions'");
            }
        }
        StepType::Foreach => {
            if step.input.as_deref().map_or(true, |i| i.trim().is_empty()) {
                return fail("foreach needs 'input'");
            }
            if step.variable.as_deref().map_or(true, |v| v.trim().is_empty()) {
                return fail("foreach needs 'variable'");
            }
            if step.step.is_none() {
                return fail("foreach needs a nested 'step'");
            }
        }
        StepType::ParallelSteps => {
            if step.parallel_steps.is_empty() {
                return fail("parallel-steps needs a non-empty 'parallel_steps'");
            }
        }
    }

    if step.step_runner == Some(StepRunner::Docker) && step.step_type == StepType::Bash {
        debug!("Step '{}' declares a docker runner but runs as local bash", step.name);
    }

    if let Some(condition) = &step.pre_condition {
        validate_expression(&step.name, "pre_condition", condition)?;
    }
    for rule in &step.decision {
        validate_expression(&step.name, "decision condition", &rule.condition)?;
    }
    let calls = step
        .function
        .iter()
        .chain(&step.functions)
        .chain(&step.parallel_functions);
    for call in calls {
        validate_call(&step.name, call)?;
    }

    for nested in step.nested_steps() {
        validate_step(nested)?;
    }

    Ok(())
}

fn validate_module_ref(module: &ModuleRef) -> Result<()> {
    validate_node_name(&module.name)?;
    if module.path.trim().is_empty() {
        return Err(WorkflowError::schema(Some(&module.name), "module needs a 'path'"));
    }
    if module.depends_on.iter().any(|d| d == &module.name) {
        return Err(WorkflowError::CyclicDependency {
            cycle: vec![module.name.clone(), module.name.clone()],
        });
    }
    if let Some(condition) = &module.condition {
        validate_expression(&module.name, "condition", condition)?;
    }
    for rule in &module.decision {
        validate_expression(&module.name, "decision condition", &rule.condition)?;
    }
    Ok(())
}

/// Collects every problem instead of stopping at the first.
///
/// Useful for `--validate` output.
pub fn quick_validate(document: &WorkflowDocument) -> Vec<String> {
    let mut errors = Vec::new();

    if let Err(e) = validate_params(document) {
        errors.push(e.to_string());
    }

    match document.kind {
        DocumentKind::Module => {
            if document.steps.is_empty() {
                errors.push("module has no steps".to_string());
            }
            let mut seen = HashSet::new();
            for step in &document.steps {
                if !seen.insert(step.name.as_str()) {
                    errors.push(format!("duplicate step name '{}'", step.name));
                }
                if let Err(e) = validate_step(step) {
                    errors.push(e.to_string());
                }
            }
        }
        DocumentKind::Flow => {
            if document.modules.is_empty() {
                errors.push("flow has no modules".to_string());
            }
            let mut seen = HashSet::new();
            for module in &document.modules {
                if !seen.insert(module.name.as_str()) {
                    errors.push(format!("duplicate module name '{}'", module.name));
                }
                if let Err(e) = validate_module_ref(module) {
                    errors.push(e.to_string());
                }
            }
        }
    }

    errors
}
