//! Load-time checks on a resolved workflow.
//!
//! Everything that can be checked before a run starts is checked here so that
//! a malformed definition aborts before any step executes.

use std::collections::HashSet;

use imgpipe_types::{HookPoint, ResolvedWorkflow, StepDefinition};
use serde_json::Value;

use crate::errors::{LoadError, ValidationError};
use crate::range::RangeSpec;
use crate::templates::{contains_placeholder, validate_template, validate_value_templates};
use crate::workflow::condition_syntax::validate_condition_expression;

/// Param keys holding range specs.
pub const RANGE_PARAM_KEYS: [&str; 2] = ["pages", "items"];

/// Validates step names, conditions, ranges, and template format specs.
pub fn validate_resolved_workflow(workflow: &ResolvedWorkflow) -> Result<(), LoadError> {
    let workflow_name = workflow.display_name();
    let mut seen = HashSet::new();

    for (position, step) in workflow.steps.iter().enumerate() {
        if step.name.trim().is_empty() {
            return Err(LoadError::EmptyStepName {
                workflow: workflow_name.to_string(),
                position: position + 1,
            });
        }
        if !seen.insert(step.name.as_str()) {
            return Err(LoadError::DuplicateStep {
                workflow: workflow_name.to_string(),
                step: step.name.clone(),
            });
        }
        validate_step(step).map_err(|error| LoadError::invalid_step(workflow_name, &step.name, error))?;
    }

    for point in [
        HookPoint::PreWorkflow,
        HookPoint::PostStep,
        HookPoint::OnSuccess,
        HookPoint::OnFailure,
    ] {
        for command in workflow.hooks.commands(point) {
            validate_template(command).map_err(|source| LoadError::InvalidHook {
                workflow: workflow_name.to_string(),
                point: point.to_string(),
                command: command.clone(),
                source,
            })?;
        }
    }

    for value in workflow.settings.values() {
        validate_value_templates(value).map_err(|source| LoadError::InvalidSettings {
            workflow: workflow_name.to_string(),
            source,
        })?;
    }

    Ok(())
}

/// Validates one step's condition, params, and `else` block.
pub fn validate_step(step: &StepDefinition) -> Result<(), ValidationError> {
    if let Some(condition) = step.condition.as_deref() {
        validate_condition_expression(condition)?;
    }
    for params in std::iter::once(&step.params).chain(step.r#else.as_ref()) {
        for (key, value) in params {
            if RANGE_PARAM_KEYS.contains(&key.as_str()) {
                validate_range_param(value)?;
            }
            validate_value_templates(value)?;
        }
    }
    Ok(())
}

/// Reads a range param as text; numbers are accepted as single positions.
pub fn range_param_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn validate_range_param(value: &Value) -> Result<(), ValidationError> {
    let Some(text) = range_param_text(value) else {
        return Err(ValidationError::range(&value.to_string(), "expected a range string"));
    };
    if text.eq_ignore_ascii_case("all") || contains_placeholder(&text) {
        return Ok(());
    }
    RangeSpec::parse(&text).map(|_| ())
}
