//! Preset application over a base workflow.
//!
//! Settings overwrite shallowly. Step fragments are applied in the base step
//! order: `params` and `else` deep-merge with the fragment winning per key,
//! while `type`, `description`, `condition`, and `enabled` are replaced when
//! present. Fragments naming no base step are appended as new steps in the
//! order their keys appear in the override mapping. Hook lists are appended
//! after the base lists.

use imgpipe_types::workflow::ValueMap;
use imgpipe_types::{PresetDefinition, ResolvedWorkflow, StepDefinition, StepOverride, WorkflowDefinition};
use serde_json::Value;
use tracing::debug;

use crate::errors::LoadError;

/// Applies `preset` to `base`, producing the workflow the driver will run.
pub fn apply_preset(base: WorkflowDefinition, preset: &PresetDefinition) -> Result<ResolvedWorkflow, LoadError> {
    let mut resolved = ResolvedWorkflow::from_definition(base);
    resolved.preset = Some(preset.name.clone());
    if preset.description.is_some() {
        resolved.description = preset.description.clone();
    }

    for (key, value) in &preset.overrides.settings {
        resolved.settings.insert(key.clone(), value.clone());
    }

    for step in resolved.steps.iter_mut() {
        if let Some(fragment) = preset.overrides.steps.get(&step.name) {
            debug!(preset = %preset.name, step = %step.name, "applying step override");
            apply_step_override(step, fragment);
        }
    }

    for (step_name, fragment) in &preset.overrides.steps {
        if resolved.steps.iter().any(|step| &step.name == step_name) {
            continue;
        }
        let Some(step_type) = fragment.r#type else {
            return Err(LoadError::UnknownStepOverride {
                preset: preset.name.clone(),
                step: step_name.clone(),
            });
        };
        debug!(preset = %preset.name, step = %step_name, step_type = %step_type, "appending new step");
        let mut step = StepDefinition::new(step_name.clone(), step_type);
        apply_step_override(&mut step, fragment);
        resolved.steps.push(step);
    }

    resolved.hooks.append(&preset.overrides.hooks);
    Ok(resolved)
}

/// Merges one override fragment into a step in place.
pub fn apply_step_override(step: &mut StepDefinition, fragment: &StepOverride) {
    if let Some(step_type) = fragment.r#type {
        step.r#type = step_type;
    }
    if let Some(description) = &fragment.description {
        step.description = Some(description.clone());
    }
    if let Some(condition) = &fragment.condition {
        step.condition = Some(condition.clone());
    }
    if let Some(enabled) = fragment.enabled {
        step.enabled = enabled;
    }
    if let Some(params) = &fragment.params {
        step.params = merge_value_maps(&step.params, params);
    }
    if let Some(alternate) = &fragment.r#else {
        step.r#else = Some(match &step.r#else {
            Some(existing) => merge_value_maps(existing, alternate),
            None => alternate.clone(),
        });
    }
}

/// Deep-merges `overlay` onto `base`; overlay values win on conflict and
/// nested mappings merge recursively.
pub fn merge_value_maps(base: &ValueMap, overlay: &ValueMap) -> ValueMap {
    let mut merged = base.clone();
    for (key, value) in overlay {
        match merged.get_mut(key) {
            Some(existing) => deep_merge(existing, value),
            None => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

fn deep_merge(target: &mut Value, overlay: &Value) {
    match (target, overlay) {
        (Value::Object(target_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match target_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, overlay) => *target = overlay.clone(),
    }
}
