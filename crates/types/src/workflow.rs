//! Strongly typed workflow and preset schema definitions shared by the engine and CLI.
//!
//! A workflow lists its steps as an ordered sequence; execution order is the
//! authoring order. A preset addresses the steps of its base workflow by name, so
//! `overrides.steps` is always a mapping. The two shapes are enforced during
//! deserialization (see [`shape`]) rather than coerced.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub mod shape;

/// Parameter and settings tables keep authoring order.
pub type ValueMap = IndexMap<String, JsonValue>;

/// Describes a complete, named, ordered pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDefinition {
    /// Workflow name used for lookups and the `{workflow_name}` binding.
    pub name: String,
    /// Optional descriptive copy shown by `list`.
    #[serde(default)]
    pub description: Option<String>,
    /// Free-form version label. Numeric YAML scalars are accepted.
    #[serde(default, deserialize_with = "deserialize_version")]
    pub version: Option<String>,
    /// Global settings (output_dir, temp_dir, parallel_jobs, quality defaults, ...).
    #[serde(default)]
    pub settings: ValueMap,
    /// Ordered steps; the order is the execution order.
    #[serde(default, deserialize_with = "shape::deserialize_step_sequence")]
    pub steps: Vec<StepDefinition>,
    /// Lifecycle hook command lists.
    #[serde(default)]
    pub hooks: WorkflowHooks,
}

/// Closed set of step kinds understood by the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    PdfExtract,
    ExcelExtract,
    Convert,
    Resize,
    Watermark,
    Ocr,
    Custom,
}

impl StepType {
    pub const ALL: [StepType; 7] = [
        StepType::PdfExtract,
        StepType::ExcelExtract,
        StepType::Convert,
        StepType::Resize,
        StepType::Watermark,
        StepType::Ocr,
        StepType::Custom,
    ];

    /// Identifier as written in definition documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::PdfExtract => "pdf_extract",
            StepType::ExcelExtract => "excel_extract",
            StepType::Convert => "convert",
            StepType::Resize => "resize",
            StepType::Watermark => "watermark",
            StepType::Ocr => "ocr",
            StepType::Custom => "custom",
        }
    }

    /// Extraction steps consume a range spec and bump `extracted_count`.
    pub fn is_extraction(&self) -> bool {
        matches!(self, StepType::PdfExtract | StepType::ExcelExtract)
    }

    /// Whether the items a step writes are images. OCR output is text.
    pub fn produces_images(&self) -> bool {
        !matches!(self, StepType::Ocr)
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        StepType::ALL
            .into_iter()
            .find(|step_type| step_type.as_str() == raw)
            .ok_or_else(|| format!("unknown step type '{raw}'"))
    }
}

/// One named unit of work within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StepDefinition {
    /// Unique name within the workflow; presets address steps by this name.
    pub name: String,
    /// Handler family executing the step.
    #[serde(rename = "type")]
    pub r#type: StepType,
    /// Optional descriptive copy.
    #[serde(default)]
    pub description: Option<String>,
    /// Boolean guard; a missing condition always holds.
    #[serde(default)]
    pub condition: Option<String>,
    /// Handler parameters; string values may contain placeholders.
    #[serde(default)]
    pub params: ValueMap,
    /// Alternate params merged over `params` when the condition is false.
    #[serde(default, rename = "else")]
    pub r#else: Option<ValueMap>,
    /// Disabled steps keep their position but never execute.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl StepDefinition {
    /// Creates an enabled step with no params.
    pub fn new(name: impl Into<String>, step_type: StepType) -> Self {
        Self {
            name: name.into(),
            r#type: step_type,
            description: None,
            condition: None,
            params: ValueMap::new(),
            r#else: None,
            enabled: true,
        }
    }
}

/// Named lists of hook command templates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct WorkflowHooks {
    #[serde(default)]
    pub pre_workflow: Vec<String>,
    #[serde(default)]
    pub post_step: Vec<String>,
    #[serde(default)]
    pub on_success: Vec<String>,
    #[serde(default)]
    pub on_failure: Vec<String>,
}

/// Lifecycle points at which hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    PreWorkflow,
    PostStep,
    OnSuccess,
    OnFailure,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::PreWorkflow => "pre_workflow",
            HookPoint::PostStep => "post_step",
            HookPoint::OnSuccess => "on_success",
            HookPoint::OnFailure => "on_failure",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WorkflowHooks {
    /// Commands registered for a lifecycle point, in authoring order.
    pub fn commands(&self, point: HookPoint) -> &[String] {
        match point {
            HookPoint::PreWorkflow => &self.pre_workflow,
            HookPoint::PostStep => &self.post_step,
            HookPoint::OnSuccess => &self.on_success,
            HookPoint::OnFailure => &self.on_failure,
        }
    }

    /// Appends `other` after the existing commands of each list.
    pub fn append(&mut self, other: &WorkflowHooks) {
        self.pre_workflow.extend(other.pre_workflow.iter().cloned());
        self.post_step.extend(other.post_step.iter().cloned());
        self.on_success.extend(other.on_success.iter().cloned());
        self.on_failure.extend(other.on_failure.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.pre_workflow.is_empty() && self.post_step.is_empty() && self.on_success.is_empty() && self.on_failure.is_empty()
    }
}

/// A named set of overrides specialising a base workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct PresetDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Name (or path) of the workflow this preset specialises.
    pub base_workflow: String,
    #[serde(default)]
    pub overrides: PresetOverrides,
}

/// Overrides applied on top of the base workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct PresetOverrides {
    /// Shallow key overwrite onto the base settings.
    #[serde(default)]
    pub settings: ValueMap,
    /// Step fragments keyed by step name. Never a sequence.
    #[serde(default, deserialize_with = "shape::deserialize_step_overrides")]
    pub steps: IndexMap<String, StepOverride>,
    /// Hook commands appended after the base hook lists.
    #[serde(default)]
    pub hooks: WorkflowHooks,
}

/// Partial step definition addressed by name from a preset.
///
/// Present fields replace (`type`, `condition`, `enabled`, `description`) or
/// deep-merge (`params`, `else`) into the base step. A fragment naming no base
/// step creates a new step and must then carry a `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct StepOverride {
    #[serde(default, rename = "type")]
    pub r#type: Option<StepType>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub params: Option<ValueMap>,
    #[serde(default, rename = "else")]
    pub r#else: Option<ValueMap>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// A workflow after preset overrides have been applied, ready to run.
///
/// Disabled steps stay in `steps` so reports can show them in position; the
/// driver only dispatches enabled ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ResolvedWorkflow {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Preset that produced this workflow, when one was applied.
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub settings: ValueMap,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub hooks: WorkflowHooks,
}

impl ResolvedWorkflow {
    /// Wraps a workflow definition used directly without a preset.
    pub fn from_definition(definition: WorkflowDefinition) -> Self {
        Self {
            name: definition.name,
            description: definition.description,
            version: definition.version,
            preset: None,
            settings: definition.settings,
            steps: definition.steps,
            hooks: definition.hooks,
        }
    }

    /// Steps the driver will consider, in execution order.
    pub fn enabled_steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.steps.iter().filter(|step| step.enabled)
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|step| step.name == name)
    }

    /// Name reported in logs and bound to `{workflow_name}`; presets report their own name.
    pub fn display_name(&self) -> &str {
        self.preset.as_deref().unwrap_or(&self.name)
    }
}

const fn default_enabled() -> bool {
    true
}

fn deserialize_version<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match raw {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
    })
}
