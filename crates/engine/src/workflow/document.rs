//! Definition documents on disk: parsing, lookup, and listing.
//!
//! A document carrying a `base_workflow` key is a preset; any other document is
//! a workflow. References are either paths to existing files or bare names
//! looked up as `<dir>/<name>.yaml` then `<dir>/<name>.yml`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use imgpipe_types::workflow::shape::{OVERRIDE_STEPS_SHAPE_MESSAGE, STEPS_SHAPE_MESSAGE};
use imgpipe_types::{PresetDefinition, ResolvedWorkflow, WorkflowDefinition};
use imgpipe_util::expand_tilde;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EngineConfig;
use crate::errors::LoadError;
use crate::workflow::merge::apply_preset;
use crate::workflow::validation::validate_resolved_workflow;

const DEFINITION_EXTENSIONS: [&str; 2] = ["yaml", "yml"];
const PRESET_MARKER_KEY: &str = "base_workflow";

/// Whether a document is a workflow or a preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionKind {
    Workflow,
    Preset,
}

impl fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DefinitionKind::Workflow => "workflow",
            DefinitionKind::Preset => "preset",
        })
    }
}

/// A parsed definition document.
#[derive(Debug, Clone, PartialEq)]
pub enum DefinitionDocument {
    Workflow(WorkflowDefinition),
    Preset(PresetDefinition),
}

impl DefinitionDocument {
    pub fn kind(&self) -> DefinitionKind {
        match self {
            DefinitionDocument::Workflow(_) => DefinitionKind::Workflow,
            DefinitionDocument::Preset(_) => DefinitionKind::Preset,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            DefinitionDocument::Workflow(workflow) => &workflow.name,
            DefinitionDocument::Preset(preset) => &preset.name,
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            DefinitionDocument::Workflow(workflow) => workflow.description.as_deref(),
            DefinitionDocument::Preset(preset) => preset.description.as_deref(),
        }
    }
}

/// What the caller asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTarget {
    /// Path or name; presets are looked up before workflows.
    Auto(String),
    Workflow(String),
    Preset(String),
}

impl RunTarget {
    pub fn reference(&self) -> &str {
        match self {
            RunTarget::Auto(reference) | RunTarget::Workflow(reference) | RunTarget::Preset(reference) => reference,
        }
    }
}

impl From<&str> for RunTarget {
    fn from(reference: &str) -> Self {
        RunTarget::Auto(reference.to_string())
    }
}

/// One entry of [`DefinitionLoader::list_definitions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DefinitionSummary {
    pub name: String,
    pub description: Option<String>,
    pub kind: DefinitionKind,
    pub path: PathBuf,
}

/// Parses a definition document from text. `path` is only used in errors.
pub fn parse_definition_str(content: &str, path: &Path) -> Result<DefinitionDocument, LoadError> {
    let value: serde_yaml::Value = serde_yaml::from_str(content).map_err(|source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let Some(mapping) = value.as_mapping() else {
        return Err(LoadError::invalid_shape(path, "a definition document must be a mapping"));
    };

    let is_preset = mapping.contains_key(PRESET_MARKER_KEY);
    let document = if is_preset {
        serde_yaml::from_value(value).map(DefinitionDocument::Preset)
    } else {
        serde_yaml::from_value(value).map(DefinitionDocument::Workflow)
    };
    document.map_err(|source| classify_parse_error(path, source))
}

/// Reads and parses a definition file.
pub fn load_definition_file(path: &Path) -> Result<DefinitionDocument, LoadError> {
    let content = fs::read_to_string(path).map_err(|source| LoadError::io(path, source))?;
    parse_definition_str(&content, path)
}

fn classify_parse_error(path: &Path, source: serde_yaml::Error) -> LoadError {
    let message = source.to_string();
    for shape_message in [STEPS_SHAPE_MESSAGE, OVERRIDE_STEPS_SHAPE_MESSAGE] {
        if message.contains(shape_message) {
            return LoadError::invalid_shape(path, shape_message);
        }
    }
    LoadError::Parse {
        path: path.to_path_buf(),
        source,
    }
}

/// Locates, loads, merges, and validates definitions.
#[derive(Debug, Clone)]
pub struct DefinitionLoader {
    workflows_dir: PathBuf,
    presets_dir: PathBuf,
}

impl DefinitionLoader {
    pub fn new(workflows_dir: impl Into<PathBuf>, presets_dir: impl Into<PathBuf>) -> Self {
        Self {
            workflows_dir: workflows_dir.into(),
            presets_dir: presets_dir.into(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.workflows_dir.clone(), config.presets_dir.clone())
    }

    /// Loads `target`, applies a preset when one was named, and validates
    /// the result.
    pub fn resolve(&self, target: &RunTarget) -> Result<ResolvedWorkflow, LoadError> {
        let resolved = match target {
            RunTarget::Workflow(reference) => ResolvedWorkflow::from_definition(self.load_workflow(reference)?),
            RunTarget::Preset(reference) => {
                let path = self.locate(reference, &[&self.presets_dir])?;
                match load_definition_file(&path)? {
                    DefinitionDocument::Preset(preset) => self.resolve_preset(&preset, &path)?,
                    DefinitionDocument::Workflow(_) => {
                        return Err(LoadError::NotFound {
                            reference: reference.clone(),
                            searched: format!("{} (found a workflow, not a preset)", path.display()),
                        });
                    }
                }
            }
            RunTarget::Auto(reference) => {
                let path = self.locate(reference, &[&self.presets_dir, &self.workflows_dir])?;
                match load_definition_file(&path)? {
                    DefinitionDocument::Preset(preset) => self.resolve_preset(&preset, &path)?,
                    DefinitionDocument::Workflow(workflow) => ResolvedWorkflow::from_definition(workflow),
                }
            }
        };

        validate_resolved_workflow(&resolved)?;
        debug!(
            workflow = %resolved.name,
            preset = resolved.preset.as_deref().unwrap_or("-"),
            steps = resolved.steps.len(),
            "resolved workflow"
        );
        Ok(resolved)
    }

    /// Loads a workflow document by path or name.
    pub fn load_workflow(&self, reference: &str) -> Result<WorkflowDefinition, LoadError> {
        let path = self.locate(reference, &[&self.workflows_dir])?;
        match load_definition_file(&path)? {
            DefinitionDocument::Workflow(workflow) => Ok(workflow),
            DefinitionDocument::Preset(_) => Err(LoadError::NotAWorkflow {
                reference: reference.to_string(),
            }),
        }
    }

    /// Applies `preset` over its base workflow. The base is looked up next to
    /// the preset file first, then in the workflows directory.
    pub fn resolve_preset(&self, preset: &PresetDefinition, preset_path: &Path) -> Result<ResolvedWorkflow, LoadError> {
        let sibling_dir = preset_path.parent().map(Path::to_path_buf).unwrap_or_default();
        let base_reference = preset.base_workflow.trim();
        let base = self
            .locate(base_reference, &[&sibling_dir, &self.workflows_dir])
            .and_then(|path| match load_definition_file(&path)? {
                DefinitionDocument::Workflow(workflow) => Ok(workflow),
                DefinitionDocument::Preset(_) => Err(LoadError::NotAWorkflow {
                    reference: base_reference.to_string(),
                }),
            })
            .map_err(|source| LoadError::MissingBaseWorkflow {
                preset: preset.name.clone(),
                base: base_reference.to_string(),
                source: Box::new(source),
            })?;
        apply_preset(base, preset)
    }

    /// Finds the file for `reference`: an existing path, or a name in `dirs`.
    pub fn locate(&self, reference: &str, dirs: &[&PathBuf]) -> Result<PathBuf, LoadError> {
        let direct = expand_tilde(reference);
        if direct.is_file() {
            return Ok(direct);
        }
        if direct.is_relative() && direct.components().count() > 1 {
            for dir in dirs {
                let joined = dir.join(&direct);
                if joined.is_file() {
                    return Ok(joined);
                }
            }
        }

        let mut searched = Vec::new();
        for dir in dirs {
            for extension in DEFINITION_EXTENSIONS {
                let candidate = dir.join(format!("{reference}.{extension}"));
                if candidate.is_file() {
                    return Ok(candidate);
                }
                searched.push(candidate.display().to_string());
            }
        }
        Err(LoadError::NotFound {
            reference: reference.to_string(),
            searched: searched.join(", "),
        })
    }

    /// Every readable definition in the presets and workflows directories,
    /// sorted by name then kind. Unparseable files are skipped with a debug log.
    pub fn list_definitions(&self) -> Result<Vec<DefinitionSummary>, LoadError> {
        let mut summaries = Vec::new();
        for dir in [&self.workflows_dir, &self.presets_dir] {
            if !dir.is_dir() {
                continue;
            }
            let entries = fs::read_dir(dir).map_err(|source| LoadError::io(dir, source))?;
            for entry in entries.flatten() {
                let path = entry.path();
                if !has_definition_extension(&path) {
                    continue;
                }
                match load_definition_file(&path) {
                    Ok(document) => summaries.push(DefinitionSummary {
                        name: document.name().to_string(),
                        description: document.description().map(str::to_string),
                        kind: document.kind(),
                        path,
                    }),
                    Err(error) => debug!(path = %path.display(), error = %error, "skipping unreadable definition"),
                }
            }
        }
        summaries.sort_by(|left, right| {
            left.name
                .cmp(&right.name)
                .then_with(|| (left.kind as u8).cmp(&(right.kind as u8)))
        });
        summaries.dedup_by(|left, right| left.path == right.path);
        Ok(summaries)
    }
}

fn has_definition_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| DEFINITION_EXTENSIONS.contains(&extension))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use imgpipe_types::StepType;
    use serde_json::json;

    use super::*;

    const BASE_WORKFLOW: &str = r#"
name: scan
description: Extract and shrink
settings:
  output_dir: ./out
steps:
  - name: extract
    type: pdf_extract
    params:
      pages: "1-"
  - name: shrink
    type: resize
    params:
      width: 300
      height: 200
"#;

    const THUMBS_PRESET: &str = r#"
name: thumbs
description: Tiny thumbnails
base_workflow: scan
overrides:
  steps:
    shrink:
      params:
        width: 150
"#;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).expect("write definition");
        path
    }

    fn layout() -> (tempfile::TempDir, DefinitionLoader) {
        let root = tempfile::tempdir().expect("tempdir");
        let workflows = root.path().join("workflows");
        let presets = root.path().join("presets");
        fs::create_dir_all(&workflows).expect("workflows dir");
        fs::create_dir_all(&presets).expect("presets dir");
        write(&workflows, "scan.yaml", BASE_WORKFLOW);
        write(&presets, "thumbs.yml", THUMBS_PRESET);
        let loader = DefinitionLoader::new(workflows, presets);
        (root, loader)
    }

    #[test]
    fn detects_document_kind() {
        let workflow = parse_definition_str(BASE_WORKFLOW, Path::new("scan.yaml")).expect("workflow");
        assert_eq!(workflow.kind(), DefinitionKind::Workflow);
        let preset = parse_definition_str(THUMBS_PRESET, Path::new("thumbs.yaml")).expect("preset");
        assert_eq!(preset.kind(), DefinitionKind::Preset);
        assert_eq!(preset.name(), "thumbs");
    }

    #[test]
    fn preset_with_sequence_overrides_is_a_load_error() {
        let yaml_text = r#"
name: broken
base_workflow: scan
overrides:
  steps:
    - name: shrink
      params: { width: 150 }
"#;
        let error = parse_definition_str(yaml_text, Path::new("broken.yaml")).expect_err("shape error");
        assert!(matches!(error, LoadError::InvalidShape { .. }), "unexpected: {error}");
    }

    #[test]
    fn workflow_with_mapping_steps_is_a_load_error() {
        let yaml_text = r#"
name: broken
steps:
  extract:
    type: pdf_extract
"#;
        let error = parse_definition_str(yaml_text, Path::new("broken.yaml")).expect_err("shape error");
        assert!(matches!(error, LoadError::InvalidShape { .. }));
    }

    #[test]
    fn resolves_preset_by_name_with_merge() {
        let (_root, loader) = layout();
        let resolved = loader.resolve(&RunTarget::Auto("thumbs".into())).expect("resolve preset");
        assert_eq!(resolved.name, "scan");
        assert_eq!(resolved.preset.as_deref(), Some("thumbs"));
        let shrink = resolved.step("shrink").expect("shrink");
        assert_eq!(shrink.params["width"], json!(150));
        assert_eq!(shrink.params["height"], json!(200));
        assert_eq!(resolved.steps[0].r#type, StepType::PdfExtract);
    }

    #[test]
    fn resolves_workflow_by_path() {
        let (root, loader) = layout();
        let path = root.path().join("workflows").join("scan.yaml");
        let resolved = loader
            .resolve(&RunTarget::Auto(path.display().to_string()))
            .expect("resolve path");
        assert!(resolved.preset.is_none());
        assert_eq!(resolved.steps.len(), 2);
    }

    #[test]
    fn missing_base_workflow_fails() {
        let (root, loader) = layout();
        write(
            &root.path().join("presets"),
            "orphan.yaml",
            "name: orphan\nbase_workflow: nowhere\n",
        );
        let error = loader.resolve(&RunTarget::Preset("orphan".into())).expect_err("missing base");
        assert!(matches!(error, LoadError::MissingBaseWorkflow { ref base, .. } if base == "nowhere"));
    }

    #[test]
    fn workflow_target_rejects_preset_document() {
        let (root, loader) = layout();
        let preset_path = root.path().join("presets").join("thumbs.yml");
        let error = loader.load_workflow(&preset_path.display().to_string()).expect_err("not a workflow");
        assert!(matches!(error, LoadError::NotAWorkflow { .. }));
    }

    #[test]
    fn unknown_reference_lists_searched_paths() {
        let (_root, loader) = layout();
        let error = loader.resolve(&RunTarget::Workflow("ghost".into())).expect_err("not found");
        let message = error.to_string();
        assert!(message.contains("ghost.yaml") && message.contains("ghost.yml"), "{message}");
    }

    #[test]
    fn lists_definitions_sorted_by_name() {
        let (root, loader) = layout();
        write(&root.path().join("workflows"), "archive.yaml", "name: archive\nsteps: []\n");
        write(&root.path().join("workflows"), "notes.txt", "ignored");
        let names: Vec<(String, DefinitionKind)> = loader
            .list_definitions()
            .expect("list")
            .into_iter()
            .map(|summary| (summary.name, summary.kind))
            .collect();
        assert_eq!(
            names,
            vec![
                ("archive".to_string(), DefinitionKind::Workflow),
                ("scan".to_string(), DefinitionKind::Workflow),
                ("thumbs".to_string(), DefinitionKind::Preset),
            ]
        );
    }
}
