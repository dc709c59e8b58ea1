//! Error taxonomy for definition loading, validation, and run setup.
//!
//! Step failures are not errors: they are recorded in the run context and the
//! step report. These types cover problems that stop a run from starting.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors raised while locating, parsing, or merging definition documents.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read definition '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse definition '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid definition shape in '{path}': {reason}")]
    InvalidShape { path: PathBuf, reason: String },

    #[error("definition '{reference}' not found (searched: {searched})")]
    NotFound { reference: String, searched: String },

    #[error("'{reference}' is a preset; a workflow document was expected")]
    NotAWorkflow { reference: String },

    #[error("preset '{preset}' references base workflow '{base}' which could not be loaded: {source}")]
    MissingBaseWorkflow {
        preset: String,
        base: String,
        #[source]
        source: Box<LoadError>,
    },

    #[error("preset '{preset}' overrides unknown step '{step}' without a 'type' to create it")]
    UnknownStepOverride { preset: String, step: String },

    #[error("workflow '{workflow}' declares step '{step}' more than once")]
    DuplicateStep { workflow: String, step: String },

    #[error("workflow '{workflow}' has an empty step name at position {position}")]
    EmptyStepName { workflow: String, position: usize },

    #[error("workflow '{workflow}' step '{step}': {source}")]
    InvalidStep {
        workflow: String,
        step: String,
        #[source]
        source: ValidationError,
    },

    #[error("workflow '{workflow}' {point} hook '{command}': {source}")]
    InvalidHook {
        workflow: String,
        point: String,
        command: String,
        #[source]
        source: ValidationError,
    },

    #[error("workflow '{workflow}' settings: {source}")]
    InvalidSettings {
        workflow: String,
        #[source]
        source: ValidationError,
    },
}

impl LoadError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn invalid_shape(path: &Path, reason: impl Into<String>) -> Self {
        Self::InvalidShape {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn invalid_step(workflow: &str, step: &str, source: ValidationError) -> Self {
        Self::InvalidStep {
            workflow: workflow.to_string(),
            step: step.to_string(),
            source,
        }
    }
}

/// Malformed ranges, conditions, format specs, or setting values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid range '{spec}': {reason}")]
    Range { spec: String, reason: String },

    #[error("invalid condition '{expression}': {reason}")]
    Condition { expression: String, reason: String },

    #[error("invalid format spec '{spec}' for placeholder '{name}': {reason}")]
    FormatSpec { name: String, spec: String, reason: String },

    #[error("invalid setting '{key}': {reason}")]
    Setting { key: String, reason: String },
}

impl ValidationError {
    pub fn range(spec: &str, reason: impl Into<String>) -> Self {
        Self::Range {
            spec: spec.to_string(),
            reason: reason.into(),
        }
    }

    pub fn condition(expression: &str, reason: impl Into<String>) -> Self {
        Self::Condition {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }

    pub fn format_spec(name: &str, spec: &str, reason: impl Into<String>) -> Self {
        Self::FormatSpec {
            name: name.to_string(),
            spec: spec.to_string(),
            reason: reason.into(),
        }
    }

    pub fn setting(key: &str, reason: impl Into<String>) -> Self {
        Self::Setting {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors loading the engine configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Everything that can stop [`crate::Engine::run`] before or outside step execution.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to prepare directory '{path}': {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
