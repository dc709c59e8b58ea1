//! Shared type definitions for imgpipe workflows, presets, and handler results.
//!
//! Definitions deserialize strictly from authored YAML documents. Authoring order
//! of settings, params, and override keys is preserved through `IndexMap`.

use serde::{Deserialize, Serialize};

pub mod workflow;

pub use workflow::{
    HookPoint, PresetDefinition, PresetOverrides, ResolvedWorkflow, StepDefinition, StepOverride, StepType, WorkflowDefinition,
    WorkflowHooks,
};

/// Aggregated result reported by a step handler back to the driver.
///
/// Handlers that fan out internally report one outcome for the whole step; the
/// driver is the only component that folds outcomes into the run context.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandlerOutcome {
    /// Whether the step completed successfully.
    pub succeeded: bool,
    /// Number of output items (pages, images, text files) written.
    pub items_produced: u64,
    /// Total size in bytes of the written items.
    pub bytes_produced: u64,
    /// Human-readable failure reason when `succeeded` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl HandlerOutcome {
    /// Successful outcome with the produced item and byte counts.
    pub fn success(items_produced: u64, bytes_produced: u64) -> Self {
        Self {
            succeeded: true,
            items_produced,
            bytes_produced,
            error_message: None,
        }
    }

    /// Failed outcome carrying a reason.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            items_produced: 0,
            bytes_produced: 0,
            error_message: Some(message.into()),
        }
    }

    /// Failed outcome that still reports partial output.
    pub fn partial_failure(items_produced: u64, bytes_produced: u64, message: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            items_produced,
            bytes_produced,
            error_message: Some(message.into()),
        }
    }
}
