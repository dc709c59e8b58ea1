//! Core executor data types.

use std::time::Duration;

use imgpipe_types::{HandlerOutcome, StepDefinition, StepType};
use serde::{Deserialize, Serialize};

use crate::context::ContextSummary;

/// Where a step ended up in the per-step state machine.
///
/// `Pending → ConditionChecked → (Skipped | Dispatched) → (Succeeded | Failed)`;
/// disabled steps are reported as `Disabled` and never leave that state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    /// Not reached: the run was cancelled or stopped before this step.
    Pending,
    ConditionChecked,
    /// Condition was false and no `else` block exists.
    Skipped,
    Dispatched,
    Succeeded,
    Failed,
    Disabled,
}

impl StepPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepPhase::Pending => "pending",
            StepPhase::ConditionChecked => "condition_checked",
            StepPhase::Skipped => "skipped",
            StepPhase::Dispatched => "dispatched",
            StepPhase::Succeeded => "succeeded",
            StepPhase::Failed => "failed",
            StepPhase::Disabled => "disabled",
        }
    }
}

/// Per-step line of a [`RunResult`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepReport {
    pub name: String,
    pub step_type: StepType,
    pub phase: StepPhase,
    /// Position among evaluated steps; `None` when never evaluated.
    pub step_number: Option<u64>,
    /// Handler result, present once the step was dispatched.
    pub outcome: Option<HandlerOutcome>,
    /// The condition was false and the `else` params were used.
    pub used_else: bool,
    pub duration_ms: u64,
}

impl StepReport {
    pub fn new(step: &StepDefinition, phase: StepPhase) -> Self {
        Self {
            name: step.name.clone(),
            step_type: step.r#type,
            phase,
            step_number: None,
            outcome: None,
            used_else: false,
            duration_ms: 0,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.outcome.as_ref().and_then(|outcome| outcome.error_message.as_deref())
    }
}

/// Final state of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// Everything a caller learns about a finished run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunResult {
    pub workflow_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    pub status: RunStatus,
    pub steps: Vec<StepReport>,
    /// Enabled steps in the resolved workflow.
    pub total: u64,
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Hook commands that failed; never affects `status`.
    pub hook_failures: u64,
    pub context: ContextSummary,
    pub duration_ms: u64,
}

impl RunResult {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Process exit status for this result: 0 only on success.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Succeeded => 0,
            RunStatus::Failed => 1,
            RunStatus::Cancelled => 130,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|report| report.name == name)
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
