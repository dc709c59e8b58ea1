//! Execution engine: drives a resolved workflow step by step against one
//! [`ExecutionContext`], dispatching each step to its handler and running
//! lifecycle hooks around the loop.
//!
//! - `runner::CommandRunner` abstracts how external programs are executed
//! - `control` carries cancel requests into a running loop
//! - `step_once` holds the per-step state machine
//! - `hooks` runs lifecycle hook commands

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use imgpipe_types::workflow::ValueMap;
use imgpipe_types::{HookPoint, ResolvedWorkflow};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

use crate::config::{EngineConfig, RunSettings, apply_overrides};
use crate::context::ExecutionContext;
use crate::errors::EngineError;
use crate::handlers::HandlerRegistry;
use crate::workflow::document::{DefinitionLoader, RunTarget};
use crate::workflow::validation::validate_resolved_workflow;

pub mod control;
pub mod hooks;
pub mod runner;
mod step_once;
pub mod types;

pub use control::{ControlState, RunControl, RunController, control_channel};
pub use hooks::HookRunner;
pub use runner::{CommandOutput, CommandRunner, CommandSpec, DryRunRunner, ProcessCommandRunner};
pub use types::{RunResult, RunStatus, StepPhase, StepReport};

use step_once::{StepEnvironment, run_step};
use types::millis;

/// Programmatic entry point: resolves definitions and runs them.
#[derive(Clone)]
pub struct Engine {
    config: EngineConfig,
    handlers: HandlerRegistry,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(config: EngineConfig, handlers: HandlerRegistry, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, handlers, runner }
    }

    /// Built-in handlers spawning real processes.
    pub fn with_defaults(config: EngineConfig) -> Self {
        Self::new(config, HandlerRegistry::standard(), Arc::new(ProcessCommandRunner))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Loader rooted at the configured definition directories.
    pub fn loader(&self) -> DefinitionLoader {
        DefinitionLoader::from_config(&self.config)
    }

    /// Resolves `target` and runs it over `input`.
    ///
    /// `overrides` win over the resolved workflow settings.
    pub fn run(&self, target: &RunTarget, input: &Path, overrides: &ValueMap) -> Result<RunResult, EngineError> {
        self.run_with_control(target, input, overrides, None)
    }

    pub fn run_with_control(
        &self,
        target: &RunTarget,
        input: &Path,
        overrides: &ValueMap,
        control: Option<UnboundedReceiver<RunControl>>,
    ) -> Result<RunResult, EngineError> {
        let workflow = self.loader().resolve(target)?;
        self.execute(&workflow, input, overrides, control)
    }

    /// Runs an already resolved workflow.
    ///
    /// Returns `Err` only when the run cannot start. Step failures, including
    /// params that become invalid once their placeholders are filled in, are
    /// reported in the [`RunResult`].
    pub fn execute(
        &self,
        workflow: &ResolvedWorkflow,
        input: &Path,
        overrides: &ValueMap,
        control: Option<UnboundedReceiver<RunControl>>,
    ) -> Result<RunResult, EngineError> {
        validate_resolved_workflow(workflow)?;
        let started_at = Instant::now();
        let settings = apply_overrides(&workflow.settings, overrides);

        let mut context = ExecutionContext::new(&workflow.name, input, self.config.counter_width);
        let run_settings = RunSettings::resolve(&settings, &self.config, &context.static_bindings())?;
        context.counter_width = run_settings.counter_width;
        for directory in [&run_settings.output_dir, &run_settings.temp_dir] {
            create_directory(directory)?;
        }
        context.set_directories(&run_settings.output_dir, &run_settings.temp_dir);
        context.observe_input();

        let total = workflow.enabled_steps().count() as u64;
        info!(
            workflow = %workflow.display_name(),
            input = %input.display(),
            output_dir = %run_settings.output_dir.display(),
            steps = total,
            "starting workflow run"
        );

        let hooks = HookRunner::new(self.runner.as_ref(), &self.config.tools.shell, run_settings.timeout);
        let mut hook_failures = hooks.run_point(&workflow.hooks, HookPoint::PreWorkflow, &context);

        let environment = StepEnvironment {
            handlers: &self.handlers,
            runner: self.runner.as_ref(),
            tools: &self.config.tools,
            settings: &settings,
            run_settings: &run_settings,
        };
        let mut control_state = ControlState::new(control);
        let mut reports = Vec::with_capacity(workflow.steps.len());
        let mut cancelled = false;
        let mut stopped = false;

        for step in &workflow.steps {
            if !step.enabled {
                reports.push(StepReport::new(step, StepPhase::Disabled));
                continue;
            }
            if !cancelled && !stopped && control_state.cancel_requested() {
                cancelled = true;
            }
            if cancelled || stopped {
                reports.push(StepReport::new(step, StepPhase::Pending));
                continue;
            }

            let report = run_step(&environment, step, &mut context);
            match report.phase {
                StepPhase::Succeeded => {
                    hook_failures += hooks.run_point(&workflow.hooks, HookPoint::PostStep, &context);
                }
                StepPhase::Failed if run_settings.stop_on_failure => {
                    warn!(step = %step.name, "stopping after failed step");
                    stopped = true;
                }
                _ => {}
            }
            reports.push(report);
        }

        let status = if cancelled {
            RunStatus::Cancelled
        } else if context.failed_count > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        let closing = match status {
            RunStatus::Succeeded => HookPoint::OnSuccess,
            RunStatus::Failed | RunStatus::Cancelled => HookPoint::OnFailure,
        };
        hook_failures += hooks.run_point(&workflow.hooks, closing, &context);

        let result = RunResult {
            workflow_name: workflow.name.clone(),
            preset: workflow.preset.clone(),
            status,
            steps: reports,
            total,
            processed: context.processed_count,
            failed: context.failed_count,
            skipped: context.skipped_count,
            hook_failures,
            context: context.summary(),
            duration_ms: millis(started_at.elapsed()),
        };
        info!(
            workflow = %workflow.display_name(),
            status = ?result.status,
            processed = result.processed,
            failed = result.failed,
            skipped = result.skipped,
            duration_ms = result.duration_ms,
            "workflow run finished"
        );
        Ok(result)
    }
}

fn create_directory(path: &Path) -> Result<(), EngineError> {
    fs::create_dir_all(path).map_err(|source| EngineError::Directory {
        path: path.to_path_buf(),
        source,
    })
}
