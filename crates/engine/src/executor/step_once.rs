//! Single-step execution: condition, parameter resolution, dispatch, and
//! folding the outcome back into the context.

use std::time::Instant;

use imgpipe_types::workflow::ValueMap;
use imgpipe_types::{HandlerOutcome, StepDefinition};
use tracing::{debug, info, warn};

use super::runner::CommandRunner;
use super::types::{StepPhase, StepReport, millis};
use crate::config::{RunSettings, ToolPaths};
use crate::context::ExecutionContext;
use crate::errors::ValidationError;
use crate::handlers::{HandlerInvocation, HandlerRegistry};
use crate::range::RangeSpec;
use crate::templates::interpolate_params;
use crate::workflow::condition_syntax::eval_condition;
use crate::workflow::merge::merge_value_maps;
use crate::workflow::validation::{RANGE_PARAM_KEYS, range_param_text};

/// Run-wide collaborators every step sees.
pub(crate) struct StepEnvironment<'a> {
    pub handlers: &'a HandlerRegistry,
    pub runner: &'a dyn CommandRunner,
    pub tools: &'a ToolPaths,
    pub settings: &'a ValueMap,
    pub run_settings: &'a RunSettings,
}

/// Runs `step` once against `context`.
///
/// Every failure lands in the returned report. Params that only turn out to be
/// invalid once substituted fail the step like a handler error would.
pub(crate) fn run_step(environment: &StepEnvironment<'_>, step: &StepDefinition, context: &mut ExecutionContext) -> StepReport {
    let started_at = Instant::now();
    context.begin_step(&step.name);
    let mut report = StepReport::new(step, StepPhase::ConditionChecked);
    report.step_number = Some(context.step_number);

    if let Err(error) = drive_step(environment, step, context, &mut report, started_at) {
        let message = error.to_string();
        warn!(step = %step.name, error = %message, "step params invalid after substitution");
        context.record_failure(&step.name, &message);
        report.phase = StepPhase::Failed;
        report.duration_ms = millis(started_at.elapsed());
        report.outcome = Some(HandlerOutcome::failure(message));
    }
    report
}

fn drive_step(
    environment: &StepEnvironment<'_>,
    step: &StepDefinition,
    context: &mut ExecutionContext,
    report: &mut StepReport,
    started_at: Instant,
) -> Result<(), ValidationError> {
    let params = if eval_condition(step.condition.as_deref(), &*context)? {
        step.params.clone()
    } else {
        match &step.r#else {
            Some(alternate) => {
                debug!(step = %step.name, "condition false; using else params");
                report.used_else = true;
                merge_value_maps(&step.params, alternate)
            }
            None => {
                debug!(step = %step.name, condition = ?step.condition, "condition false; skipping step");
                context.record_skip();
                report.phase = StepPhase::Skipped;
                report.duration_ms = millis(started_at.elapsed());
                return Ok(());
            }
        }
    };

    let bindings = context.bindings();
    let params = interpolate_params(&params, &bindings)?;
    check_ranges(&params)?;

    report.phase = StepPhase::Dispatched;
    let deadline = environment.run_settings.timeout.map(|timeout| started_at + timeout);
    debug!(step = %step.name, step_type = %step.r#type, step_number = context.step_number, "dispatching step");

    let outcome = match environment.handlers.get(step.r#type) {
        None => HandlerOutcome::failure(format!("no handler registered for step type '{}'", step.r#type)),
        Some(handler) => {
            let invocation = HandlerInvocation {
                step_name: &step.name,
                step_type: step.r#type,
                params: &params,
                settings: environment.settings,
                run_settings: environment.run_settings,
                bindings: &bindings,
                workflow_input: &context.workflow_input,
                working_set: &context.working_set,
                deadline,
                runner: environment.runner,
                tools: environment.tools,
            };
            let outcome = handler
                .run(&invocation)
                .unwrap_or_else(|error| HandlerOutcome::failure(format!("{error:#}")));
            enforce_deadline(outcome, deadline, environment.run_settings)
        }
    };

    report.duration_ms = millis(started_at.elapsed());
    if outcome.succeeded {
        context.record_success(step.r#type, &outcome);
        if outcome.items_produced > 0 && step.r#type.produces_images() {
            let output = params
                .get("output")
                .and_then(|value| value.as_str())
                .map(imgpipe_util::expand_tilde)
                .unwrap_or_else(|| environment.run_settings.output_dir.clone());
            context.advance_working_set(output);
        }
        report.phase = StepPhase::Succeeded;
        info!(
            step = %step.name,
            items = outcome.items_produced,
            bytes = outcome.bytes_produced,
            duration_ms = report.duration_ms,
            "step succeeded"
        );
    } else {
        let message = outcome.error_message.clone().unwrap_or_else(|| "step failed".to_string());
        context.record_failure(&step.name, &message);
        report.phase = StepPhase::Failed;
        warn!(step = %step.name, error = %message, items = outcome.items_produced, "step failed");
    }
    report.outcome = Some(outcome);
    Ok(())
}

/// Re-checks `pages`/`items` once placeholders are resolved.
fn check_ranges(params: &ValueMap) -> Result<(), ValidationError> {
    for key in RANGE_PARAM_KEYS {
        let Some(text) = params.get(key).and_then(range_param_text) else {
            continue;
        };
        if !text.eq_ignore_ascii_case("all") {
            RangeSpec::parse(&text)?;
        }
    }
    Ok(())
}

/// A step that returns after its deadline failed, whatever the handler said.
fn enforce_deadline(outcome: HandlerOutcome, deadline: Option<Instant>, settings: &RunSettings) -> HandlerOutcome {
    let (Some(deadline), Some(timeout)) = (deadline, settings.timeout) else {
        return outcome;
    };
    if !outcome.succeeded || Instant::now() <= deadline {
        return outcome;
    }
    HandlerOutcome::partial_failure(
        outcome.items_produced,
        outcome.bytes_produced,
        format!("step exceeded its timeout of {}s", timeout.as_secs()),
    )
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;
    use imgpipe_types::StepType;
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::executor::runner::DryRunRunner;
    use crate::handlers::StepHandler;
    use crate::templates::TemplateBindings;

    /// Echoes the params it saw back as the error message so tests can inspect them.
    struct EchoHandler {
        succeed: bool,
        items: u64,
        sleep: Option<Duration>,
    }

    impl StepHandler for EchoHandler {
        fn run(&self, invocation: &HandlerInvocation<'_>) -> Result<HandlerOutcome> {
            if let Some(sleep) = self.sleep {
                std::thread::sleep(sleep);
            }
            let seen = serde_json::to_string(invocation.params)?;
            Ok(HandlerOutcome {
                succeeded: self.succeed,
                items_produced: self.items,
                bytes_produced: self.items * 10,
                error_message: Some(seen),
            })
        }
    }

    fn registry(handler: EchoHandler) -> HandlerRegistry {
        HandlerRegistry::new().with_handler(StepType::Resize, Arc::new(handler))
    }

    fn settings() -> RunSettings {
        RunSettings::resolve(&ValueMap::new(), &EngineConfig::default(), &TemplateBindings::new()).expect("settings")
    }

    fn run(handlers: &HandlerRegistry, run_settings: &RunSettings, step: &StepDefinition, context: &mut ExecutionContext) -> StepReport {
        let runner = DryRunRunner::new();
        let tools = ToolPaths::default();
        let raw = ValueMap::new();
        let environment = StepEnvironment {
            handlers,
            runner: &runner,
            tools: &tools,
            settings: &raw,
            run_settings,
        };
        run_step(&environment, step, context)
    }

    fn resize_step() -> StepDefinition {
        let mut step = StepDefinition::new("shrink", StepType::Resize);
        step.params.insert("width".into(), json!(300));
        step.params.insert("label".into(), json!("{step_name}-{counter}"));
        step
    }

    #[test]
    fn success_updates_counters_and_substitutes_params() {
        let handlers = registry(EchoHandler { succeed: true, items: 4, sleep: None });
        let mut context = ExecutionContext::new("scan", "/in/a.pdf", 3);
        let report = run(&handlers, &settings(), &resize_step(), &mut context);

        assert_eq!(report.phase, StepPhase::Succeeded);
        assert_eq!(report.step_number, Some(1));
        assert!(report.error_message().unwrap_or_default().contains("shrink-1"));
        assert_eq!(context.processed_count, 1);
        assert_eq!(context.counter, 2);
        assert_eq!(context.image_count, Some(4));
        assert_eq!(context.working_set, settings().output_dir);
    }

    #[test]
    fn ocr_output_does_not_become_the_working_set() {
        let handlers = HandlerRegistry::new().with_handler(
            StepType::Ocr,
            Arc::new(EchoHandler { succeed: true, items: 2, sleep: None }),
        );
        let mut step = StepDefinition::new("read", StepType::Ocr);
        step.params.insert("output".into(), json!("/out/text"));
        let mut context = ExecutionContext::new("scan", "/in/pages", 3);

        let report = run(&handlers, &settings(), &step, &mut context);

        assert_eq!(report.phase, StepPhase::Succeeded);
        assert_eq!(context.working_set, PathBuf::from("/in/pages"));
        assert_eq!(context.image_count, None);
    }

    #[test]
    fn false_condition_without_else_skips() {
        let handlers = registry(EchoHandler { succeed: true, items: 1, sleep: None });
        let mut step = resize_step();
        step.condition = Some("total_size > 50MB".to_string());
        let mut context = ExecutionContext::new("scan", "/in/a.pdf", 3);

        let report = run(&handlers, &settings(), &step, &mut context);

        assert_eq!(report.phase, StepPhase::Skipped);
        assert!(report.outcome.is_none());
        assert_eq!(context.step_number, 1);
        assert_eq!(context.skipped_count, 1);
        assert_eq!(context.counter, 1);
    }

    #[test]
    fn false_condition_with_else_merges_params() {
        let handlers = registry(EchoHandler { succeed: true, items: 0, sleep: None });
        let mut step = resize_step();
        step.condition = Some("image_count > 10".to_string());
        step.r#else = Some(ValueMap::from_iter([("width".to_string(), json!(100))]));
        let mut context = ExecutionContext::new("scan", "/in/a.pdf", 3);
        context.image_count = Some(2);

        let report = run(&handlers, &settings(), &step, &mut context);

        assert!(report.used_else);
        let seen = report.error_message().unwrap_or_default().to_string();
        assert!(seen.contains("\"width\":100"));
        assert!(seen.contains("\"label\""));
        assert_eq!(context.counter, 1, "no items, no counter advance");
    }

    #[test]
    fn handler_failure_is_recorded_not_raised() {
        let handlers = registry(EchoHandler { succeed: false, items: 0, sleep: None });
        let mut context = ExecutionContext::new("scan", "/in/a.pdf", 3);
        let report = run(&handlers, &settings(), &resize_step(), &mut context);

        assert_eq!(report.phase, StepPhase::Failed);
        assert_eq!(context.failed_count, 1);
        assert_eq!(context.failed_step.as_deref(), Some("shrink"));
    }

    #[test]
    fn missing_handler_fails_the_step() {
        let mut context = ExecutionContext::new("scan", "/in/a.pdf", 3);
        let report = run(&HandlerRegistry::new(), &settings(), &resize_step(), &mut context);
        assert_eq!(report.phase, StepPhase::Failed);
        assert!(report.error_message().unwrap_or_default().contains("no handler registered"));
    }

    #[test]
    fn overrunning_the_timeout_fails_the_step() {
        let handlers = registry(EchoHandler {
            succeed: true,
            items: 2,
            sleep: Some(Duration::from_millis(1100)),
        });
        let run_settings = RunSettings {
            timeout: Some(Duration::from_secs(1)),
            ..settings()
        };
        let mut context = ExecutionContext::new("scan", "/in/a.pdf", 3);

        let report = run(&handlers, &run_settings, &resize_step(), &mut context);

        assert_eq!(report.phase, StepPhase::Failed);
        assert_eq!(report.error_message(), Some("step exceeded its timeout of 1s"));
        assert_eq!(report.outcome.as_ref().map(|outcome| outcome.items_produced), Some(2));
    }

    #[test]
    fn substituted_range_is_checked_before_dispatch() {
        let handlers = registry(EchoHandler { succeed: true, items: 1, sleep: None });
        let mut step = resize_step();
        step.params.insert("pages".into(), json!("{step_number}-0"));
        let mut context = ExecutionContext::new("scan", "/in/a.pdf", 3);

        let report = run(&handlers, &settings(), &step, &mut context);

        assert_eq!(report.phase, StepPhase::Failed);
        assert!(report.error_message().unwrap_or_default().contains("invalid range '1-0'"));
        assert_eq!(context.failed_count, 1);
        assert_eq!(context.failed_step.as_deref(), Some("shrink"));
        assert_eq!(context.processed_count, 0);
    }
}
