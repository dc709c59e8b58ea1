//! Step handlers: one implementation per [`StepType`].
//!
//! Handlers receive merged, substituted params and delegate the real work to
//! external tools through the injected [`CommandRunner`]. They never touch the
//! execution context; results flow back as a single [`HandlerOutcome`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use imgpipe_types::workflow::ValueMap;
use imgpipe_types::{HandlerOutcome, StepType};
use serde_json::Value;

use crate::config::{RunSettings, ToolPaths};
use crate::executor::runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::templates::TemplateBindings;

pub mod batch;
pub mod custom;
pub mod extract;
pub mod image;
pub mod ocr;

pub use custom::CustomScriptHandler;
pub use extract::{ExcelExtractHandler, PdfExtractHandler};
pub use image::{ConvertHandler, ResizeHandler, WatermarkHandler};
pub use ocr::OcrHandler;

/// Everything a handler may read while executing one step.
pub struct HandlerInvocation<'a> {
    pub step_name: &'a str,
    pub step_type: StepType,
    /// Merged and substituted params; `output_template` still holds item-scoped placeholders.
    pub params: &'a ValueMap,
    /// Raw resolved settings, including keys the engine does not interpret.
    pub settings: &'a ValueMap,
    pub run_settings: &'a RunSettings,
    /// Step bindings for per-item substitution passes.
    pub bindings: &'a TemplateBindings,
    pub workflow_input: &'a Path,
    /// Where the previous producing step wrote; default input for batch steps.
    pub working_set: &'a Path,
    pub deadline: Option<Instant>,
    pub runner: &'a dyn CommandRunner,
    pub tools: &'a ToolPaths,
}

impl HandlerInvocation<'_> {
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key).filter(|value| !value.is_null())
    }

    /// String param; numbers and booleans are rendered as text.
    pub fn param_str(&self, key: &str) -> Option<String> {
        match self.param(key)? {
            Value::String(text) => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            Value::Bool(flag) => Some(flag.to_string()),
            _ => None,
        }
    }

    pub fn param_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.param(key) {
            None => Ok(None),
            Some(Value::Number(number)) => match number.as_u64() {
                Some(value) => Ok(Some(value)),
                None => bail!("param '{key}' must be a non-negative integer"),
            },
            Some(Value::String(text)) => match text.trim().parse() {
                Ok(value) => Ok(Some(value)),
                Err(_) => bail!("param '{key}' must be a non-negative integer, got '{text}'"),
            },
            Some(other) => bail!("param '{key}' must be a non-negative integer, got {other}"),
        }
    }

    pub fn param_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.param(key) {
            None => Ok(None),
            Some(Value::Bool(flag)) => Ok(Some(*flag)),
            Some(Value::String(text)) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" => Ok(Some(true)),
                "false" | "no" | "off" => Ok(Some(false)),
                _ => bail!("param '{key}' must be a boolean, got '{text}'"),
            },
            Some(other) => bail!("param '{key}' must be a boolean, got {other}"),
        }
    }

    /// `input` param, falling back to `fallback`.
    pub fn input_path_or(&self, fallback: &Path) -> PathBuf {
        self.param_str("input")
            .map(|input| imgpipe_util::expand_tilde(&input))
            .unwrap_or_else(|| fallback.to_path_buf())
    }

    /// `output` param, falling back to the run output directory.
    pub fn output_dir(&self) -> PathBuf {
        self.param_str("output")
            .map(|output| imgpipe_util::expand_tilde(&output))
            .unwrap_or_else(|| self.run_settings.output_dir.clone())
    }

    /// Output format: `format` param, then the run default.
    pub fn format(&self) -> String {
        self.param_str("format")
            .unwrap_or_else(|| self.run_settings.format.clone())
            .trim_start_matches('.')
            .to_ascii_lowercase()
    }

    /// Time left before the step deadline; `None` when unbounded.
    pub fn remaining_time(&self) -> Option<Duration> {
        self.deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Runs `command` bounded by the step deadline.
    pub fn run_tool(&self, command: CommandSpec) -> Result<CommandOutput> {
        let timeout = match (self.remaining_time(), command.timeout) {
            (Some(remaining), _) if remaining.is_zero() => {
                bail!("step '{}' exceeded its timeout before running '{}'", self.step_name, command.program)
            }
            (Some(remaining), Some(own)) => Some(remaining.min(own)),
            (Some(remaining), None) => Some(remaining),
            (None, own) => own,
        };
        self.runner.run(&command.timeout(timeout))
    }

    /// Runs `command` and turns a non-zero exit or timeout into an error.
    pub fn run_tool_checked(&self, command: CommandSpec) -> Result<CommandOutput> {
        let program = command.program.clone();
        let output = self.run_tool(command)?;
        if !output.succeeded() {
            bail!(output.failure_reason(&program));
        }
        Ok(output)
    }
}

/// Executes one step type.
pub trait StepHandler: Send + Sync {
    fn run(&self, invocation: &HandlerInvocation<'_>) -> Result<HandlerOutcome>;
}

/// Lookup table from step type to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<StepType, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    /// Registry with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handler for every step type.
    pub fn standard() -> Self {
        Self::new()
            .with_handler(StepType::PdfExtract, Arc::new(PdfExtractHandler))
            .with_handler(StepType::ExcelExtract, Arc::new(ExcelExtractHandler))
            .with_handler(StepType::Convert, Arc::new(ConvertHandler))
            .with_handler(StepType::Resize, Arc::new(ResizeHandler))
            .with_handler(StepType::Watermark, Arc::new(WatermarkHandler))
            .with_handler(StepType::Ocr, Arc::new(OcrHandler))
            .with_handler(StepType::Custom, Arc::new(CustomScriptHandler))
    }

    pub fn register(&mut self, step_type: StepType, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(step_type, handler);
    }

    pub fn with_handler(mut self, step_type: StepType, handler: Arc<dyn StepHandler>) -> Self {
        self.register(step_type, handler);
        self
    }

    pub fn get(&self, step_type: StepType) -> Option<&Arc<dyn StepHandler>> {
        self.handlers.get(&step_type)
    }

    pub fn contains(&self, step_type: StepType) -> bool {
        self.handlers.contains_key(&step_type)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&str> = self.handlers.keys().map(StepType::as_str).collect();
        types.sort_unstable();
        f.debug_struct("HandlerRegistry").field("types", &types).finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::*;
    use crate::config::EngineConfig;

    /// Runner returning scripted outputs by program name; records every call.
    #[derive(Default)]
    pub struct ScriptedRunner {
        pub calls: Mutex<Vec<CommandSpec>>,
        responses: Mutex<HashMap<String, CommandOutput>>,
    }

    impl ScriptedRunner {
        pub fn respond(self, program: &str, output: CommandOutput) -> Self {
            self.responses.lock().expect("lock").insert(program.to_string(), output);
            self
        }

        pub fn calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().expect("lock").clone()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
            self.calls.lock().expect("lock").push(command.clone());
            Ok(self
                .responses
                .lock()
                .expect("lock")
                .get(&command.program)
                .cloned()
                .unwrap_or_else(|| CommandOutput::success("")))
        }
    }

    pub fn run_settings(output_dir: &Path) -> RunSettings {
        RunSettings::resolve(&ValueMap::new(), &EngineConfig::default(), &TemplateBindings::new())
            .map(|settings| RunSettings {
                output_dir: output_dir.to_path_buf(),
                temp_dir: output_dir.join(".tmp"),
                ..settings
            })
            .expect("default settings")
    }

    /// Builds an invocation over borrowed parts for handler unit tests.
    pub struct InvocationParts {
        pub params: ValueMap,
        pub settings: ValueMap,
        pub run_settings: RunSettings,
        pub bindings: TemplateBindings,
        pub workflow_input: PathBuf,
        pub tools: ToolPaths,
    }

    impl InvocationParts {
        pub fn new(params: ValueMap, workflow_input: &Path, output_dir: &Path) -> Self {
            Self {
                params,
                settings: ValueMap::new(),
                run_settings: run_settings(output_dir),
                bindings: TemplateBindings::new(),
                workflow_input: workflow_input.to_path_buf(),
                tools: ToolPaths::default(),
            }
        }

        pub fn invocation<'a>(&'a self, step_type: StepType, runner: &'a dyn CommandRunner) -> HandlerInvocation<'a> {
            HandlerInvocation {
                step_name: "step",
                step_type,
                params: &self.params,
                settings: &self.settings,
                run_settings: &self.run_settings,
                bindings: &self.bindings,
                workflow_input: &self.workflow_input,
                working_set: &self.workflow_input,
                deadline: None,
                runner,
                tools: &self.tools,
            }
        }
    }

    pub fn params(entries: &[(&str, Value)]) -> ValueMap {
        entries.iter().map(|(key, value)| (key.to_string(), value.clone())).collect()
    }
}
