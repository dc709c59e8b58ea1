//! User-supplied shell scripts.

use anyhow::{Result, bail};
use imgpipe_types::HandlerOutcome;
use tracing::debug;

use super::{HandlerInvocation, StepHandler};
use crate::context::observe_images;
use crate::executor::runner::CommandSpec;

/// Runs `<shell> -c <script>`; the script arrives already substituted.
///
/// Every step binding is exported as `IMGPIPE_<NAME>`. When an `output`
/// directory is given, the images found there after the script exits are
/// reported as the step's output.
#[derive(Debug, Default, Clone, Copy)]
pub struct CustomScriptHandler;

impl CustomScriptHandler {
    fn script(invocation: &HandlerInvocation<'_>) -> Result<String> {
        let script = invocation
            .param_str("script")
            .or_else(|| invocation.param_str("command"))
            .unwrap_or_default();
        if script.trim().is_empty() {
            bail!("custom step needs a non-empty 'script'");
        }
        Ok(script)
    }
}

impl StepHandler for CustomScriptHandler {
    fn run(&self, invocation: &HandlerInvocation<'_>) -> Result<HandlerOutcome> {
        let script = Self::script(invocation)?;
        let environment = invocation
            .bindings
            .iter()
            .map(|(name, value)| (format!("IMGPIPE_{}", name.to_ascii_uppercase()), value.render_plain()));

        let mut command = CommandSpec::shell(&invocation.tools.shell, script).envs(environment);
        if let Some(directory) = invocation.param_str("working_dir") {
            command = command.current_dir(imgpipe_util::expand_tilde(&directory));
        }

        let output = invocation.run_tool(command)?;
        if !output.succeeded() {
            let reason = output.failure_reason(&invocation.tools.shell);
            return Ok(HandlerOutcome::failure(format!("script failed: {reason}")));
        }
        if !output.stdout.trim().is_empty() {
            debug!(step = invocation.step_name, stdout = %output.stdout.trim(), "custom script output");
        }

        let observed = invocation
            .param_str("output")
            .map(|output| imgpipe_util::expand_tilde(&output))
            .and_then(|output| observe_images(&output));
        let (items, bytes) = observed.unwrap_or((0, 0));
        Ok(HandlerOutcome::success(items, bytes))
    }
}
