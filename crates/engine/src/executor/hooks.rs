//! Lifecycle hook execution.
//!
//! Hook commands are substituted against the context immediately before they
//! run and are executed as `<shell> -c <command>`. Failures are logged and
//! counted; they never change step or run status.

use std::time::Duration;

use imgpipe_types::{HookPoint, WorkflowHooks};
use tracing::{debug, warn};

use crate::context::ExecutionContext;
use crate::executor::runner::{CommandRunner, CommandSpec};
use crate::templates::substitute;

pub struct HookRunner<'a> {
    runner: &'a dyn CommandRunner,
    shell: &'a str,
    timeout: Option<Duration>,
}

impl<'a> HookRunner<'a> {
    pub fn new(runner: &'a dyn CommandRunner, shell: &'a str, timeout: Option<Duration>) -> Self {
        Self { runner, shell, timeout }
    }

    /// Runs every command registered for `point`; returns the failure count.
    pub fn run_point(&self, hooks: &WorkflowHooks, point: HookPoint, context: &ExecutionContext) -> u64 {
        let commands = hooks.commands(point);
        if commands.is_empty() {
            return 0;
        }

        let bindings = context.bindings();
        let environment = context.hook_environment();
        let mut failures = 0u64;
        for template in commands {
            let command = match substitute(template, &bindings) {
                Ok(command) => command,
                Err(error) => {
                    warn!(hook = %point, command = %template, error = %error, "hook command could not be rendered");
                    failures += 1;
                    continue;
                }
            };

            debug!(hook = %point, command = %command, "running hook");
            let spec = CommandSpec::shell(self.shell, command.clone())
                .envs(environment.iter().cloned())
                .timeout(self.timeout);
            match self.runner.run(&spec) {
                Ok(output) if output.succeeded() => {}
                Ok(output) => {
                    warn!(
                        hook = %point,
                        command = %command,
                        reason = %output.failure_reason(self.shell),
                        "hook command failed"
                    );
                    failures += 1;
                }
                Err(error) => {
                    warn!(hook = %point, command = %command, error = %error, "hook command could not be started");
                    failures += 1;
                }
            }
        }
        failures
    }
}
