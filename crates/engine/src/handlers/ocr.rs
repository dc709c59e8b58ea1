//! Text recognition with tesseract.

use anyhow::{Result, bail};
use imgpipe_types::HandlerOutcome;

use super::batch::{path_arg, plan_batch, run_batch};
use super::{HandlerInvocation, StepHandler};
use crate::executor::runner::CommandSpec;

const DEFAULT_LANGUAGE: &str = "eng";

/// Output kinds tesseract can write, by file extension.
const OUTPUT_KINDS: [&str; 4] = ["txt", "pdf", "hocr", "tsv"];

/// Writes one recognized-text file per image.
#[derive(Debug, Default, Clone, Copy)]
pub struct OcrHandler;

impl StepHandler for OcrHandler {
    fn run(&self, invocation: &HandlerInvocation<'_>) -> Result<HandlerOutcome> {
        let language = invocation
            .param_str("language")
            .or_else(|| invocation.param_str("lang"))
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());
        let kind = invocation
            .param_str("format")
            .map(|format| format.to_ascii_lowercase())
            .unwrap_or_else(|| "txt".to_string());
        if !OUTPUT_KINDS.contains(&kind.as_str()) {
            bail!("ocr cannot write '{kind}'; use one of {}", OUTPUT_KINDS.join(", "));
        }
        let psm = invocation.param_u64("psm")?;

        let input = invocation.input_path_or(invocation.working_set);
        let items = plan_batch(invocation, &input, Some(&kind))?;
        let report = run_batch(invocation, &items, |item| {
            // tesseract appends the extension itself
            let base = item.target.with_extension("");
            let mut command = CommandSpec::new(&invocation.tools.tesseract)
                .arg(path_arg(&item.source))
                .arg(path_arg(&base))
                .arg("-l")
                .arg(language.clone());
            if let Some(psm) = psm {
                command = command.arg("--psm").arg(psm.to_string());
            }
            if kind != "txt" {
                command = command.arg(kind.clone());
            }
            Ok(command)
        })?;
        Ok(report.into_outcome("images"))
    }
}
