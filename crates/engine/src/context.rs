//! Mutable per-run state shared by the driver, handlers, and hooks.
//!
//! The driver is the only writer. Handlers receive an immutable binding table
//! derived from the context and report results through
//! [`imgpipe_types::HandlerOutcome`].

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use imgpipe_types::{HandlerOutcome, StepType};
use imgpipe_util::file_stem_and_extension;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::templates::{TemplateBindings, pad_number};
use crate::workflow::condition_syntax::ConditionScope;

/// File extensions treated as images when observing inputs and batching.
pub const IMAGE_EXTENSIONS: [&str; 9] = ["png", "jpg", "jpeg", "tif", "tiff", "bmp", "gif", "webp", "heic"];

/// Returns true when `path` has an image extension.
pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| IMAGE_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Size of the image set found at `path`: `(count, bytes)`.
///
/// A directory contributes its direct image children; a single image file
/// counts as one. Anything else has no image set.
pub fn observe_images(path: &Path) -> Option<(u64, u64)> {
    let metadata = fs::metadata(path).ok()?;
    if metadata.is_file() {
        return is_image_path(path).then_some((1, metadata.len()));
    }
    let entries = fs::read_dir(path).ok()?;
    let mut count = 0u64;
    let mut bytes = 0u64;
    for entry in entries.flatten() {
        let entry_path = entry.path();
        if !is_image_path(&entry_path) {
            continue;
        }
        if let Ok(entry_metadata) = entry.metadata()
            && entry_metadata.is_file()
        {
            count += 1;
            bytes += entry_metadata.len();
        }
    }
    Some((count, bytes))
}

/// Run state visible to conditions, templates, and hooks.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub workflow_input: PathBuf,
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub workflow_name: String,
    /// Where the latest producing step wrote; batch steps read from here by default.
    pub working_set: PathBuf,
    /// Name of the step currently being evaluated.
    pub step_name: Option<String>,
    /// 1-based position of the current step among evaluated steps.
    pub step_number: u64,
    /// Output ordinal seed; advances after each step that produced items.
    pub counter: u64,
    pub counter_width: usize,
    /// Size of the current working image set; unknown until observed.
    pub image_count: Option<u64>,
    pub total_size: Option<u64>,
    pub processed_count: u64,
    pub failed_count: u64,
    pub skipped_count: u64,
    pub extracted_count: u64,
    /// First step that failed, if any.
    pub failed_step: Option<String>,
    pub error_message: Option<String>,
    started_at: Instant,
    started_at_local: DateTime<Local>,
}

impl ExecutionContext {
    pub fn new(workflow_name: impl Into<String>, workflow_input: impl Into<PathBuf>, counter_width: usize) -> Self {
        let workflow_input = workflow_input.into();
        Self {
            working_set: workflow_input.clone(),
            workflow_input,
            output_dir: PathBuf::new(),
            temp_dir: PathBuf::new(),
            workflow_name: workflow_name.into(),
            step_name: None,
            step_number: 0,
            counter: 1,
            counter_width,
            image_count: None,
            total_size: None,
            processed_count: 0,
            failed_count: 0,
            skipped_count: 0,
            extracted_count: 0,
            failed_step: None,
            error_message: None,
            started_at: Instant::now(),
            started_at_local: Local::now(),
        }
    }

    pub fn set_directories(&mut self, output_dir: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) {
        self.output_dir = output_dir.into();
        self.temp_dir = temp_dir.into();
    }

    /// Seeds `image_count` and `total_size` from the workflow input.
    pub fn observe_input(&mut self) {
        if let Some((count, bytes)) = observe_images(&self.workflow_input) {
            debug!(input = %self.workflow_input.display(), count, bytes, "observed input image set");
            self.image_count = Some(count);
            self.total_size = Some(bytes);
        }
    }

    pub fn workflow_duration(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at_local
    }

    pub fn counter_padded(&self) -> String {
        pad_number(i64::try_from(self.counter).unwrap_or(i64::MAX), self.counter_width)
    }

    /// Marks `step_name` as the current step and advances `step_number`.
    pub fn begin_step(&mut self, step_name: &str) {
        self.step_number += 1;
        self.step_name = Some(step_name.to_string());
    }

    pub fn record_skip(&mut self) {
        self.skipped_count += 1;
    }

    /// Folds a successful outcome into the counters.
    ///
    /// Produced images become the current image set, so later conditions see
    /// what the previous step wrote. Text output leaves the image set alone.
    pub fn record_success(&mut self, step_type: StepType, outcome: &HandlerOutcome) {
        self.processed_count += 1;
        if step_type.is_extraction() {
            self.extracted_count += outcome.items_produced;
        }
        if outcome.items_produced > 0 {
            self.counter += 1;
            if step_type.produces_images() {
                self.image_count = Some(outcome.items_produced);
                self.total_size = Some(outcome.bytes_produced);
            }
        }
    }

    /// Points later batch steps at `output` once a step produced items there.
    pub fn advance_working_set(&mut self, output: impl Into<PathBuf>) {
        self.working_set = output.into();
    }

    /// Records a failed step; the first failure is kept for `on_failure` hooks.
    pub fn record_failure(&mut self, step_name: &str, message: &str) {
        self.failed_count += 1;
        if self.failed_step.is_none() {
            self.failed_step = Some(step_name.to_string());
            self.error_message = Some(message.to_string());
        }
    }

    /// Bindings with the run-wide names only (no directories or step state).
    pub fn static_bindings(&self) -> TemplateBindings {
        let (input_name, input_ext) = file_stem_and_extension(&self.workflow_input);
        let mut bindings = TemplateBindings::new()
            .with("workflow_input", self.workflow_input.display().to_string())
            .with("workflow_name", self.workflow_name.clone())
            .with("timestamp", self.started_at_local.format("%Y%m%d_%H%M%S").to_string())
            .with("date", self.started_at_local.format("%Y-%m-%d").to_string())
            .with("time", self.started_at_local.format("%H%M%S").to_string())
            .with("input_name", input_name.clone())
            .with("input_ext", input_ext.clone());
        match input_ext.to_ascii_lowercase().as_str() {
            "pdf" => bindings.insert("pdf_name", input_name),
            "xlsx" | "xls" | "xlsm" => bindings.insert("excel_name", input_name),
            _ => {}
        }
        bindings
    }

    /// Full binding table for step params and hook commands.
    pub fn bindings(&self) -> TemplateBindings {
        let mut bindings = self.static_bindings();
        bindings.insert("output_dir", self.output_dir.display().to_string());
        bindings.insert("temp_dir", self.temp_dir.display().to_string());
        if let Some(step_name) = &self.step_name {
            bindings.insert("step_name", step_name.clone());
        }
        bindings.insert("step_number", self.step_number);
        bindings.insert("counter", self.counter);
        bindings.insert("counter_padded", self.counter_padded());
        bindings.insert("processed_count", self.processed_count);
        bindings.insert("failed_count", self.failed_count);
        bindings.insert("extracted_count", self.extracted_count);
        if let Some(image_count) = self.image_count {
            bindings.insert("image_count", image_count);
        }
        if let Some(total_size) = self.total_size {
            bindings.insert("total_size", total_size);
        }
        if let Some(failed_step) = &self.failed_step {
            bindings.insert("failed_step", failed_step.clone());
        }
        if let Some(error_message) = &self.error_message {
            bindings.insert("error_message", error_message.clone());
        }
        bindings
    }

    /// Environment variables exported to hook commands.
    pub fn hook_environment(&self) -> Vec<(String, String)> {
        let mut environment = vec![
            ("IMGPIPE_WORKFLOW".to_string(), self.workflow_name.clone()),
            ("IMGPIPE_INPUT".to_string(), self.workflow_input.display().to_string()),
            ("IMGPIPE_OUTPUT_DIR".to_string(), self.output_dir.display().to_string()),
            ("IMGPIPE_PROCESSED".to_string(), self.processed_count.to_string()),
            ("IMGPIPE_FAILED".to_string(), self.failed_count.to_string()),
        ];
        if let Some(step_name) = &self.step_name {
            environment.push(("IMGPIPE_STEP".to_string(), step_name.clone()));
        }
        if let Some(error_message) = &self.error_message {
            environment.push(("IMGPIPE_ERROR".to_string(), error_message.clone()));
        }
        environment
    }

    pub fn summary(&self) -> ContextSummary {
        ContextSummary {
            workflow_name: self.workflow_name.clone(),
            workflow_input: self.workflow_input.clone(),
            output_dir: self.output_dir.clone(),
            counter: self.counter,
            image_count: self.image_count,
            total_size: self.total_size,
            processed_count: self.processed_count,
            failed_count: self.failed_count,
            skipped_count: self.skipped_count,
            extracted_count: self.extracted_count,
            failed_step: self.failed_step.clone(),
            error_message: self.error_message.clone(),
            variables: self.numeric_variables(),
        }
    }

    fn numeric_variables(&self) -> HashMap<String, i64> {
        let mut variables = HashMap::new();
        for name in NUMERIC_VARIABLES {
            if let Some(value) = self.numeric_variable(name) {
                variables.insert(name.to_string(), value);
            }
        }
        variables
    }
}

/// Names a condition may compare.
pub const NUMERIC_VARIABLES: [&str; 9] = [
    "image_count",
    "total_size",
    "counter",
    "step_number",
    "processed_count",
    "failed_count",
    "skipped_count",
    "extracted_count",
    "workflow_duration",
];

impl ConditionScope for ExecutionContext {
    fn numeric_variable(&self, name: &str) -> Option<i64> {
        let to_i64 = |value: u64| i64::try_from(value).ok();
        match name {
            "image_count" => self.image_count.and_then(to_i64),
            "total_size" => self.total_size.and_then(to_i64),
            "counter" => to_i64(self.counter),
            "step_number" => to_i64(self.step_number),
            "processed_count" => to_i64(self.processed_count),
            "failed_count" => to_i64(self.failed_count),
            "skipped_count" => to_i64(self.skipped_count),
            "extracted_count" => to_i64(self.extracted_count),
            "workflow_duration" => to_i64(self.workflow_duration().as_secs()),
            _ => None,
        }
    }
}

/// Serializable snapshot of the context at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextSummary {
    pub workflow_name: String,
    pub workflow_input: PathBuf,
    pub output_dir: PathBuf,
    pub counter: u64,
    pub image_count: Option<u64>,
    pub total_size: Option<u64>,
    pub processed_count: u64,
    pub failed_count: u64,
    pub skipped_count: u64,
    pub extracted_count: u64,
    pub failed_step: Option<String>,
    pub error_message: Option<String>,
    pub variables: HashMap<String, i64>,
}

#[cfg(test)]
mod tests {
    use crate::templates::substitute;
    use crate::workflow::condition_syntax::Condition;

    use super::*;

    #[test]
    fn counter_starts_at_one_and_advances_only_with_items() {
        let mut context = ExecutionContext::new("scan", "/in/report.pdf", 3);
        assert_eq!(context.counter, 1);
        context.record_success(StepType::Convert, &HandlerOutcome::success(0, 0));
        assert_eq!(context.counter, 1);
        context.record_success(StepType::PdfExtract, &HandlerOutcome::success(4, 4096));
        assert_eq!(context.counter, 2);
        assert_eq!(context.extracted_count, 4);
        assert_eq!(context.processed_count, 2);
        assert_eq!(context.image_count, Some(4));
        assert_eq!(context.counter_padded(), "002");
    }

    #[test]
    fn text_output_keeps_the_image_metrics() {
        let mut context = ExecutionContext::new("scan", "/in/report.pdf", 3);
        context.record_success(StepType::PdfExtract, &HandlerOutcome::success(3, 3000));
        context.record_success(StepType::Ocr, &HandlerOutcome::success(3, 120));

        assert_eq!(context.image_count, Some(3));
        assert_eq!(context.total_size, Some(3000));
        assert_eq!(context.counter, 3);
        assert_eq!(context.processed_count, 2);
    }

    #[test]
    fn first_failure_is_kept() {
        let mut context = ExecutionContext::new("scan", "/in/report.pdf", 3);
        context.record_failure("extract", "pdftoppm exited with 1");
        context.record_failure("resize", "magick missing");
        assert_eq!(context.failed_count, 2);
        assert_eq!(context.failed_step.as_deref(), Some("extract"));
        assert_eq!(context.error_message.as_deref(), Some("pdftoppm exited with 1"));
    }

    #[test]
    fn unknown_image_metrics_make_conditions_false() {
        let context = ExecutionContext::new("scan", "/does/not/exist.pdf", 3);
        let condition = Condition::parse("image_count >= 0").expect("parse");
        assert!(!condition.evaluate(&context));
    }

    #[test]
    fn observes_directory_images() {
        let directory = tempfile::tempdir().expect("tempdir");
        fs::write(directory.path().join("a.png"), [0u8; 10]).expect("write");
        fs::write(directory.path().join("b.JPG"), [0u8; 5]).expect("write");
        fs::write(directory.path().join("notes.txt"), b"skip").expect("write");

        let mut context = ExecutionContext::new("batch", directory.path(), 3);
        context.observe_input();

        assert_eq!(context.image_count, Some(2));
        assert_eq!(context.total_size, Some(15));
        let condition = Condition::parse("image_count == 2 && total_size < 1KB").expect("parse");
        assert!(condition.evaluate(&context));
    }

    #[test]
    fn bindings_expose_input_names() {
        let mut context = ExecutionContext::new("scan", "/in/report.pdf", 3);
        context.set_directories("/out", "/tmp/imgpipe");
        context.begin_step("extract");
        let rendered = substitute("{output_dir}/{pdf_name}_{step_name}_{step_number}", &context.bindings()).expect("render");
        assert_eq!(rendered, "/out/report_extract_1");
        assert!(!context.bindings().contains("excel_name"));
    }

    #[test]
    fn summary_lists_known_variables() {
        let context = ExecutionContext::new("scan", "/in/report.pdf", 3);
        let summary = context.summary();
        assert_eq!(summary.variables.get("counter"), Some(&1));
        assert!(!summary.variables.contains_key("image_count"));
    }
}
