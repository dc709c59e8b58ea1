//! Per-file fan-out shared by the batch handlers.
//!
//! A batch step turns a file or directory of images into one output per
//! image. Work is spread over a rayon pool sized by the `parallel_jobs` hint;
//! results are folded into a single [`HandlerOutcome`] once every file is done.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use imgpipe_types::HandlerOutcome;
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use tracing::{debug, warn};

use super::HandlerInvocation;
use crate::context::is_image_path;
use crate::executor::runner::CommandSpec;
use crate::templates::{OUTPUT_TEMPLATE_KEY, TemplateBindings, substitute};

/// Output naming used when a batch step has no `output_template`.
pub const DEFAULT_BATCH_TEMPLATE: &str = "{input_name}";

/// One source file and where its result goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub source: PathBuf,
    /// 1-based position in the batch.
    pub ordinal: usize,
    pub target: PathBuf,
}

/// Tally of a finished batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub attempted: u64,
    pub produced: u64,
    pub bytes: u64,
    pub failures: Vec<(PathBuf, String)>,
}

impl BatchReport {
    pub(crate) fn record(&mut self, source: &Path, result: Result<u64>) {
        self.attempted += 1;
        match result {
            Ok(bytes) => {
                self.produced += 1;
                self.bytes += bytes;
            }
            Err(error) => {
                warn!(source = %source.display(), error = %error, "batch item failed");
                self.failures.push((source.to_path_buf(), format!("{error:#}")));
            }
        }
    }

    /// Aggregated outcome; any failed item fails the step but keeps the counts.
    pub fn into_outcome(self, noun: &str) -> HandlerOutcome {
        let Some((source, reason)) = self.failures.first() else {
            return HandlerOutcome::success(self.produced, self.bytes);
        };
        let message = format!(
            "{} of {} {noun} failed; first: {}: {reason}",
            self.failures.len(),
            self.attempted,
            source.display()
        );
        HandlerOutcome::partial_failure(self.produced, self.bytes, message)
    }
}

/// Image files under `input`: the file itself, or a directory's direct image
/// children sorted by path.
pub fn collect_batch_inputs(input: &Path) -> Result<Vec<PathBuf>> {
    let metadata = fs::metadata(input).with_context(|| format!("input '{}' is not readable", input.display()))?;
    if metadata.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(input).with_context(|| format!("failed to list '{}'", input.display()))? {
        let path = entry?.path();
        if path.is_file() && is_image_path(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Renders the output file name for one item.
///
/// `template` has already been substituted with step-wide bindings; this pass
/// fills in `counter` (the output ordinal) plus `extra` item names.
pub fn render_item_name(
    invocation: &HandlerInvocation<'_>,
    template: &str,
    ordinal: usize,
    extra: &TemplateBindings,
) -> Result<String> {
    let mut bindings = invocation.bindings.clone();
    bindings.insert("counter", ordinal);
    bindings.extend(extra);
    let name = substitute(template, &bindings)?;
    if name.trim().is_empty() || Path::new(&name).file_name().is_none() {
        bail!("output template '{template}' rendered an empty file name");
    }
    Ok(name)
}

/// `output_template` param or `default`.
pub fn output_template(invocation: &HandlerInvocation<'_>, default: &str) -> String {
    invocation
        .param_str(OUTPUT_TEMPLATE_KEY)
        .unwrap_or_else(|| default.to_string())
}

/// Lays out a batch over `input`; `extension` of `None` keeps each source's own.
pub fn plan_batch(invocation: &HandlerInvocation<'_>, input: &Path, extension: Option<&str>) -> Result<Vec<BatchItem>> {
    let sources = collect_batch_inputs(input)?;
    let template = output_template(invocation, DEFAULT_BATCH_TEMPLATE);
    let output_dir = invocation.output_dir();

    let mut items = Vec::with_capacity(sources.len());
    for (index, source) in sources.into_iter().enumerate() {
        let (input_name, input_ext) = imgpipe_util::file_stem_and_extension(&source);
        let extra = TemplateBindings::new()
            .with("input_name", input_name)
            .with("input_ext", input_ext.clone());
        let name = render_item_name(invocation, &template, index + 1, &extra)?;
        let extension = extension.map(str::to_string).unwrap_or(input_ext);
        let file_name = if extension.is_empty() { name } else { format!("{name}.{extension}") };
        items.push(BatchItem {
            source,
            ordinal: index + 1,
            target: output_dir.join(file_name),
        });
    }
    Ok(items)
}

/// Runs `job` over `items` on at most `jobs` threads, preserving item order.
pub fn run_parallel<T, R, F>(items: &[T], jobs: usize, job: F) -> Result<Vec<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    if jobs <= 1 || items.len() <= 1 {
        return Ok(items.iter().map(&job).collect());
    }
    let pool = ThreadPoolBuilder::new()
        .num_threads(jobs.min(items.len()))
        .build()
        .map_err(|error| anyhow!("failed to start worker pool: {error}"))?;
    Ok(pool.install(|| items.par_iter().map(&job).collect()))
}

/// Executes the command `build` produces for each item, then tallies written bytes.
pub fn run_batch<F>(invocation: &HandlerInvocation<'_>, items: &[BatchItem], build: F) -> Result<BatchReport>
where
    F: Fn(&BatchItem) -> Result<CommandSpec> + Sync + Send,
{
    let mut report = BatchReport::default();
    if items.is_empty() {
        warn!(step = invocation.step_name, "batch input contains no images");
        return Ok(report);
    }

    let output_dir = invocation.output_dir();
    fs::create_dir_all(&output_dir).with_context(|| format!("failed to create '{}'", output_dir.display()))?;
    debug!(
        step = invocation.step_name,
        items = items.len(),
        jobs = invocation.run_settings.parallel_jobs,
        "running batch"
    );

    let results = run_parallel(items, invocation.run_settings.parallel_jobs, |item| {
        let command = build(item)?;
        invocation.run_tool_checked(command)?;
        Ok(written_bytes(&item.target))
    })?;

    for (item, result) in items.iter().zip(results) {
        report.record(&item.source, result);
    }
    Ok(report)
}

/// Size of a produced file; 0 when it cannot be read.
pub fn written_bytes(path: &Path) -> u64 {
    fs::metadata(path).map(|metadata| metadata.len()).unwrap_or(0)
}

pub(crate) fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use imgpipe_types::StepType;
    use serde_json::json;

    use super::*;
    use crate::handlers::test_support::*;

    #[test]
    fn collects_sorted_images_only() {
        let directory = tempfile::tempdir().expect("tempdir");
        for name in ["b.png", "a.JPG", "notes.txt", "c.tiff"] {
            fs::write(directory.path().join(name), b"x").expect("write");
        }
        fs::create_dir(directory.path().join("nested.png")).expect("dir");

        let files = collect_batch_inputs(directory.path()).expect("collect");
        let names: Vec<_> = files
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.JPG", "b.png", "c.tiff"]);
    }

    #[test]
    fn missing_input_is_an_error() {
        let error = collect_batch_inputs(Path::new("/definitely/not/here")).expect_err("missing");
        assert!(error.to_string().contains("not readable"));
    }

    #[test]
    fn plan_uses_template_and_extension() {
        let input = tempfile::tempdir().expect("tempdir");
        let output = tempfile::tempdir().expect("tempdir");
        fs::write(input.path().join("scan.png"), b"x").expect("write");
        fs::write(input.path().join("photo.jpg"), b"x").expect("write");

        let parts = InvocationParts::new(
            params(&[("output_template", json!("{input_name}_{counter:02d}"))]),
            input.path(),
            output.path(),
        );
        let runner = ScriptedRunner::default();
        let invocation = parts.invocation(StepType::Convert, &runner);

        let items = plan_batch(&invocation, input.path(), Some("webp")).expect("plan");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].target, output.path().join("photo_01.webp"));
        assert_eq!(items[1].target, output.path().join("scan_02.webp"));

        let kept = plan_batch(&invocation, input.path(), None).expect("plan");
        assert_eq!(kept[0].target, output.path().join("photo_01.jpg"));
    }

    #[test]
    fn run_parallel_keeps_order_and_runs_everything() {
        let seen = AtomicUsize::new(0);
        let items: Vec<u32> = (1..=20).collect();
        let doubled = run_parallel(&items, 4, |item| {
            seen.fetch_add(1, Ordering::SeqCst);
            item * 2
        })
        .expect("pool");
        assert_eq!(seen.load(Ordering::SeqCst), 20);
        assert_eq!(doubled, (1..=20).map(|item| item * 2).collect::<Vec<_>>());
    }

    #[test]
    fn report_with_failures_is_partial() {
        let mut report = BatchReport::default();
        report.record(Path::new("a.png"), Ok(10));
        report.record(Path::new("b.png"), Err(anyhow!("bad pixels")));
        report.record(Path::new("c.png"), Ok(5));

        let outcome = report.into_outcome("images");
        assert!(!outcome.succeeded);
        assert_eq!(outcome.items_produced, 2);
        assert_eq!(outcome.bytes_produced, 15);
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("1 of 3 images failed; first: b.png: bad pixels")
        );
    }
}
