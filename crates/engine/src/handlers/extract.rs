//! Page and embedded-image extraction.
//!
//! Both handlers resolve their range spec against the source's item total,
//! number outputs by selection ordinal, and report partial output when some
//! items fail.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use imgpipe_types::HandlerOutcome;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use super::batch::{BatchReport, output_template, path_arg, render_item_name, run_parallel, written_bytes};
use super::{HandlerInvocation, StepHandler};
use crate::executor::runner::CommandSpec;
use crate::range::{RangeSpec, RangeUnit, Selection};
use crate::templates::TemplateBindings;

pub const DEFAULT_PDF_TEMPLATE: &str = "{pdf_name}_page_{counter:03d}";
pub const DEFAULT_EXCEL_TEMPLATE: &str = "{excel_name}_image_{counter:03d}";

const EXCEL_MEDIA_PREFIX: &str = "xl/media/";

static PDF_PAGES_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Pages:\s+(\d+)\s*$").expect("pdfinfo pages regex should compile"));

/// Reads a range param; missing or `all` selects everything.
fn range_param(invocation: &HandlerInvocation<'_>, key: &str) -> Result<RangeSpec> {
    match invocation.param_str(key) {
        None => Ok(RangeSpec::all()),
        Some(raw) if raw.eq_ignore_ascii_case("all") => Ok(RangeSpec::all()),
        Some(raw) => Ok(RangeSpec::parse(&raw)?),
    }
}

/// Selections for `spec`; without a total only explicit positions are usable.
fn select(spec: &RangeSpec, total: Option<u32>, noun: &str, step: &str) -> Result<Vec<Selection>> {
    let Some(total) = total else {
        if spec.has_open_end() {
            bail!("range '{spec}' is open-ended but the {noun} count is unknown");
        }
        let selections = spec
            .resolve(None)
            .into_iter()
            .filter_map(|unit| match unit {
                RangeUnit::Item(source) => Some(source),
                RangeUnit::From(_) => None,
            })
            .enumerate()
            .map(|(index, source)| Selection {
                source,
                ordinal: index + 1,
            })
            .collect();
        return Ok(selections);
    };

    let skipped = spec.out_of_bounds(total);
    if !skipped.is_empty() {
        warn!(step, range = %spec, total, skipped = ?skipped, "range selects {noun}s past the end; skipping them");
    }
    let selections = spec.selections(total);
    if selections.is_empty() {
        bail!("range '{spec}' selects none of the {total} {noun}s");
    }
    Ok(selections)
}

/// Rasterizes PDF pages with `pdfinfo` + `pdftoppm`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfExtractHandler;

impl PdfExtractHandler {
    fn page_count(invocation: &HandlerInvocation<'_>, input: &Path) -> Result<Option<u32>> {
        let command = CommandSpec::new(&invocation.tools.pdfinfo).arg(path_arg(input));
        let output = invocation.run_tool_checked(command)?;
        Ok(parse_page_count(&output.stdout))
    }
}

/// Page count from `pdfinfo` output.
pub fn parse_page_count(pdfinfo_output: &str) -> Option<u32> {
    PDF_PAGES_PATTERN
        .captures(pdfinfo_output)
        .and_then(|captures| captures[1].parse().ok())
}

/// `pdftoppm` device flag and file extension for an output format.
fn raster_device(format: &str) -> Result<(&'static str, &'static str)> {
    Ok(match format {
        "png" => ("-png", "png"),
        "jpg" | "jpeg" => ("-jpeg", "jpg"),
        "tif" | "tiff" => ("-tiff", "tif"),
        other => bail!("pdf_extract cannot write '{other}' images; use png, jpg or tiff"),
    })
}

impl StepHandler for PdfExtractHandler {
    fn run(&self, invocation: &HandlerInvocation<'_>) -> Result<HandlerOutcome> {
        let input = invocation.input_path_or(invocation.workflow_input);
        let spec = range_param(invocation, "pages")?;
        let (device, extension) = raster_device(&invocation.format())?;
        let dpi = match invocation.param_u64("dpi")? {
            Some(0) => bail!("param 'dpi' must be greater than zero"),
            Some(dpi) => dpi,
            None => u64::from(invocation.run_settings.dpi),
        };

        let total = Self::page_count(invocation, &input)?;
        if total.is_none() {
            warn!(step = invocation.step_name, input = %input.display(), "pdfinfo reported no page count");
        }
        let selections = select(&spec, total, "page", invocation.step_name)?;

        let template = output_template(invocation, DEFAULT_PDF_TEMPLATE);
        let output_dir = invocation.output_dir();
        fs::create_dir_all(&output_dir).with_context(|| format!("failed to create '{}'", output_dir.display()))?;
        debug!(step = invocation.step_name, pages = selections.len(), ?total, dpi, "extracting pdf pages");

        let (pdf_name, _) = imgpipe_util::file_stem_and_extension(&input);
        let results = run_parallel(&selections, invocation.run_settings.parallel_jobs, |selection| {
            let extra = TemplateBindings::new()
                .with("page", selection.source)
                .with("pdf_name", pdf_name.clone());
            let name = render_item_name(invocation, &template, selection.ordinal, &extra)?;
            let base = output_dir.join(&name);
            let page = selection.source.to_string();
            let command = CommandSpec::new(&invocation.tools.pdftoppm)
                .args(["-f", page.as_str(), "-l", page.as_str(), "-r"])
                .arg(dpi.to_string())
                .args([device, "-singlefile"])
                .arg(path_arg(&input))
                .arg(path_arg(&base));
            invocation.run_tool_checked(command)?;
            Ok(written_bytes(&output_dir.join(format!("{name}.{extension}"))))
        })?;

        let mut report = BatchReport::default();
        for (selection, result) in selections.iter().zip(results) {
            let source = PathBuf::from(format!("page {}", selection.source));
            report.record(&source, result);
        }
        Ok(report.into_outcome("pages"))
    }
}

/// Copies images embedded under `xl/media/` out of a workbook with `unzip`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExcelExtractHandler;

impl ExcelExtractHandler {
    fn media_entries(invocation: &HandlerInvocation<'_>, input: &Path) -> Result<Vec<String>> {
        let command = CommandSpec::new(&invocation.tools.unzip).arg("-Z1").arg(path_arg(input));
        let output = invocation.run_tool_checked(command)?;
        Ok(media_entries(&output.stdout))
    }

    fn extract_entry(invocation: &HandlerInvocation<'_>, input: &Path, entry: &str, staging: &Path, target: &Path) -> Result<u64> {
        let command = CommandSpec::new(&invocation.tools.unzip)
            .args(["-o", "-j", "-qq"])
            .arg(path_arg(input))
            .arg(entry)
            .arg("-d")
            .arg(path_arg(staging));
        invocation.run_tool_checked(command)?;

        let file_name = entry.rsplit('/').next().unwrap_or(entry);
        let extracted = staging.join(file_name);
        move_file(&extracted, target)?;
        Ok(written_bytes(target))
    }
}

/// Workbook media entries from `unzip -Z1` output, in natural order.
pub fn media_entries(listing: &str) -> Vec<String> {
    let mut entries: Vec<String> = listing
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with(EXCEL_MEDIA_PREFIX) && !line.ends_with('/'))
        .map(str::to_string)
        .collect();
    entries.sort_by(|left, right| natural_cmp(left, right));
    entries
}

/// Orders digit runs numerically so `image2` sorts before `image10`.
fn natural_cmp(left: &str, right: &str) -> Ordering {
    let left_chunks = natural_chunks(left);
    let right_chunks = natural_chunks(right);
    for (a, b) in left_chunks.iter().zip(&right_chunks) {
        let ordering = match (a.parse::<u64>(), b.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => a.cmp(b),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left_chunks.len().cmp(&right_chunks.len())
}

fn natural_chunks(text: &str) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut previous_digit: Option<bool> = None;
    for (index, character) in text.char_indices() {
        let digit = character.is_ascii_digit();
        if let Some(previous) = previous_digit
            && previous != digit
        {
            chunks.push(&text[start..index]);
            start = index;
        }
        previous_digit = Some(digit);
    }
    if start < text.len() {
        chunks.push(&text[start..]);
    }
    chunks
}

fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).with_context(|| format!("failed to move '{}' to '{}'", from.display(), to.display()))?;
    fs::remove_file(from).with_context(|| format!("failed to remove '{}'", from.display()))?;
    Ok(())
}

impl StepHandler for ExcelExtractHandler {
    fn run(&self, invocation: &HandlerInvocation<'_>) -> Result<HandlerOutcome> {
        let input = invocation.input_path_or(invocation.workflow_input);
        let spec = range_param(invocation, "items")?;

        let entries = Self::media_entries(invocation, &input)?;
        if entries.is_empty() {
            return Ok(HandlerOutcome::failure(format!(
                "'{}' contains no embedded images",
                input.display()
            )));
        }
        let total = u32::try_from(entries.len()).unwrap_or(u32::MAX);
        let selections = select(&spec, Some(total), "image", invocation.step_name)?;

        let template = output_template(invocation, DEFAULT_EXCEL_TEMPLATE);
        let output_dir = invocation.output_dir();
        let staging = invocation.run_settings.temp_dir.join(invocation.step_name);
        for directory in [&output_dir, &staging] {
            fs::create_dir_all(directory).with_context(|| format!("failed to create '{}'", directory.display()))?;
        }
        debug!(step = invocation.step_name, images = selections.len(), total, "extracting workbook images");

        let (excel_name, _) = imgpipe_util::file_stem_and_extension(&input);
        let mut report = BatchReport::default();
        for selection in &selections {
            let entry = &entries[selection.source as usize - 1];
            let result = (|| {
                let extension = Path::new(entry)
                    .extension()
                    .map(|extension| extension.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let extra = TemplateBindings::new()
                    .with("item", selection.source)
                    .with("excel_name", excel_name.clone());
                let name = render_item_name(invocation, &template, selection.ordinal, &extra)?;
                let file_name = if extension.is_empty() { name } else { format!("{name}.{extension}") };
                Self::extract_entry(invocation, &input, entry, &staging, &output_dir.join(file_name))
            })();
            report.record(Path::new(entry), result);
        }

        if let Err(error) = fs::remove_dir_all(&staging) {
            debug!(staging = %staging.display(), error = %error, "could not remove staging directory");
        }
        Ok(report.into_outcome("images"))
    }
}
