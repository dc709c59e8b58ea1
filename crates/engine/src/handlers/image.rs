//! Raster operations delegated to ImageMagick.

use anyhow::{Result, bail};
use imgpipe_types::HandlerOutcome;

use super::batch::{BatchItem, path_arg, plan_batch, run_batch};
use super::{HandlerInvocation, StepHandler};
use crate::executor::runner::CommandSpec;

const DEFAULT_GRAVITY: &str = "southeast";
const DEFAULT_FONT_SIZE: u64 = 24;
const DEFAULT_FILL: &str = "white";
const DEFAULT_MARGIN: u64 = 10;
const GRAVITIES: [&str; 9] = [
    "northwest", "north", "northeast", "west", "center", "east", "southwest", "south", "southeast",
];

fn magick(invocation: &HandlerInvocation<'_>, item: &BatchItem) -> CommandSpec {
    CommandSpec::new(&invocation.tools.magick).arg(path_arg(&item.source))
}

/// Output extension: the `format` param when given, else each source's own.
fn explicit_format(invocation: &HandlerInvocation<'_>) -> Option<String> {
    invocation
        .param_str("format")
        .map(|format| format.trim_start_matches('.').to_ascii_lowercase())
}

/// Re-encodes images into `format` (default from settings) at an optional quality.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConvertHandler;

impl StepHandler for ConvertHandler {
    fn run(&self, invocation: &HandlerInvocation<'_>) -> Result<HandlerOutcome> {
        let format = invocation.format();
        let quality = match invocation.param_u64("quality")? {
            Some(quality) if quality > 100 => bail!("param 'quality' must be between 0 and 100"),
            Some(quality) => Some(quality),
            None => invocation.run_settings.quality.map(u64::from),
        };

        let input = invocation.input_path_or(invocation.working_set);
        let items = plan_batch(invocation, &input, Some(&format))?;
        let report = run_batch(invocation, &items, |item| {
            let mut command = magick(invocation, item);
            if let Some(quality) = quality {
                command = command.arg("-quality").arg(quality.to_string());
            }
            Ok(command.arg(path_arg(&item.target)))
        })?;
        Ok(report.into_outcome("images"))
    }
}

/// ImageMagick geometry from `width`/`height` or `scale` params.
///
/// `keep_aspect: false` forces exact dimensions.
pub fn resize_geometry(width: Option<u64>, height: Option<u64>, scale: Option<u64>, keep_aspect: bool) -> Result<String> {
    if let Some(scale) = scale {
        if width.is_some() || height.is_some() {
            bail!("resize takes either 'scale' or 'width'/'height', not both");
        }
        if scale == 0 {
            bail!("param 'scale' must be greater than zero");
        }
        return Ok(format!("{scale}%"));
    }
    let geometry = match (width, height) {
        (Some(0), _) | (_, Some(0)) => bail!("resize dimensions must be greater than zero"),
        (Some(width), Some(height)) => format!("{width}x{height}"),
        (Some(width), None) => width.to_string(),
        (None, Some(height)) => format!("x{height}"),
        (None, None) => bail!("resize needs 'width', 'height' or 'scale'"),
    };
    if !keep_aspect && width.is_some() && height.is_some() {
        return Ok(format!("{geometry}!"));
    }
    Ok(geometry)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ResizeHandler;

impl StepHandler for ResizeHandler {
    fn run(&self, invocation: &HandlerInvocation<'_>) -> Result<HandlerOutcome> {
        let geometry = resize_geometry(
            invocation.param_u64("width")?,
            invocation.param_u64("height")?,
            invocation.param_u64("scale")?,
            invocation.param_bool("keep_aspect")?.unwrap_or(true),
        )?;

        let input = invocation.input_path_or(invocation.working_set);
        let format = explicit_format(invocation);
        let items = plan_batch(invocation, &input, format.as_deref())?;
        let report = run_batch(invocation, &items, |item| {
            Ok(magick(invocation, item)
                .arg("-resize")
                .arg(geometry.clone())
                .arg(path_arg(&item.target)))
        })?;
        Ok(report.into_outcome("images"))
    }
}

/// Stamps a text or image watermark.
#[derive(Debug, Default, Clone, Copy)]
pub struct WatermarkHandler;

impl StepHandler for WatermarkHandler {
    fn run(&self, invocation: &HandlerInvocation<'_>) -> Result<HandlerOutcome> {
        let gravity = invocation
            .param_str("gravity")
            .unwrap_or_else(|| DEFAULT_GRAVITY.to_string())
            .to_ascii_lowercase();
        if !GRAVITIES.contains(&gravity.as_str()) {
            bail!("unknown gravity '{gravity}'");
        }
        let margin = invocation.param_u64("margin")?.unwrap_or(DEFAULT_MARGIN);
        let offset = format!("+{margin}+{margin}");

        let text = invocation.param_str("text");
        let image = invocation.param_str("image").map(|image| imgpipe_util::expand_tilde(&image));
        let stamp: Vec<String> = match (text, image) {
            (Some(_), Some(_)) => bail!("watermark takes either 'text' or 'image', not both"),
            (None, None) => bail!("watermark needs 'text' or 'image'"),
            (Some(text), None) => {
                let size = invocation.param_u64("font_size")?.unwrap_or(DEFAULT_FONT_SIZE);
                let fill = invocation.param_str("color").unwrap_or_else(|| DEFAULT_FILL.to_string());
                let mut args = vec!["-gravity".to_string(), gravity, "-pointsize".to_string(), size.to_string()];
                args.extend(["-fill".to_string(), fill]);
                if let Some(font) = invocation.param_str("font") {
                    args.extend(["-font".to_string(), font]);
                }
                args.extend(["-annotate".to_string(), offset, text]);
                args
            }
            (None, Some(image)) => {
                let mut args = vec![path_arg(&image), "-gravity".to_string(), gravity, "-geometry".to_string(), offset];
                if let Some(opacity) = invocation.param_u64("opacity")? {
                    if opacity > 100 {
                        bail!("param 'opacity' must be between 0 and 100");
                    }
                    args.extend(["-compose".to_string(), "dissolve".to_string()]);
                    args.extend(["-define".to_string(), format!("compose:args={opacity}")]);
                }
                args.push("-composite".to_string());
                args
            }
        };

        let input = invocation.input_path_or(invocation.working_set);
        let format = explicit_format(invocation);
        let items = plan_batch(invocation, &input, format.as_deref())?;
        let report = run_batch(invocation, &items, |item| {
            Ok(magick(invocation, item).args(stamp.iter().cloned()).arg(path_arg(&item.target)))
        })?;
        Ok(report.into_outcome("images"))
    }
}
