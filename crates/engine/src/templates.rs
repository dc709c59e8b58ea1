//! Placeholder substitution for step params, hook commands, and output names.
//!
//! Placeholders use `{name}` or `{name:spec}`. The only supported spec is zero
//! padding to a width (`03d`, `3`, `03`). Names without a binding are left
//! verbatim so that later passes (or the shell) can see them; a malformed spec
//! on a bound name is a [`ValidationError`].

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::errors::ValidationError;

static PLACEHOLDER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)(?::([^{}]*))?\}").expect("placeholder regex should compile"));

/// Widest zero-padding accepted in a format spec.
pub const MAX_PAD_WIDTH: usize = 32;

/// Names only known while a handler iterates its items. `pdf_name` and
/// `excel_name` follow the handler's actual input, not the workflow input.
pub const ITEM_SCOPED_NAMES: [&str; 7] = ["counter", "input_name", "input_ext", "page", "item", "pdf_name", "excel_name"];

/// Param key whose substitution is deferred to the handler's per-item pass.
pub const OUTPUT_TEMPLATE_KEY: &str = "output_template";

/// Every name the engine or a built-in handler may bind.
pub const KNOWN_NAMES: [&str; 24] = [
    "workflow_input",
    "output_dir",
    "temp_dir",
    "timestamp",
    "date",
    "time",
    "workflow_name",
    "step_name",
    "step_number",
    "counter",
    "counter_padded",
    "input_name",
    "input_ext",
    "pdf_name",
    "excel_name",
    "page",
    "item",
    "image_count",
    "total_size",
    "processed_count",
    "failed_count",
    "extracted_count",
    "error_message",
    "failed_step",
];

/// Names that are always bound to text and so can never take a pad spec.
pub const TEXT_NAMES: [&str; 14] = [
    "workflow_input",
    "output_dir",
    "temp_dir",
    "timestamp",
    "date",
    "time",
    "workflow_name",
    "step_name",
    "input_name",
    "input_ext",
    "pdf_name",
    "excel_name",
    "error_message",
    "failed_step",
];

/// A value bound to a placeholder name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingValue {
    Text(String),
    Integer(i64),
}

impl BindingValue {
    /// Value as inserted by a plain `{name}` placeholder.
    pub fn render_plain(&self) -> String {
        match self {
            BindingValue::Text(text) => text.clone(),
            BindingValue::Integer(number) => number.to_string(),
        }
    }

    fn as_integer(&self) -> Option<i64> {
        match self {
            BindingValue::Integer(number) => Some(*number),
            BindingValue::Text(text) => text.trim().parse().ok(),
        }
    }
}

impl From<&str> for BindingValue {
    fn from(value: &str) -> Self {
        BindingValue::Text(value.to_string())
    }
}

impl From<String> for BindingValue {
    fn from(value: String) -> Self {
        BindingValue::Text(value)
    }
}

impl From<i64> for BindingValue {
    fn from(value: i64) -> Self {
        BindingValue::Integer(value)
    }
}

impl From<u64> for BindingValue {
    fn from(value: u64) -> Self {
        BindingValue::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<u32> for BindingValue {
    fn from(value: u32) -> Self {
        BindingValue::Integer(i64::from(value))
    }
}

impl From<usize> for BindingValue {
    fn from(value: usize) -> Self {
        BindingValue::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

/// Ordered name to value table used for one substitution pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateBindings {
    values: IndexMap<String, BindingValue>,
}

impl TemplateBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<BindingValue>) {
        self.values.insert(name.into(), value.into());
    }

    /// Builder form of [`TemplateBindings::insert`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<BindingValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&BindingValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<BindingValue> {
        self.values.shift_remove(name)
    }

    /// Copy of these bindings with the given names removed.
    pub fn without(&self, names: &[&str]) -> Self {
        let values = self
            .values
            .iter()
            .filter(|(name, _)| !names.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Self { values }
    }

    /// Overlays `other`; its values win.
    pub fn extend(&mut self, other: &TemplateBindings) {
        for (name, value) in &other.values {
            self.values.insert(name.clone(), value.clone());
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BindingValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }
}

/// A placeholder occurrence found in a template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub name: String,
    pub spec: Option<String>,
}

/// Lists the placeholders in `template` in order of appearance.
pub fn extract_placeholders(template: &str) -> Vec<Placeholder> {
    PLACEHOLDER_PATTERN
        .captures_iter(template)
        .map(|captures| Placeholder {
            name: captures[1].to_string(),
            spec: captures.get(2).map(|spec| spec.as_str().to_string()),
        })
        .collect()
}

/// Returns true when `text` contains at least one placeholder.
pub fn contains_placeholder(text: &str) -> bool {
    PLACEHOLDER_PATTERN.is_match(text)
}

/// Replaces every bound placeholder in `template`.
///
/// Substitution is a single pass: text produced by a binding is never
/// re-scanned, so a value containing `{...}` is inserted literally.
pub fn substitute(template: &str, bindings: &TemplateBindings) -> Result<String, ValidationError> {
    let mut output = String::with_capacity(template.len());
    let mut last_end = 0usize;

    for captures in PLACEHOLDER_PATTERN.captures_iter(template) {
        let name = &captures[1];
        let Some(value) = bindings.get(name) else {
            continue;
        };
        let Some(whole) = captures.get(0) else {
            continue;
        };
        output.push_str(&template[last_end..whole.start()]);
        match captures.get(2) {
            Some(spec) => output.push_str(&render_formatted(name, spec.as_str(), value)?),
            None => output.push_str(&value.render_plain()),
        }
        last_end = whole.end();
    }

    output.push_str(&template[last_end..]);
    Ok(output)
}

/// Applies [`substitute`] to every string inside a JSON value.
pub fn interpolate_value(value: &Value, bindings: &TemplateBindings) -> Result<Value, ValidationError> {
    Ok(match value {
        Value::String(text) => Value::String(substitute(text, bindings)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| interpolate_value(item, bindings))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut interpolated = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                interpolated.insert(key.clone(), interpolate_value(item, bindings)?);
            }
            Value::Object(interpolated)
        }
        other => other.clone(),
    })
}

/// Substitutes a step's params.
///
/// The `output_template` value is substituted with the item-scoped names held
/// back, so a handler can resolve `{counter}`, `{page}` and friends per item.
pub fn interpolate_params(
    params: &IndexMap<String, Value>,
    bindings: &TemplateBindings,
) -> Result<IndexMap<String, Value>, ValidationError> {
    let step_scoped = bindings.without(&ITEM_SCOPED_NAMES);
    params
        .iter()
        .map(|(key, value)| {
            let scope = if key == OUTPUT_TEMPLATE_KEY { &step_scoped } else { bindings };
            interpolate_value(value, scope).map(|value| (key.clone(), value))
        })
        .collect()
}

/// Checks the format spec of every known placeholder in `template`.
pub fn validate_template(template: &str) -> Result<(), ValidationError> {
    for placeholder in extract_placeholders(template) {
        let name = placeholder.name.as_str();
        let Some(spec) = placeholder.spec.as_deref() else {
            continue;
        };
        if !KNOWN_NAMES.contains(&name) {
            continue;
        }
        parse_pad_width(name, spec)?;
        if TEXT_NAMES.contains(&name) {
            return Err(ValidationError::format_spec(name, spec, "padding requires a numeric value"));
        }
    }
    Ok(())
}

/// Recursively validates every string inside a JSON value.
pub fn validate_value_templates(value: &Value) -> Result<(), ValidationError> {
    match value {
        Value::String(text) => validate_template(text),
        Value::Array(items) => items.iter().try_for_each(validate_value_templates),
        Value::Object(map) => map.values().try_for_each(validate_value_templates),
        _ => Ok(()),
    }
}

/// Parses a zero-pad spec into its width.
pub fn parse_pad_width(name: &str, spec: &str) -> Result<usize, ValidationError> {
    let digits = spec.strip_suffix('d').unwrap_or(spec);
    if digits.is_empty() {
        return Err(ValidationError::format_spec(name, spec, "expected a width such as '03d'"));
    }
    if !digits.chars().all(|character| character.is_ascii_digit()) {
        return Err(ValidationError::format_spec(
            name,
            spec,
            "only zero-padded integer widths are supported",
        ));
    }
    let width: usize = digits
        .parse()
        .map_err(|_| ValidationError::format_spec(name, spec, "width is not a number"))?;
    if width > MAX_PAD_WIDTH {
        return Err(ValidationError::format_spec(
            name,
            spec,
            format!("width exceeds {MAX_PAD_WIDTH}"),
        ));
    }
    Ok(width)
}

/// Zero-pads `value` to `width` digits.
pub fn pad_number(value: i64, width: usize) -> String {
    format!("{value:0width$}")
}

fn render_formatted(name: &str, spec: &str, value: &BindingValue) -> Result<String, ValidationError> {
    let width = parse_pad_width(name, spec)?;
    let number = value
        .as_integer()
        .ok_or_else(|| ValidationError::format_spec(name, spec, "padding requires a numeric value"))?;
    Ok(pad_number(number, width))
}
