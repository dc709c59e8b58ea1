//! Engine configuration and typed run settings.
//!
//! [`EngineConfig`] is an explicit value loaded once and handed to
//! [`crate::Engine::new`]. [`RunSettings`] is derived per run from the resolved
//! workflow `settings`, caller overrides, and the config defaults, in that
//! order of precedence.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dirs_next::config_dir;
use imgpipe_types::workflow::ValueMap;
use imgpipe_util::expand_tilde;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ConfigError, ValidationError};
use crate::templates::{MAX_PAD_WIDTH, TemplateBindings, substitute};

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "IMGPIPE_CONFIG_PATH";

const DEFAULT_COUNTER_WIDTH: usize = 3;
const DEFAULT_DPI: u32 = 300;
const DEFAULT_FORMAT: &str = "png";

/// Program names for the external tools handlers and hooks invoke.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ToolPaths {
    pub magick: String,
    pub pdfinfo: String,
    pub pdftoppm: String,
    pub unzip: String,
    pub tesseract: String,
    pub shell: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            magick: "magick".to_string(),
            pdfinfo: "pdfinfo".to_string(),
            pdftoppm: "pdftoppm".to_string(),
            unzip: "unzip".to_string(),
            tesseract: "tesseract".to_string(),
            shell: "sh".to_string(),
        }
    }
}

/// Process-level configuration for the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Directory searched for workflow documents by name.
    pub workflows_dir: PathBuf,
    /// Directory searched for preset documents by name.
    pub presets_dir: PathBuf,
    /// Used when neither overrides nor settings name an output directory.
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub stop_on_failure: bool,
    /// Default per-step timeout.
    pub step_timeout_secs: Option<u64>,
    pub counter_width: usize,
    pub tools: ToolPaths,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let base = config_dir().unwrap_or_else(|| PathBuf::from(".")).join("imgpipe");
        Self {
            workflows_dir: base.join("workflows"),
            presets_dir: base.join("presets"),
            output_dir: PathBuf::from("./output"),
            temp_dir: env::temp_dir().join("imgpipe"),
            stop_on_failure: false,
            step_timeout_secs: None,
            counter_width: DEFAULT_COUNTER_WIDTH,
            tools: ToolPaths::default(),
        }
    }
}

impl EngineConfig {
    /// Expands `~` in every configured path.
    fn expand_paths(mut self) -> Self {
        for path in [
            &mut self.workflows_dir,
            &mut self.presets_dir,
            &mut self.output_dir,
            &mut self.temp_dir,
        ] {
            let expanded = expand_tilde(&path.to_string_lossy());
            *path = expanded;
        }
        self
    }
}

/// Returns the default path for the configuration file.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_ENV)
        && !path.trim().is_empty()
    {
        return expand_tilde(&path);
    }

    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("imgpipe")
        .join("config.yaml")
}

/// Loads configuration from the default path.
pub fn load_config() -> Result<EngineConfig, ConfigError> {
    load_config_from_path(&default_config_path())
}

/// Loads configuration from `path`; a missing file yields the defaults.
pub fn load_config_from_path(path: &Path) -> Result<EngineConfig, ConfigError> {
    if !path.exists() {
        return Ok(EngineConfig::default());
    }

    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if content.trim().is_empty() {
        return Ok(EngineConfig::default());
    }
    let config: EngineConfig = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(config.expand_paths())
}

/// Typed view of the settings the engine itself understands.
///
/// Keys not listed here stay available to handlers through the raw settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
    /// Concurrency hint for batch handlers; at least 1.
    pub parallel_jobs: usize,
    /// Per-step wall-clock limit.
    pub timeout: Option<Duration>,
    pub stop_on_failure: bool,
    pub counter_width: usize,
    pub quality: Option<u32>,
    pub dpi: u32,
    pub format: String,
}

impl RunSettings {
    /// Builds settings from a merged settings map over `config` defaults.
    ///
    /// Directory values may use run-wide placeholders such as `{date}`.
    pub fn resolve(settings: &ValueMap, config: &EngineConfig, bindings: &TemplateBindings) -> Result<Self, ValidationError> {
        let output_dir = match setting_string(settings, "output_dir")? {
            Some(raw) => expand_tilde(&substitute(&raw, bindings)?),
            None => config.output_dir.clone(),
        };
        let temp_dir = match setting_string(settings, "temp_dir")? {
            Some(raw) => expand_tilde(&substitute(&raw, bindings)?),
            None => config.temp_dir.clone(),
        };

        let parallel_jobs = match setting_u64(settings, "parallel_jobs")? {
            Some(jobs) => Some(jobs),
            None => setting_u64(settings, "max_parallel")?,
        };
        let parallel_jobs = usize::try_from(parallel_jobs.unwrap_or(1).max(1))
            .map_err(|_| ValidationError::setting("parallel_jobs", "value is too large"))?;

        let timeout = setting_u64(settings, "timeout")?
            .or(config.step_timeout_secs)
            .filter(|seconds| *seconds > 0)
            .map(Duration::from_secs);

        let counter_width = match setting_u64(settings, "counter_width")? {
            Some(width) if width as usize > MAX_PAD_WIDTH => {
                return Err(ValidationError::setting(
                    "counter_width",
                    format!("must be at most {MAX_PAD_WIDTH}"),
                ));
            }
            Some(width) => width as usize,
            None => config.counter_width,
        };

        let quality = match setting_u64(settings, "quality")? {
            Some(quality) if quality > 100 => {
                return Err(ValidationError::setting("quality", "must be between 0 and 100"));
            }
            Some(quality) => Some(quality as u32),
            None => None,
        };

        let dpi = match setting_u64(settings, "dpi")? {
            Some(0) => return Err(ValidationError::setting("dpi", "must be greater than zero")),
            Some(dpi) => u32::try_from(dpi).map_err(|_| ValidationError::setting("dpi", "value is too large"))?,
            None => DEFAULT_DPI,
        };

        Ok(Self {
            output_dir,
            temp_dir,
            parallel_jobs,
            timeout,
            stop_on_failure: setting_bool(settings, "stop_on_failure")?.unwrap_or(config.stop_on_failure),
            counter_width,
            quality,
            dpi,
            format: setting_string(settings, "format")?.unwrap_or_else(|| DEFAULT_FORMAT.to_string()),
        })
    }
}

/// Overlays `overrides` onto `settings`; override keys win.
pub fn apply_overrides(settings: &ValueMap, overrides: &ValueMap) -> ValueMap {
    let mut merged = settings.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Parses a `key=value` override, reading the value as YAML so numbers and
/// booleans keep their type.
pub fn parse_override(raw: &str) -> Result<(String, Value), ValidationError> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(ValidationError::setting(raw, "expected key=value"));
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(ValidationError::setting(raw, "key cannot be empty"));
    }
    let value = serde_yaml::from_str::<Value>(value).unwrap_or_else(|_| Value::String(value.to_string()));
    let value = match value {
        Value::Null => Value::String(String::new()),
        other => other,
    };
    Ok((key.to_string(), value))
}

fn setting_string(settings: &ValueMap, key: &str) -> Result<Option<String>, ValidationError> {
    match settings.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.clone())),
        Some(Value::Number(number)) => Ok(Some(number.to_string())),
        Some(_) => Err(ValidationError::setting(key, "expected a string")),
    }
}

fn setting_u64(settings: &ValueMap, key: &str) -> Result<Option<u64>, ValidationError> {
    match settings.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => number
            .as_u64()
            .map(Some)
            .ok_or_else(|| ValidationError::setting(key, "expected a non-negative integer")),
        Some(Value::String(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ValidationError::setting(key, format!("'{text}' is not a non-negative integer"))),
        Some(_) => Err(ValidationError::setting(key, "expected a non-negative integer")),
    }
}

fn setting_bool(settings: &ValueMap, key: &str) -> Result<Option<bool>, ValidationError> {
    match settings.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(flag)) => Ok(Some(*flag)),
        Some(Value::String(text)) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(Some(true)),
            "false" | "no" | "off" | "0" => Ok(Some(false)),
            _ => Err(ValidationError::setting(key, format!("'{text}' is not a boolean"))),
        },
        Some(_) => Err(ValidationError::setting(key, "expected a boolean")),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn settings(entries: &[(&str, Value)]) -> ValueMap {
        entries.iter().map(|(key, value)| (key.to_string(), value.clone())).collect()
    }

    #[test]
    fn default_path_honors_environment_override() {
        let override_path = "~/custom/imgpipe/config.yaml";
        temp_env::with_var(CONFIG_PATH_ENV, Some(override_path), || {
            assert_eq!(default_config_path(), expand_tilde(override_path));
        });
    }

    #[test]
    fn missing_file_yields_defaults() {
        let directory = tempfile::tempdir().expect("tempdir");
        let config = load_config_from_path(&directory.path().join("absent.yaml")).expect("defaults");
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn loads_partial_config() {
        let directory = tempfile::tempdir().expect("tempdir");
        let path = directory.path().join("config.yaml");
        fs::write(
            &path,
            "workflows_dir: /srv/workflows\nstop_on_failure: true\ntools:\n  magick: /opt/im/magick\n",
        )
        .expect("write config");

        let config = load_config_from_path(&path).expect("config");

        assert_eq!(config.workflows_dir, PathBuf::from("/srv/workflows"));
        assert!(config.stop_on_failure);
        assert_eq!(config.tools.magick, "/opt/im/magick");
        assert_eq!(config.tools.pdftoppm, "pdftoppm");
        assert_eq!(config.counter_width, 3);
    }

    #[test]
    fn rejects_unknown_config_keys() {
        let directory = tempfile::tempdir().expect("tempdir");
        let path = directory.path().join("config.yaml");
        fs::write(&path, "workflow_dir: /typo\n").expect("write config");
        assert!(matches!(load_config_from_path(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn settings_fall_back_to_config() {
        let config = EngineConfig {
            step_timeout_secs: Some(30),
            ..EngineConfig::default()
        };
        let resolved = RunSettings::resolve(&ValueMap::new(), &config, &TemplateBindings::new()).expect("settings");
        assert_eq!(resolved.output_dir, config.output_dir);
        assert_eq!(resolved.parallel_jobs, 1);
        assert_eq!(resolved.timeout, Some(Duration::from_secs(30)));
        assert_eq!(resolved.dpi, 300);
        assert_eq!(resolved.format, "png");
        assert!(!resolved.stop_on_failure);
    }

    #[test]
    fn settings_accept_aliases_and_templates() {
        let bindings = TemplateBindings::new().with("workflow_name", "scan");
        let values = settings(&[
            ("output_dir", json!("/out/{workflow_name}")),
            ("max_parallel", json!(4)),
            ("timeout", json!("90")),
            ("stop_on_failure", json!("yes")),
            ("quality", json!(85)),
        ]);
        let resolved = RunSettings::resolve(&values, &EngineConfig::default(), &bindings).expect("settings");
        assert_eq!(resolved.output_dir, PathBuf::from("/out/scan"));
        assert_eq!(resolved.parallel_jobs, 4);
        assert_eq!(resolved.timeout, Some(Duration::from_secs(90)));
        assert!(resolved.stop_on_failure);
        assert_eq!(resolved.quality, Some(85));
    }

    #[test]
    fn invalid_setting_types_are_rejected() {
        let values = settings(&[("parallel_jobs", json!("many"))]);
        let error = RunSettings::resolve(&values, &EngineConfig::default(), &TemplateBindings::new()).expect_err("invalid");
        assert!(matches!(error, ValidationError::Setting { ref key, .. } if key == "parallel_jobs"));

        let values = settings(&[("quality", json!(140))]);
        assert!(RunSettings::resolve(&values, &EngineConfig::default(), &TemplateBindings::new()).is_err());
    }

    #[test]
    fn overrides_win_over_settings() {
        let base = settings(&[("quality", json!(80)), ("format", json!("jpg"))]);
        let (key, value) = parse_override("quality=95").expect("override");
        let merged = apply_overrides(&base, &settings(&[(key.as_str(), value)]));
        assert_eq!(merged["quality"], json!(95));
        assert_eq!(merged["format"], json!("jpg"));
    }

    #[test]
    fn parse_override_keeps_scalar_types() {
        assert_eq!(parse_override("stop_on_failure=true").expect("bool").1, json!(true));
        assert_eq!(parse_override("output_dir=/tmp/x").expect("text").1, json!("/tmp/x"));
        assert!(parse_override("novalue").is_err());
    }
}
