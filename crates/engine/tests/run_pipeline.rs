use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use imgpipe_engine::{
    CommandOutput, CommandRunner, CommandSpec, DryRunRunner, Engine, EngineConfig, EngineError, HandlerRegistry, LoadError,
    RunStatus, RunTarget, StepPhase, ValidationError,
};
use imgpipe_types::workflow::ValueMap;
use tempfile::TempDir;

/// Stands in for pdfinfo, pdftoppm, magick and sh.
///
/// Rasterized pages are written as 100-byte files; any `magick -resize` call
/// fails.
#[derive(Default)]
struct FakeToolchain {
    calls: Mutex<Vec<CommandSpec>>,
}

impl FakeToolchain {
    fn calls_to(&self, program: &str) -> Vec<CommandSpec> {
        self.calls
            .lock()
            .expect("lock")
            .iter()
            .filter(|call| call.program == program)
            .cloned()
            .collect()
    }

    fn shell_scripts(&self) -> Vec<String> {
        self.calls_to("sh")
            .into_iter()
            .filter_map(|call| call.args.last().cloned())
            .collect()
    }
}

impl CommandRunner for FakeToolchain {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().expect("lock").push(command.clone());
        match command.program.as_str() {
            "pdfinfo" => Ok(CommandOutput::success("Producer: scanner\nPages:          3\n")),
            "pdftoppm" => {
                let base = command.args.last().cloned().unwrap_or_default();
                fs::write(format!("{base}.png"), [0u8; 100])?;
                Ok(CommandOutput::success(""))
            }
            "magick" if command.args.iter().any(|arg| arg == "-resize") => {
                Ok(CommandOutput::failure(1, "magick: unable to open image"))
            }
            _ => Ok(CommandOutput::success("")),
        }
    }
}

struct Fixture {
    root: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        for dir in ["workflows", "presets"] {
            fs::create_dir_all(root.path().join(dir)).expect("definition dir");
        }
        Self { root }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.root.path().join(relative)
    }

    fn write(&self, relative: &str, content: &str) {
        fs::write(self.path(relative), content).expect("write definition");
    }

    fn write_scan_workflow(&self, pages: &str) {
        self.write(
            "workflows/scan.yaml",
            &format!(
                r#"name: scan
description: Rasterize a scan and publish it
settings:
  output_dir: "{output}"
  temp_dir: "{temp}"
steps:
  - name: extract
    type: pdf_extract
    params:
      pages: "{pages}"
  - name: shrink
    type: resize
    params:
      width: 300
      height: 200
  - name: publish
    type: custom
    condition: "image_count >= 2 && total_size < 1MB"
    params:
      script: "publish {{workflow_name}} {{image_count}}"
hooks:
  post_step:
    - "echo done {{step_name}}"
  on_failure:
    - "notify {{failed_step}}"
"#,
                output = self.path("out").display(),
                temp = self.path("tmp").display(),
            ),
        );
    }

    fn engine(&self, runner: Arc<dyn CommandRunner>) -> Engine {
        let config = EngineConfig {
            workflows_dir: self.path("workflows"),
            presets_dir: self.path("presets"),
            output_dir: self.path("default-out"),
            temp_dir: self.path("default-tmp"),
            ..EngineConfig::default()
        };
        Engine::new(config, HandlerRegistry::standard(), runner)
    }
}

fn input() -> &'static Path {
    Path::new("/scans/report.pdf")
}

#[test]
fn failed_step_does_not_stop_later_steps() {
    let fixture = Fixture::new();
    fixture.write_scan_workflow("1-2");
    let tools = Arc::new(FakeToolchain::default());
    let engine = fixture.engine(tools.clone());

    let result = engine
        .run(&RunTarget::from("scan"), input(), &ValueMap::new())
        .expect("run");

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!((result.total, result.processed, result.failed), (3, 2, 1));
    assert_eq!(result.exit_code(), 1);

    let phases: Vec<_> = result.steps.iter().map(|step| step.phase).collect();
    assert_eq!(phases, vec![StepPhase::Succeeded, StepPhase::Failed, StepPhase::Succeeded]);
    assert_eq!(result.context.extracted_count, 2);
    assert_eq!(result.context.failed_step.as_deref(), Some("shrink"));
    assert!(fixture.path("out/report_page_001.png").is_file());
    assert!(fixture.path("out/report_page_002.png").is_file());

    assert_eq!(
        tools.shell_scripts(),
        vec![
            "echo done extract".to_string(),
            "publish scan 2".to_string(),
            "echo done publish".to_string(),
            "notify shrink".to_string(),
        ]
    );
}

#[test]
fn false_condition_skips_without_advancing_the_counter() {
    let fixture = Fixture::new();
    fixture.write_scan_workflow("2");
    let tools = Arc::new(FakeToolchain::default());
    let engine = fixture.engine(tools.clone());

    let result = engine
        .run(&RunTarget::Workflow("scan".to_string()), input(), &ValueMap::new())
        .expect("run");

    let publish = result.step("publish").expect("publish report");
    assert_eq!(publish.phase, StepPhase::Skipped);
    assert_eq!(publish.step_number, Some(3));
    assert_eq!(result.skipped, 1);
    assert_eq!(result.context.counter, 2);
    assert!(!tools.shell_scripts().iter().any(|script| script.starts_with("publish")));
}

#[test]
fn preset_overrides_reach_the_handlers() {
    let fixture = Fixture::new();
    fixture.write_scan_workflow("1-2");
    fixture.write(
        "presets/scan-small.yaml",
        r#"name: scan-small
description: Smaller thumbnails plus an archive step
base_workflow: scan
overrides:
  settings:
    parallel_jobs: 2
  steps:
    shrink:
      params:
        width: 150
    archive:
      type: custom
      params:
        script: "archive {output_dir}"
  hooks:
    on_failure:
      - "page oncall"
"#,
    );
    let tools = Arc::new(FakeToolchain::default());
    let engine = fixture.engine(tools.clone());

    let result = engine
        .run(&RunTarget::from("scan-small"), input(), &ValueMap::new())
        .expect("run");

    assert_eq!(result.preset.as_deref(), Some("scan-small"));
    let names: Vec<_> = result.steps.iter().map(|step| step.name.as_str()).collect();
    assert_eq!(names, vec!["extract", "shrink", "publish", "archive"]);

    let resize_calls = tools.calls_to("magick");
    assert_eq!(resize_calls.len(), 2);
    assert!(resize_calls.iter().all(|call| call.args.contains(&"150x200".to_string())));

    let scripts = tools.shell_scripts();
    assert!(scripts.contains(&format!("archive {}", fixture.path("out").display())));
    assert_eq!(
        scripts[scripts.len() - 2..].to_vec(),
        vec!["notify shrink".to_string(), "page oncall".to_string()]
    );
}

#[test]
fn sequence_shaped_preset_overrides_are_rejected() {
    let fixture = Fixture::new();
    fixture.write_scan_workflow("1-2");
    fixture.write(
        "presets/broken.yaml",
        r#"name: broken
base_workflow: scan
overrides:
  steps:
    - name: shrink
      params:
        width: 150
"#,
    );
    let tools = Arc::new(FakeToolchain::default());
    let engine = fixture.engine(tools.clone());

    let error = engine
        .run(&RunTarget::from("broken"), input(), &ValueMap::new())
        .expect_err("shape error");

    assert!(matches!(error, EngineError::Load(LoadError::InvalidShape { .. })), "{error}");
    assert!(tools.calls.lock().expect("lock").is_empty());
}

#[test]
fn padding_a_text_placeholder_is_rejected_before_any_step() {
    let fixture = Fixture::new();
    fixture.write(
        "workflows/labels.yaml",
        r#"name: labels
steps:
  - name: first
    type: custom
    params:
      script: "echo first"
  - name: second
    type: custom
    params:
      script: "echo {workflow_name:03d}"
hooks:
  on_failure:
    - "notify {failed_step}"
"#,
    );
    let tools = Arc::new(FakeToolchain::default());
    let engine = fixture.engine(tools.clone());

    let error = engine
        .run(&RunTarget::from("labels"), input(), &ValueMap::new())
        .expect_err("invalid format spec");

    let EngineError::Load(LoadError::InvalidStep { step, source, .. }) = &error else {
        panic!("expected an invalid step, got {error}");
    };
    assert_eq!(step, "second");
    assert!(matches!(source, ValidationError::FormatSpec { name, .. } if name == "workflow_name"));
    assert!(tools.calls.lock().expect("lock").is_empty());
}

#[test]
fn missing_base_workflow_is_a_load_error() {
    let fixture = Fixture::new();
    fixture.write("presets/orphan.yaml", "name: orphan\nbase_workflow: nowhere\n");
    let engine = fixture.engine(Arc::new(FakeToolchain::default()));

    let error = engine
        .run(&RunTarget::Preset("orphan".to_string()), input(), &ValueMap::new())
        .expect_err("missing base");

    assert!(matches!(error, EngineError::Load(LoadError::MissingBaseWorkflow { .. })), "{error}");
}

#[test]
fn dry_run_records_commands_without_touching_files() {
    let fixture = Fixture::new();
    fixture.write_scan_workflow("1-2");
    let runner = Arc::new(DryRunRunner::new());
    let engine = fixture.engine(runner.clone());

    let result = engine
        .run(&RunTarget::from("scan"), input(), &ValueMap::new())
        .expect("run");

    assert!(result.succeeded(), "{:?}", result.steps);
    let programs: Vec<_> = runner.recorded().into_iter().map(|call| call.program).collect();
    assert_eq!(programs[..3].to_vec(), vec!["pdfinfo", "pdftoppm", "pdftoppm"]);
    assert!(!fixture.path("out/report_page_001.png").exists());
}

#[test]
fn overrides_win_over_workflow_settings() {
    let fixture = Fixture::new();
    fixture.write_scan_workflow("1-2");
    let tools = Arc::new(FakeToolchain::default());
    let engine = fixture.engine(tools.clone());
    let elsewhere = fixture.path("elsewhere");
    let overrides = ValueMap::from_iter([(
        "output_dir".to_string(),
        serde_json::Value::String(elsewhere.display().to_string()),
    )]);

    let result = engine.run(&RunTarget::from("scan"), input(), &overrides).expect("run");

    assert_eq!(result.context.output_dir, elsewhere);
    assert!(elsewhere.join("report_page_001.png").is_file());
}
