use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imgpipe_engine::{
    DefinitionLoader, DryRunRunner, Engine, EngineConfig, HandlerRegistry, RunResult, RunTarget, control_channel, load_config,
    load_config_from_path, parse_override,
};
use imgpipe_types::workflow::ValueMap;
use tracing::{Level, warn};

/// Run configuration-driven image processing workflows.
#[derive(Parser, Debug)]
#[command(name = "imgpipe", version, about)]
struct Cli {
    /// Engine configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a workflow or preset over an input file or directory
    Run {
        /// Workflow or preset name, or a path to a definition file
        target: String,

        /// PDF, workbook, image, or image directory to process
        input: PathBuf,

        /// Where produced files are written
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Override a workflow setting (repeatable)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,

        /// Stop at the first failing step
        #[arg(long)]
        stop_on_failure: bool,

        /// Print the external commands instead of running them
        #[arg(long)]
        dry_run: bool,

        /// Print the run result as JSON
        #[arg(long)]
        json: bool,
    },
    /// List available workflows and presets
    List,
    /// Print a workflow or preset after preset merging
    Show {
        target: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config_from_path(path),
        None => load_config(),
    }
    .context("failed to load engine configuration")?;

    match cli.command {
        Command::Run {
            target,
            input,
            output_dir,
            set,
            stop_on_failure,
            dry_run,
            json,
        } => {
            let overrides = build_overrides(&set, output_dir, stop_on_failure)?;
            let result = run_workflow(config, target, input, overrides, dry_run).await?;
            print_result(&result, json)?;
            std::process::exit(result.exit_code());
        }
        Command::List => list_definitions(&config),
        Command::Show { target } => show_definition(&config, &target),
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_overrides(set: &[String], output_dir: Option<PathBuf>, stop_on_failure: bool) -> Result<ValueMap> {
    let mut overrides = ValueMap::new();
    for raw in set {
        let (key, value) = parse_override(raw)?;
        overrides.insert(key, value);
    }
    if let Some(output_dir) = output_dir {
        overrides.insert("output_dir".into(), serde_json::Value::String(output_dir.display().to_string()));
    }
    if stop_on_failure {
        overrides.insert("stop_on_failure".into(), serde_json::Value::Bool(true));
    }
    Ok(overrides)
}

async fn run_workflow(config: EngineConfig, target: String, input: PathBuf, overrides: ValueMap, dry_run: bool) -> Result<RunResult> {
    let engine = if dry_run {
        Engine::new(config, HandlerRegistry::standard(), Arc::new(DryRunRunner::new()))
    } else {
        Engine::with_defaults(config)
    };
    let (controller, receiver) = control_channel();

    // The engine blocks on child processes, so it gets its own thread.
    let mut handle = tokio::task::spawn_blocking(move || {
        engine.run_with_control(&RunTarget::from(target.as_str()), &input, &overrides, Some(receiver))
    });

    let joined = tokio::select! {
        joined = &mut handle => joined,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt received; cancelling after the current step");
            controller.cancel();
            handle.await
        }
    };
    let result = joined.context("workflow thread panicked")??;
    Ok(result)
}

fn print_result(result: &RunResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    let title = match &result.preset {
        Some(preset) => format!("{} (preset {preset})", result.workflow_name),
        None => result.workflow_name.clone(),
    };
    println!("{title}: {:?} in {:.1}s", result.status, result.duration().as_secs_f64());
    for step in &result.steps {
        let items = step.outcome.as_ref().map(|outcome| outcome.items_produced).unwrap_or(0);
        print!("  {:<24} {:<12} {:<10} items={items}", step.name, step.step_type.to_string(), step.phase.as_str());
        if step.used_else {
            print!(" (else)");
        }
        match step.error_message() {
            Some(message) if step.outcome.as_ref().is_some_and(|outcome| !outcome.succeeded) => println!("  {message}"),
            _ => println!(),
        }
    }
    println!(
        "total={} processed={} failed={} skipped={} hook_failures={}",
        result.total, result.processed, result.failed, result.skipped, result.hook_failures
    );
    Ok(())
}

fn list_definitions(config: &EngineConfig) -> Result<()> {
    let summaries = DefinitionLoader::from_config(config).list_definitions()?;
    if summaries.is_empty() {
        println!("no workflows or presets found");
        return Ok(());
    }
    for summary in summaries {
        println!(
            "{:<24} {:<9} {}",
            summary.name,
            summary.kind.to_string(),
            summary.description.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn show_definition(config: &EngineConfig, target: &str) -> Result<()> {
    let resolved = DefinitionLoader::from_config(config)
        .resolve(&RunTarget::from(target))
        .with_context(|| format!("failed to resolve '{target}'"))?;
    print!("{}", serde_yaml::to_string(&resolved)?);
    Ok(())
}
