//! # imgpipe engine
//!
//! Loads workflow and preset definitions, merges presets onto their base
//! workflow, and runs the resulting steps in order against a single
//! [`ExecutionContext`]. Real image work is delegated to external programs
//! through [`StepHandler`]s and an injected [`CommandRunner`].
//!
//! ## Usage
//!
//! ```rust
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use imgpipe_engine::{DryRunRunner, Engine, EngineConfig, HandlerRegistry, RunTarget};
//! use imgpipe_types::workflow::ValueMap;
//!
//! let directory = tempfile::tempdir()?;
//! std::fs::write(
//!     directory.path().join("thumbs.yaml"),
//!     "name: thumbs\nsteps:\n  - name: shrink\n    type: custom\n    params:\n      script: echo {step_name}\n",
//! )?;
//! let config = EngineConfig {
//!     workflows_dir: directory.path().to_path_buf(),
//!     presets_dir: directory.path().join("presets"),
//!     output_dir: directory.path().join("out"),
//!     temp_dir: directory.path().join("tmp"),
//!     ..EngineConfig::default()
//! };
//! let engine = Engine::new(config, HandlerRegistry::standard(), Arc::new(DryRunRunner::new()));
//! let result = engine.run(&RunTarget::from("thumbs"), Path::new("photos"), &ValueMap::new())?;
//! assert!(result.succeeded());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - **`templates`**: `{name}` / `{name:03d}` placeholder substitution
//! - **`range`**: page and item range specs
//! - **`workflow`**: definition loading, preset merging, conditions, validation
//! - **`context`**: mutable per-run state
//! - **`executor`**: the step driver, hooks, and process runners
//! - **`handlers`**: one handler per step type
//! - **`config`**: engine configuration and typed run settings

pub mod config;
pub mod context;
pub mod errors;
pub mod executor;
pub mod handlers;
pub mod range;
pub mod templates;
pub mod workflow;

pub use config::{EngineConfig, RunSettings, ToolPaths, load_config, load_config_from_path, parse_override};
pub use context::{ContextSummary, ExecutionContext};
pub use errors::{ConfigError, EngineError, LoadError, ValidationError};
pub use executor::{
    CommandOutput, CommandRunner, CommandSpec, DryRunRunner, Engine, ProcessCommandRunner, RunControl, RunController, RunResult,
    RunStatus, StepPhase, StepReport, control_channel,
};
pub use handlers::{HandlerInvocation, HandlerRegistry, StepHandler};
pub use range::{RangeSpec, RangeUnit, Selection, resolve_range};
pub use templates::{TemplateBindings, substitute};
pub use workflow::condition_syntax::{Condition, eval_condition};
pub use workflow::document::{DefinitionKind, DefinitionLoader, DefinitionSummary, RunTarget};
pub use workflow::merge::apply_preset;
