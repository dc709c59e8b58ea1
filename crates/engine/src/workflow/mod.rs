//! Workflow documents: loading, preset merging, validation, and conditions.

pub mod condition_syntax;
pub mod document;
pub mod merge;
pub mod validation;
