//! Helpers shared by the imgpipe engine and binary.

pub mod async_runtime;
pub mod path_processing;

pub use async_runtime::{DeadlineExceeded, block_on_future, block_on_with_timeout};
pub use path_processing::{expand_tilde, file_stem_and_extension};
