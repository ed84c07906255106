//! Shared utilities

pub mod error;

pub use error::{ErrorKind, ErrorRecord, PipelineError, PipelineResult};
