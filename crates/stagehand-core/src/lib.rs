//! Core domain types for the Stagehand execution agent.
//!
//! This crate contains:
//! - The process-wide error taxonomy
//! - Step specifications and run results
//! - Volume variants and mount derivation inputs
//! - Stage-level pipeline configuration

pub mod error;
pub mod pipeline;
pub mod step;
pub mod volume;

pub use error::{Error, Result};
pub use pipeline::PipelineConfig;
pub use step::{RunState, StepSpec};
pub use volume::Volume;
