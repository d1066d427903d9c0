//! The stage runtime.
//!
//! One agent process serves one stage at a time. [`stage::StageState`] is
//! created at setup and torn down at destroy; [`engine::Engine`] owns the
//! stage's container resources and dispatches each step to the host or
//! container backend; [`steps::StepExecutor`] drives steps end-to-end and
//! answers poll/stream without blocking execution.

pub mod engine;
pub mod stage;
pub mod stats;
pub mod steps;

pub use engine::Engine;
pub use stage::{StageState, TiConfig};
pub use stats::{OsStats, StatsCollector};
pub use steps::{StepExecutor, StepRecord, StepState};
