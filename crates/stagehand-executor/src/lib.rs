//! Step execution backends.
//!
//! [`docker::DockerEngine`] owns the stage's container resources and runs
//! containerized steps; [`host::HostEngine`] runs steps directly on the
//! worker. Both write merged step output into a
//! [`stagehand_logs::StepLog`] and report a
//! [`stagehand_core::RunState`].

pub mod docker;
pub mod host;

pub use docker::DockerEngine;
pub use host::HostEngine;
