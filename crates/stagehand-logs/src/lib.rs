//! Log plumbing for Stagehand.
//!
//! Step output flows masker-first: raw bytes enter the [`mask::Replacer`],
//! masked bytes land in the [`buffer::StreamBuffer`], and the
//! [`remote::RemoteLogWriter`] follows the buffer as a subscriber.

pub mod buffer;
pub mod mask;
pub mod remote;
pub mod sink;

pub use buffer::{Line, StreamBuffer, SubscriberPolicy};
pub use mask::Replacer;
pub use remote::{LogServiceClient, LogServiceConfig, RemoteLogWriter};
pub use sink::StepLog;
