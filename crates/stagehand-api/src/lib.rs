//! HTTP surface of the Stagehand agent.
//!
//! Seven endpoints over mutual TLS (or plaintext in development): setup,
//! destroy, start/poll/stream for steps, suspend, and a health check.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod tls;

pub use config::ServerConfig;
pub use state::AppState;
