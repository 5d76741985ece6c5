//! codebox - session-scoped code execution backend.
//!
//! Source code arrives with a language tag, runs in a per-session workspace
//! under a wall-clock deadline, and comes back as captured output plus the
//! files the run left behind. Uploaded files live in the same workspaces.

#[cfg(not(unix))]
compile_error!("codebox only works on Unix-like systems.");

pub mod config;
pub mod error;
pub mod file_store;
pub mod http_server;
pub mod language;
pub mod runner;
pub mod state;
pub mod workspace;

pub use config::Config;
pub use error::{ExecError, Result};
pub use state::AppState;
