//! Native entry point for the speed alert host
//!
//! This crate provides the reusable process-level plumbing around the engine:
//! logging and optional profiling setup, the tokio runtime, CLI/env helpers and
//! build metadata.
//!
//! # Usage
//!
//! ```ignore
//! fn main() -> std::process::ExitCode {
//!     alert_entrypoints::run_native("Speed Alert", || async {
//!         let settings: Cli = alert_entrypoints::parse_args()?;
//!         run(settings).await
//!     })
//! }
//! ```

pub mod cli;
pub mod logging;
pub mod run;

// Re-export commonly used items
pub use cli::{get_env, parse_args};
pub use logging::setup_logging;
pub use run::{run_native, shutdown_signal};

mod metadata;
pub use metadata::{log_version_info, short_version_info};

