//! Speed Alert - Application Library
//!
//! Host application around `speed-limit-lib`: settings, a GPX replay location
//! provider, a console overlay and the command implementations.

mod app;

pub use app::{AppError, Cli, Command, ConsoleSink, GpxReplay, ReplayPoint, format_report, run};
