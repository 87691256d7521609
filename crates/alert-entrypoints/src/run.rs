//! Native runner: logging, build info, tokio runtime, exit code

use std::future::Future;
use std::process::ExitCode;

/// Run an async application `main` on a multi-threaded tokio runtime
///
/// Logging is initialized first, so both fmt and chrome layers are registered
/// before any event is emitted. An `Err` from `app` is logged and mapped to a
/// failure exit code.
pub fn run_native<F, Fut, E>(app_name: &str, app: F) -> ExitCode
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let _logging = crate::logging::setup_logging();
    crate::log_version_info();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("speed-alert-worker")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("Starting {app_name}");
    match runtime.block_on(app()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{app_name} failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Resolves on Ctrl-C (or immediately if the handler cannot be installed)
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Could not listen for Ctrl-C: {e}");
    }
}
