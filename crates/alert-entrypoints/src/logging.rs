/*!
Logging (and optional profiling) initialization.

Two implementations behind one API:

- real: compiled when `feature = "profiling"` is set. Adds a `tracing-chrome`
  layer when `ENABLE_PROFILING` is present in the environment; the trace file is
  flushed when the returned guard is dropped.
- stub: plain `fmt` logging.

Both honor `RUST_LOG` and fall back to [`default_directives`] otherwise. Logs go
to stderr so stdout stays free for the per-tick console output.
*/

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set
pub fn default_directives() -> &'static str {
    if cfg!(debug_assertions) {
        "debug,reqwest=info,hyper_util=info,rustls=info"
    } else {
        "info"
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives()))
}

#[cfg(feature = "profiling")]
mod inner {
    use tracing_chrome::{ChromeLayerBuilder, FlushGuard};
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    /// Keeps the trace file open; dropping it flushes the trace
    pub struct LoggingGuard {
        _chrome: Option<FlushGuard>,
    }

    pub fn setup_logging() -> LoggingGuard {
        let (chrome_layer, guard) = if std::env::var("ENABLE_PROFILING").is_ok() {
            let (layer, guard) = ChromeLayerBuilder::new().include_args(true).build();
            (Some(layer), Some(guard))
        } else {
            (None, None)
        };

        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(super::env_filter());
        let result = tracing_subscriber::registry()
            .with(chrome_layer)
            .with(fmt_layer)
            .try_init();

        match (&result, guard.is_some()) {
            (Err(e), _) => eprintln!("Logging already initialized: {e}"),
            (Ok(()), true) => tracing::info!("Logging initialized, chrome trace recording"),
            (Ok(()), false) => {
                tracing::info!("Logging initialized (set ENABLE_PROFILING to record a trace)")
            }
        }
        LoggingGuard { _chrome: guard }
    }
}

#[cfg(not(feature = "profiling"))]
mod inner {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    pub struct LoggingGuard;

    pub fn setup_logging() -> LoggingGuard {
        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(super::env_filter());
        match tracing_subscriber::registry().with(fmt_layer).try_init() {
            Ok(()) => tracing::info!("Logging initialized (profiling disabled in this build)"),
            Err(e) => eprintln!("Logging already initialized: {e}"),
        }
        LoggingGuard
    }
}

pub use inner::{LoggingGuard, setup_logging};
