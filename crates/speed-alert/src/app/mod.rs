//! Application module
//!
//! Wires the engine to the host's collaborators:
//! - GPX replay as the location provider
//! - Console lines as the overlay
//! - Persisted JSON settings, overridable from the command line
//!
//! and implements the `run`, `probe` and `fallback` commands.

mod console;
mod probe;
mod replay;
pub(crate) mod settings;
mod storage;

pub use console::{ConsoleSink, format_report};
pub use replay::{GpxReplay, ReplayError, ReplayPoint};
pub use settings::{Cli, Command};

use crate::app::settings::{FallbackArgs, RunArgs};
use crate::app::storage::{FileStorage, StorageError};
use speed_limit_lib::{
    DrivingSession, EngineError, LocalLimitStore, LoopConfig, RemoteLimitResolver, ResolverConfig,
    fallback,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Settings storage: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Replay(#[from] ReplayError),
}

/// Run the command selected on the command line
pub async fn run(cli: Cli) -> Result<(), AppError> {
    match &cli.command {
        Command::Run(args) => run_drive(&cli, args).await,
        Command::Probe(args) => {
            let resolver = build_resolver(&cli)?;
            let store = LocalLimitStore::discover(cli.db_dir());
            probe::run_probe(args, &resolver, store).await;
            Ok(())
        }
        Command::Fallback(args) => {
            print_fallback(args);
            Ok(())
        }
    }
}

fn build_resolver(cli: &Cli) -> Result<RemoteLimitResolver, EngineError> {
    RemoteLimitResolver::new(ResolverConfig {
        browser: cli.browser(),
        ..ResolverConfig::default()
    })
}

/// Replay a track through a full driving session until it ends or Ctrl-C
async fn run_drive(cli: &Cli, args: &RunArgs) -> Result<(), AppError> {
    let storage = Arc::new(FileStorage::new_with_path(cli.storage.clone())?);
    let settings = settings::StoredSettings::load(storage, &cli.engine, cli.ignore_persisted)?;

    let replay = GpxReplay::from_file(&args.gpx, args.time_scale, args.accuracy)?;
    let mut finished = replay.finished();

    let store = LocalLimitStore::discover(cli.db_dir());
    tracing::info!(
        "Local databases: {:?} in {}",
        store.countries(),
        store.dir().display()
    );

    let mut session = DrivingSession::new(
        LoopConfig::default(),
        Box::new(replay),
        Arc::new(settings),
        Arc::new(ConsoleSink),
        Arc::new(build_resolver(cli)?),
        store,
    );
    session.start()?;

    tokio::select! {
        _ = alert_entrypoints::shutdown_signal() => {
            tracing::info!("Interrupted");
        }
        _ = finished.wait_for(|done| *done) => {
            tokio::time::sleep(Duration::from_secs(args.grace_secs)).await;
        }
    }

    session.stop();
    Ok(())
}

fn print_fallback(args: &FallbackArgs) {
    let code = args.country.as_deref();
    let row = fallback::get(code);
    let label = code.map(str::to_ascii_uppercase).unwrap_or_else(|| "global".to_string());
    println!(
        "{label}: urban {} / rural {} / divided {} / motorway {} km/h{}",
        row.urban,
        row.rural,
        row.divided,
        row.motorway,
        if fallback::uses_mph(code) { " (signed in mph)" } else { "" }
    );
    let known = code
        .map(|c| c.trim().to_ascii_uppercase())
        .is_some_and(|c| fallback::known_countries().contains(&c.as_str()));
    if code.is_some() && !known {
        println!("(no dedicated row, showing the global default)");
    }
}
