use speed_alert::Cli;
use std::process::ExitCode;

fn main() -> ExitCode {
    // Parse before logging so --help and usage errors print cleanly
    let cli = Cli::from_cli();
    alert_entrypoints::run_native("Speed Alert", || speed_alert::run(cli))
}
