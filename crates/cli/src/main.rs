use std::process::ExitCode;

use fieldpo_core::config::{AppConfig, LoadOptions, LogFormat};
use tracing::Level;

/// Logs go to stderr so stdout carries only the JSON result.
fn init_logging(config: &AppConfig) -> anyhow::Result<()> {
    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(anyhow::Error::msg)
}

fn main() -> ExitCode {
    // Commands report config errors themselves; logging just stays off.
    if let Ok(config) = AppConfig::load(LoadOptions::default()) {
        if let Err(error) = init_logging(&config) {
            eprintln!("logging disabled: {error:#}");
        }
    }

    fieldpo_cli::run()
}
