//! Sharelog Relay - Main Application
//!
//! Tails ckpool sharelogs and streams matching shares over WebSocket.

use sharelog_relay::{
    config::{Config, LogFormat},
    relay::{admission::run_admission_sweeper, serve, RelayState},
    Result, APP_DESCRIPTION, APP_NAME, APP_VERSION,
};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load and validate configuration
    let config = Config::load().await?;

    if config.print_config {
        print_configuration(&config)?;
        return Ok(());
    }

    let _log_guard = init_tracing(&config);

    info!("Starting {} v{}", APP_NAME, APP_VERSION);
    info!(
        logs_dir = %config.logs_dir.display(),
        tick_ms = config.tick_ms,
        track_last_rounds = config.track_last_rounds,
        trust_proxy = config.trust_proxy,
        "Configuration loaded"
    );
    if config.ws_token.as_deref().map_or(true, str::is_empty) {
        warn!("WS_TOKEN is not set: every stream upgrade will be refused");
    }

    let listener = TcpListener::bind(config.socket_addr()?).await?;
    let shutdown = CancellationToken::new();
    let sweep_every = config.admission_sweep_duration();
    let state = RelayState::new(config, shutdown.clone());

    let scheduler = tokio::spawn(state.live_scheduler().run(shutdown.clone()));
    let sweeper = tokio::spawn(run_admission_sweeper(
        state.admission.clone(),
        sweep_every,
        shutdown.clone(),
    ));

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal_token.cancel();
    });

    let result = serve(listener, state).await;
    shutdown.cancel();

    for (name, handle) in [("scheduler", scheduler), ("sweeper", sweeper)] {
        if let Err(e) = handle.await {
            error!("{} task failed: {}", name, e);
        }
    }

    info!("{} stopped", APP_NAME);
    result
}

/// Install the global subscriber; the returned guard flushes the log file
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    let level: tracing::Level = config.log_level.into();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    let (file_writer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, format!("{}.log", APP_NAME));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    match config.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .with(file_writer.map(|writer| fmt::layer().with_ansi(false).with_writer(writer)))
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(true))
            .with(file_writer.map(|writer| fmt::layer().json().with_writer(writer)))
            .init(),
    }

    guard
}

/// Print current configuration
fn print_configuration(config: &Config) -> Result<()> {
    let config_yaml = serde_yaml::to_string(config)?;
    println!("# {} v{}: {}", APP_NAME, APP_VERSION, APP_DESCRIPTION);
    println!("{}", config_yaml);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_config_printing() {
        let config = Config::try_parse_from(vec![
            "sharelog-relay",
            "--ws-token",
            "secret",
            "--tick-ms",
            "250",
        ])
        .unwrap();

        let result = print_configuration(&config);
        assert!(result.is_ok());
    }
}
