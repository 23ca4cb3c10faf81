mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use relaycast_core::{bootstrap::load_config, logging, Config};
use relaycast_simulcast::{DestinationStatus, InstanceSnapshot, SimulcastRegistry};

use cli::{Cli, Command, RunArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load and validate configuration (fails fast on misconfiguration)
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Run(args) => run(config, args).await,
    }
}

async fn run(config: Config, args: RunArgs) -> Result<()> {
    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("relaycast starting...");
    info!("Ingest template: {}", config.ingest.url_template);
    info!("Relay binary: {}", config.relay.ffmpeg_path);

    let destinations = args
        .destinations
        .iter()
        .map(|spec| cli::parse_destination(spec))
        .collect::<Result<Vec<_>>>()?;

    // 3. Create the registry; it owns every relay from here on
    let registry = Arc::new(SimulcastRegistry::with_ffmpeg(&config));

    // 4. Start the simulcast described on the command line, if any
    let reporter = match args.stream_key {
        Some(stream_key) if !destinations.is_empty() => {
            let snapshot = registry
                .start(&stream_key, destinations)
                .await
                .with_context(|| format!("Failed to start simulcast for {stream_key}"))?;
            log_snapshot(&snapshot);

            let every = Duration::from_secs(args.status_interval.max(1));
            Some(tokio::spawn(report_status(
                Arc::clone(&registry),
                stream_key,
                every,
            )))
        }
        Some(_) => bail!("--stream-key given without any --destination"),
        None if !destinations.is_empty() => bail!("--destination requires --stream-key"),
        None => {
            info!("No simulcast requested, idling until shutdown");
            None
        }
    };

    // 5. Wait for a shutdown signal, or for the simulcast to end by itself
    match reporter {
        Some(mut reporter) => {
            tokio::select! {
                () = shutdown_signal() => reporter.abort(),
                result = &mut reporter => {
                    if let Err(e) = result {
                        error!("Status reporter failed: {e}");
                    }
                }
            }
        }
        None => shutdown_signal().await,
    }

    // 6. Drain: every relay gets the grace period, stragglers are killed
    info!("Shutting down...");
    registry.shutdown().await;
    info!("relaycast stopped");
    Ok(())
}

fn log_snapshot(snapshot: &InstanceSnapshot) {
    for dest in &snapshot.destinations {
        info!(
            stream_key = %snapshot.stream_key,
            destination_id = %dest.destination_id,
            platform = %dest.platform,
            protocol = %dest.protocol,
            status = %dest.status,
            reconnect_attempts = dest.reconnect_attempts,
            bitrate_kbps = dest.metrics.as_ref().map_or(0.0, |m| m.bitrate_kbps),
            error = dest.error_message.as_deref().unwrap_or(""),
            "Destination status"
        );
    }
}

/// Periodically log every destination of `stream_key`. Returns once the
/// simulcast is gone or none of its destinations is relaying any more.
async fn report_status(registry: Arc<SimulcastRegistry>, stream_key: String, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(snapshot) = registry.status(&stream_key) else {
            info!(stream_key = %stream_key, "Simulcast is no longer running");
            return;
        };
        log_snapshot(&snapshot);
        info!(
            stream_key = %stream_key,
            connected = snapshot.count_by_status(DestinationStatus::Connected),
            connecting = snapshot.count_by_status(DestinationStatus::Connecting),
            failed = snapshot.count_by_status(DestinationStatus::Error),
            total = snapshot.destinations.len(),
            "Simulcast status"
        );

        if snapshot.destinations.iter().all(|d| d.status.is_terminal()) {
            warn!(stream_key = %stream_key, "No destination is relaying any more");
            return;
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
