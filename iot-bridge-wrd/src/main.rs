//! Bridge for WRD temperature/humidity sensors.
//!
//! Polls every configured sensor over TCP and serves the latest readings
//! as Prometheus metrics.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use iot_bridge_wrd::{
    HttpServer, MetricsSink, SensorGauges, SensorMonitor, TcpSensorReader, WrdBridgeConfig,
};

/// Bridge for WRD temperature/humidity sensors.
#[derive(Parser, Debug)]
#[command(name = "iot-bridge-wrd")]
#[command(about = "Polls WRD sensors and exports Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "wrd.json5")]
    config: PathBuf,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = WrdBridgeConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    if let Some(listen) = args.listen {
        config.prometheus.listen = listen;
        config.validate().context("Invalid --listen address")?;
    }

    // Initialize logging
    let log_config = config
        .logging
        .with_level_override(args.log_level.as_deref());
    iot_bridge_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting iot-bridge-wrd");
    info!("Loaded configuration from {:?}", args.config);

    let listen_addr: SocketAddr = config
        .prometheus
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gauges = Arc::new(SensorGauges::new());
    let reader = TcpSensorReader::from_config(&config.polling);

    // Start one monitor per sensor
    let mut monitors = Vec::with_capacity(config.sensors.len());
    for sensor in &config.sensors {
        let sink: Arc<dyn MetricsSink> = gauges.clone();
        let monitor =
            SensorMonitor::from_config(sensor.clone(), reader.clone(), sink, &config.polling);

        monitors.push(tokio::spawn(monitor.run()));
    }

    info!(
        sensors = config.sensors.len(),
        port = config.polling.port,
        "Sensor monitors running"
    );

    // Start HTTP server
    let http_server = HttpServer::new(
        gauges.clone(),
        config.sensors.len(),
        listen_addr,
        config.prometheus.path.clone(),
    );
    let mut http_task = tokio::spawn(async move { http_server.run(shutdown_rx).await });

    // Wait for shutdown signal, or for the HTTP server to die on its own
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate_signal() => {
            info!("Received SIGTERM, shutting down...");
        }
        result = &mut http_task => {
            for monitor in &monitors {
                monitor.abort();
            }
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("HTTP server task failed: {}", e)),
            };
        }
    }

    for monitor in &monitors {
        monitor.abort();
    }

    shutdown_tx.send(true)?;
    match tokio::time::timeout(Duration::from_secs(5), http_task).await {
        Ok(Ok(Err(e))) => error!("HTTP server error: {}", e),
        Ok(Err(e)) => error!("HTTP server task failed: {}", e),
        Err(_) => error!("HTTP server did not stop within 5s"),
        Ok(Ok(Ok(()))) => {}
    }

    let stats = gauges.stats();
    info!(
        updates = stats.updates,
        deletes = stats.deletes,
        series_count = gauges.series_count(),
        "Final statistics"
    );

    info!("WRD bridge stopped");
    Ok(())
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}
