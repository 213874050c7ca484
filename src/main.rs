//! POS bridge - hardware bridge for browser point-of-sale terminals
//!
//! Multiplexes a serial barcode scanner/scale, a receipt printer and a cash
//! drawer behind a small HTTP API on the store LAN.
//!
//! Module structure:
//! - `domain/` - Core types and the serial frame grammar
//! - `io/` - Serial handle, printer transports, HTTP API
//! - `services/` - Shared state, ingest loop, printer dispatcher
//! - `infra/` - Config, errors, metrics

use clap::Parser;
use pos_bridge::domain::{DeviceState, FrameParser, MagellanParser};
use pos_bridge::infra::{Config, Metrics};
use pos_bridge::io::{PrinterHandles, SerialHandle, TtyConnector};
use pos_bridge::services::{
    BridgeContext, HttpSettings, IngestLoop, IngestSettings, PrinterDispatcher, SharedState,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// POS bridge - scanner, scale, printer and cash drawer over HTTP
#[derive(Parser, Debug)]
#[command(name = "pos-bridge", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/bridge.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // RUST_LOG overrides the default INFO level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = %env!("CARGO_PKG_VERSION"), git_hash = %env!("GIT_HASH"), "pos-bridge starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        serial_port = %config.serial_port(),
        baud = %config.serial_baud(),
        weight_divisor = %config.weight_divisor(),
        stale_after_ms = %config.stale_after().as_millis(),
        printer_device = %config.printer_device(),
        printer_queue = %config.printer_queue(),
        http_host = %config.http_host(),
        http_port = %config.http_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Shared components
    let metrics = Arc::new(Metrics::new());
    let state = Arc::new(SharedState::new(config.stale_after(), config.max_pending_barcodes()));
    let dispatcher =
        Arc::new(PrinterDispatcher::new(PrinterHandles::from_config(&config), metrics.clone()));

    // Serial handle; the ingest loop owns it, HTTP only sees its state
    let (serial_state_tx, serial_state_rx) = watch::channel(DeviceState::Disconnected);
    let serial = SerialHandle::new(
        TtyConnector::from_config(&config),
        serial_state_tx,
        config.serial_read_timeout(),
    );
    let parser: Arc<dyn FrameParser> = Arc::new(MagellanParser::default());
    let ingest = IngestLoop::new(
        serial,
        parser,
        state.clone(),
        metrics.clone(),
        IngestSettings::from_config(&config),
    );
    let ingest_task = tokio::spawn(ingest.run(shutdown_rx.clone()));

    // Periodic metrics summary
    let metrics_interval = config.metrics_interval_secs();
    if metrics_interval > 0 {
        let metrics_clone = metrics.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
            interval.tick().await;
            loop {
                interval.tick().await;
                metrics_clone.snapshot().log();
            }
        });
    }

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    let ctx = Arc::new(BridgeContext::new(
        state,
        dispatcher,
        metrics,
        config.serial_port(),
        serial_state_rx,
        HttpSettings::from_config(&config),
    ));

    // Serve until shutdown, then let the ingest loop release the port
    pos_bridge::io::start_http_server(config.http_host(), config.http_port(), ctx, shutdown_rx)
        .await?;
    ingest_task.await?;

    info!("pos-bridge shutdown complete");
    Ok(())
}
