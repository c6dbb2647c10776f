//! Detection gateway - box routing and cylinder control for detection rooms
//!
//! Module structure:
//! - `domain/` - Core types (rooms, rules, jobs, scans)
//! - `io/` - External interfaces (PLC, scanners, alarms, declare listener)
//! - `services/` - Engine (actuation, room control, admission, dispatch)
//! - `infra/` - Infrastructure (config, catalog, metrics)

use clap::Parser;
use detection_gateway::infra::{Catalog, Config, Metrics};
use detection_gateway::io::{
    create_alarm_channel, start_declare_listener, AlarmSink, DeclareListenerConfig, PlcLink,
    ScannerPort, SimulatedPlc,
};
use detection_gateway::services::{Dispatcher, JobStore, RoomController, StatusMonitor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Detection gateway - routes scanned boxes through detection rooms
#[derive(Parser, Debug)]
#[command(name = "detection-gateway", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    // Default: INFO, use RUST_LOG=debug for per-step flow logs
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    info!(git_hash = %env!("GIT_HASH"), "detection-gateway starting");

    let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);
    let settings = config.control();
    info!(
        config_file = %config.config_file(),
        site_id = %config.site_id(),
        rooms = %config.rooms().len(),
        rules = %config.rules().len(),
        scanners = %config.scanners().len(),
        poll_interval_ms = %settings.poll_interval.as_millis(),
        max_undetected_per_room = %settings.max_undetected_per_room,
        interlock_retries = %settings.interlock_retries,
        declare_port = %config.declare_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Simulated PLC: the field transport is not part of this gateway.
    // No write log: nothing in the host reads it.
    let sim = SimulatedPlc::new(Duration::from_millis(config.sim_travel_ms())).with_write_log_capacity(0);
    for room in config.rooms() {
        sim.add_room(room);
    }
    let plc: Arc<dyn PlcLink> = Arc::new(sim);

    // Alarm channel and JSONL writer
    let (alarm_channel, alarm_writer) =
        create_alarm_channel(config.alarm_file(), config.alarm_queue_capacity(), metrics.clone());
    tokio::spawn(alarm_writer.run());
    let alarms: Arc<dyn AlarmSink> = Arc::new(alarm_channel);

    let catalog = Arc::new(Catalog::from_config(&config));
    let jobs = Arc::new(JobStore::new(settings.max_undetected_per_room));
    let controller =
        Arc::new(RoomController::new(plc.clone(), alarms.clone(), settings, metrics.clone()));
    let dispatcher = Arc::new(Dispatcher::new(controller, jobs.clone(), catalog.clone(), catalog.clone()));

    // Catalog reload (0 disables)
    let reload_secs = config.catalog_reload_interval_secs();
    if reload_secs > 0 {
        let reload_catalog = catalog.clone();
        let reload_path = config.config_file().to_string();
        let mut reload_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(reload_secs));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = reload_shutdown.changed() => {
                        if *reload_shutdown.borrow() {
                            return;
                        }
                    }
                    _ = interval.tick() => {
                        if let Err(e) = reload_catalog.reload_from_file(&reload_path) {
                            warn!(path = %reload_path, error = %e, "catalog_reload_failed");
                        }
                    }
                }
            }
        });
    }

    // Metrics reporter (lock-free reads)
    let metrics_reporter = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics_reporter.report().log();
        }
    });

    let mut monitor = StatusMonitor::new(
        plc.clone(),
        alarms.clone(),
        metrics.clone(),
        jobs.clone(),
        Duration::from_millis(config.status_poll_ms()),
    );

    // Scanners feed one bounded scan channel
    let (scan_tx, scan_rx) = mpsc::channel(config.scan_queue_capacity());
    for scanner in config.scanners().iter().filter(|s| s.enabled) {
        let Some(room) = config.room(scanner.room_id) else {
            warn!(room_id = %scanner.room_id, device = %scanner.device, "scanner_room_unknown");
            continue;
        };
        let port = ScannerPort::new(scanner, &room.name, scan_tx.clone(), metrics.clone());
        monitor.watch_scanner(port.room_id(), port.subscribe());
        tokio::spawn(port.run(shutdown_rx.clone()));
    }
    // Held so the dispatcher keeps running with no scanners configured
    let _scan_tx = scan_tx;

    tokio::spawn(monitor.run(shutdown_rx.clone()));

    let declare_config = DeclareListenerConfig {
        port: config.declare_port(),
        enabled: config.declare_enabled(),
    };
    let declare_dispatcher = dispatcher.clone();
    let declare_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = start_declare_listener(declare_config, declare_dispatcher, declare_shutdown).await {
            error!(error = %e, "declare_listener_error");
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // Dispatcher runs until shutdown
    let mut main_shutdown = shutdown_rx;
    tokio::select! {
        _ = dispatcher.run(scan_rx) => {}
        _ = async {
            while !*main_shutdown.borrow() {
                if main_shutdown.changed().await.is_err() {
                    break;
                }
            }
        } => {}
    }

    metrics.report().log();
    info!("detection-gateway shutdown complete");
    Ok(())
}
