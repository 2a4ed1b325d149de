//! Occupancy brain - multi-camera people counting service
//!
//! Cameras register over TCP, stream JPEG frames on request, and the
//! tracked people's enter/exit traffic is folded into a floor plan of
//! connected rooms.
//!
//! Module structure:
//! - `domain/` - Core types (devices, detections, zones, floor plan)
//! - `io/` - External interfaces (camera listener, discovery, detector, plan files, HTTP)
//! - `services/` - Registry, tracking pipeline, streaming worker, occupancy
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use occupancy_brain::infra::{Config, Metrics};
use occupancy_brain::io::detector::HttpDetector;
use occupancy_brain::io::prometheus::{start_metrics_server, HttpState};
use occupancy_brain::services::Brain;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Occupancy brain - camera registry, tracking and room occupancy
#[derive(Parser, Debug)]
#[command(name = "occupancy-brain", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/brain.toml")]
    config: String,

    /// Floor plan to load at startup (overrides [floor_plan].path)
    #[arg(short, long)]
    floor_plan: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for per-frame visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "occupancy-brain starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        listener_port = %config.listener_port(),
        discovery_port = %config.discovery_port(),
        detector = %config.detector_endpoint(),
        confidence = %config.confidence_threshold(),
        nms = %config.nms_threshold(),
        max_disappeared = %config.max_disappeared(),
        frame_width = %config.frame_width(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let metrics = Arc::new(Metrics::new());
    let detector = Arc::new(HttpDetector::from_config(&config)?);
    let mut brain = Brain::new(config.clone(), detector, metrics.clone());

    let plan_path =
        args.floor_plan.clone().or_else(|| config.floor_plan_path().map(|p| p.display().to_string()));
    if let Some(path) = plan_path {
        // A bad plan is not fatal; the service runs without occupancy output
        if let Err(e) = brain.load_floor_plan(&path) {
            warn!(path = %path, error = %e, "floor_plan_load_failed");
        }
    }

    brain.start_enabled().await.context("failed to start tasks")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    let prometheus = (prometheus_port > 0).then(|| {
        let state = HttpState {
            metrics: metrics.clone(),
            registry: brain.registry().clone(),
            engine: brain.engine().clone(),
            site_id: Arc::new(config.site_id().to_string()),
        };
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(prometheus_port, state, prom_shutdown).await {
                error!(error = %e, "prometheus_metrics_server_error");
            }
        })
    });

    // Periodic metrics summary
    let reporter = {
        let metrics = metrics.clone();
        let registry = brain.registry().clone();
        let mut reporter_shutdown = shutdown_rx.clone();
        let period = Duration::from_secs(config.metrics_interval_secs().max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        metrics.report(registry.connected_count(), registry.len()).log();
                    }
                    _ = reporter_shutdown.changed() => {
                        if *reporter_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    };

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown_signal_received");

    let _ = shutdown_tx.send(true);
    brain.shutdown().await;
    let _ = reporter.await;
    if let Some(handle) = prometheus {
        let _ = handle.await;
    }

    info!("occupancy-brain shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_from_flag_env_or_default() {
        std::env::remove_var("CONFIG_FILE");
        let args = Args::try_parse_from(["occupancy-brain"]).unwrap();
        assert_eq!(args.config, "config/brain.toml");

        std::env::set_var("CONFIG_FILE", "config/office.toml");
        let args = Args::try_parse_from(["occupancy-brain"]).unwrap();
        assert_eq!(args.config, "config/office.toml");

        // The flag wins over the environment
        let args = Args::try_parse_from(["occupancy-brain", "--config", "config/home.toml"]).unwrap();
        assert_eq!(args.config, "config/home.toml");
        std::env::remove_var("CONFIG_FILE");
    }
}
