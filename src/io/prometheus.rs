//! Prometheus metrics and occupancy HTTP endpoint
//!
//! `/metrics` serves brain metrics in Prometheus text format, including a
//! per-room occupancy gauge. `/occupancy` serves the same counts as JSON.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::services::occupancy::{OccupancyEngine, OccupancySnapshot};
use crate::services::registry::{Registry, SessionSnapshot};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Shared handles the endpoint reads from
#[derive(Clone)]
pub struct HttpState {
    pub metrics: Arc<Metrics>,
    pub registry: Arc<Registry>,
    pub engine: Arc<OccupancyEngine>,
    pub site_id: Arc<String>,
}

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Room names may contain quotes or backslashes
fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(
    summary: &MetricsSummary,
    occupancy: Option<&OccupancySnapshot>,
    site_id: &str,
) -> String {
    let mut output = String::with_capacity(4096);

    write_frame_metrics(&mut output, site_id, summary);
    write_histogram(
        &mut output,
        "brain_detect_latency_ms",
        "Detector round trip in milliseconds",
        site_id,
        &summary.detect_lat_buckets,
        summary.detect_lat_sum_ms,
    );
    write_traffic_metrics(&mut output, site_id, summary);
    write_device_metrics(&mut output, site_id, summary);
    write_occupancy(&mut output, site_id, occupancy);

    output
}

fn write_frame_metrics(output: &mut String, site: &str, s: &MetricsSummary) {
    let counters = [
        ("brain_frames_requested_total", "Frame requests sent to cameras", s.frames_requested),
        ("brain_frames_received_total", "Complete frames received", s.frames_received),
        ("brain_frame_bytes_total", "Bytes of complete frames", s.frame_bytes),
        ("brain_decode_failures_total", "Frames that failed to decode", s.decode_failures),
        ("brain_detect_failures_total", "Detector calls that failed", s.detect_failures),
        ("brain_track_failures_total", "Frames rejected by the tracker", s.track_failures),
        ("brain_detections_total", "Person boxes after filtering", s.detections_total),
    ];
    for (name, help, val) in counters {
        write_metric(output, name, help, MetricType::Counter, site, val);
    }
    let _ = writeln!(output, "# HELP brain_frames_per_sec Frames received per second");
    let _ = writeln!(output, "# TYPE brain_frames_per_sec gauge");
    let _ = writeln!(output, "brain_frames_per_sec{{site=\"{site}\"}} {:.2}", s.frames_per_sec);
}

fn write_traffic_metrics(output: &mut String, site: &str, s: &MetricsSummary) {
    let _ = writeln!(output, "# HELP brain_traffic_events_total Traffic events derived from tracking");
    let _ = writeln!(output, "# TYPE brain_traffic_events_total counter");
    let _ = writeln!(output, "brain_traffic_events_total{{site=\"{site}\",kind=\"enter\"}} {}", s.enter_events);
    let _ = writeln!(output, "brain_traffic_events_total{{site=\"{site}\",kind=\"exit\"}} {}", s.exit_events);

    write_metric(
        output,
        "brain_events_applied_total",
        "Traffic events applied to the floor plan",
        MetricType::Counter,
        site,
        s.events_applied,
    );
    write_metric(
        output,
        "brain_events_dropped_total",
        "Traffic events evicted from full device queues",
        MetricType::Counter,
        site,
        s.events_dropped,
    );
}

fn write_device_metrics(output: &mut String, site: &str, s: &MetricsSummary) {
    let counters = [
        ("brain_devices_registered_total", "First-time camera handshakes", s.devices_registered),
        ("brain_devices_reconnected_total", "Camera reconnects", s.devices_reconnected),
        ("brain_devices_disconnected_total", "Camera channels lost", s.devices_disconnected),
        ("brain_handshake_failures_total", "Connections without a valid identity", s.handshake_failures),
        ("brain_discovery_replies_total", "Discovery requests answered", s.discovery_replies),
    ];
    for (name, help, val) in counters {
        write_metric(output, name, help, MetricType::Counter, site, val);
    }
    write_metric(
        output,
        "brain_devices_connected",
        "Cameras with a live channel",
        MetricType::Gauge,
        site,
        s.connected_devices as u64,
    );
    write_metric(
        output,
        "brain_devices_known",
        "Cameras ever registered",
        MetricType::Gauge,
        site,
        s.known_devices as u64,
    );
}

fn write_occupancy(output: &mut String, site: &str, occupancy: Option<&OccupancySnapshot>) {
    let Some(occupancy) = occupancy else {
        return;
    };
    let _ = writeln!(output, "# HELP brain_room_occupancy People currently in each room");
    let _ = writeln!(output, "# TYPE brain_room_occupancy gauge");
    for room in &occupancy.rooms {
        let _ = writeln!(
            output,
            "brain_room_occupancy{{site=\"{site}\",room=\"{}\"}} {}",
            escape_label(&room.room),
            room.count
        );
    }
    write_metric(
        output,
        "brain_total_occupancy",
        "People across all rooms",
        MetricType::Gauge,
        site,
        occupancy.total,
    );
}

#[derive(Serialize)]
struct OccupancyBody<'a> {
    site: &'a str,
    plan_loaded: bool,
    total: u64,
    rooms: &'a [crate::domain::floor_plan::RoomOccupancy],
    devices: Vec<SessionSnapshot>,
}

fn occupancy_json(state: &HttpState) -> String {
    let snapshot = state.engine.snapshot();
    let body = OccupancyBody {
        site: &state.site_id,
        plan_loaded: snapshot.is_some(),
        total: snapshot.as_ref().map(|s| s.total).unwrap_or(0),
        rooms: snapshot.as_ref().map(|s| s.rooms.as_slice()).unwrap_or(&[]),
        devices: state.registry.snapshots(),
    };
    serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string())
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: HttpState,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let summary =
                state.metrics.snapshot(state.registry.connected_count(), state.registry.len());
            let body =
                format_prometheus_metrics(&summary, state.engine.snapshot().as_ref(), &state.site_id);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail"))
        }
        (&Method::GET, "/occupancy") => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .header("Access-Control-Allow-Origin", "*")
            .body(Full::new(Bytes::from(occupancy_json(&state))))
            .expect("static response should not fail")),
        (&Method::GET, "/health") => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail")),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail")),
    }
}

/// Start the metrics/occupancy HTTP server
pub async fn start_metrics_server(
    port: u16,
    state: HttpState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, site = %state.site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::floor_plan::RoomOccupancy;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_frame_received(2048);
        metrics.record_detection(120, 2);
        metrics.record_traffic(3, 1);

        let occupancy = OccupancySnapshot {
            rooms: vec![
                RoomOccupancy { room: "Lobby".into(), count: 2 },
                RoomOccupancy { room: "Office \"2\"".into(), count: 1 },
            ],
            total: 3,
        };
        let output = format_prometheus_metrics(&metrics.snapshot(1, 2), Some(&occupancy), "home");

        assert!(output.contains("brain_frames_received_total{site=\"home\"} 1"));
        assert!(output.contains("brain_detect_latency_ms_bucket{site=\"home\",le=\"160\"} 1"));
        assert!(output.contains("brain_detect_latency_ms_sum{site=\"home\"} 120"));
        assert!(output.contains("brain_traffic_events_total{site=\"home\",kind=\"enter\"} 3"));
        assert!(output.contains("brain_devices_connected{site=\"home\"} 1"));
        assert!(output.contains("brain_devices_known{site=\"home\"} 2"));
        assert!(output.contains("brain_room_occupancy{site=\"home\",room=\"Lobby\"} 2"));
        assert!(output.contains("brain_room_occupancy{site=\"home\",room=\"Office \\\"2\\\"\"} 1"));
        assert!(output.contains("brain_total_occupancy{site=\"home\"} 3"));
    }

    #[test]
    fn test_no_plan_omits_room_gauges() {
        let output = format_prometheus_metrics(&Metrics::new().snapshot(0, 0), None, "home");
        assert!(!output.contains("brain_room_occupancy"));
        assert!(output.contains("brain_detect_latency_ms_count{site=\"home\"} 0"));
    }
}
