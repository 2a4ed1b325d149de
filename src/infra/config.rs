//! Configuration loading from TOML files
//!
//! The binary picks the file from `--config`, then the `CONFIG_FILE`
//! environment variable, then `config/brain.toml`. A missing or invalid
//! file falls back to defaults.

use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "brain".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_listener_port")]
    pub port: u16,
    /// How long a new connection has to send its identity
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_max_identity_bytes")]
    pub max_identity_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_bind_address(),
            port: default_listener_port(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            max_identity_bytes: default_max_identity_bytes(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listener_port() -> u16 {
    25425
}

fn default_handshake_timeout_ms() -> u64 {
    2000
}

fn default_max_identity_bytes() -> usize {
    65535
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    #[serde(default = "default_discovery_request")]
    pub request: String,
    #[serde(default = "default_discovery_response_prefix")]
    pub response_prefix: String,
    /// Address to hand out instead of the auto-detected one
    #[serde(default)]
    pub advertise_address: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_discovery_port(),
            request: default_discovery_request(),
            response_prefix: default_discovery_response_prefix(),
            advertise_address: None,
        }
    }
}

fn default_discovery_port() -> u16 {
    25426
}

fn default_discovery_request() -> String {
    "brain address?".to_string()
}

fn default_discovery_response_prefix() -> String {
    "brain address:".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Sleep between registry polls while no device is connected
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    #[serde(default = "default_request_command")]
    pub request_command: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            read_timeout_ms: default_read_timeout_ms(),
            read_chunk_bytes: default_read_chunk_bytes(),
            max_frame_bytes: default_max_frame_bytes(),
            idle_poll_ms: default_idle_poll_ms(),
            request_command: default_request_command(),
        }
    }
}

fn default_read_timeout_ms() -> u64 {
    2000
}

fn default_read_chunk_bytes() -> usize {
    8192
}

fn default_max_frame_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_idle_poll_ms() -> u64 {
    50
}

fn default_request_command() -> String {
    "send image".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_detector_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_detector_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_nms_threshold")]
    pub nms_threshold: f32,
    #[serde(default)]
    pub person_class_id: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_detector_endpoint(),
            timeout_ms: default_detector_timeout_ms(),
            confidence_threshold: default_confidence_threshold(),
            nms_threshold: default_nms_threshold(),
            person_class_id: 0,
        }
    }
}

fn default_detector_endpoint() -> String {
    "http://127.0.0.1:8500/detect".to_string()
}

fn default_detector_timeout_ms() -> u64 {
    5000
}

fn default_confidence_threshold() -> f32 {
    0.6
}

fn default_nms_threshold() -> f32 {
    0.3
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Consecutive unmatched frames before an object is dropped
    #[serde(default = "default_max_disappeared")]
    pub max_disappeared: u32,
    #[serde(default = "default_frame_width")]
    pub frame_width: u32,
    /// Per-device traffic queue bound; oldest events are dropped beyond it
    #[serde(default = "default_max_pending_events")]
    pub max_pending_events: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_disappeared: default_max_disappeared(),
            frame_width: default_frame_width(),
            max_pending_events: default_max_pending_events(),
        }
    }
}

fn default_max_disappeared() -> u32 {
    3
}

fn default_frame_width() -> u32 {
    640
}

fn default_max_pending_events() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct FloorPlanConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

impl Default for FloorPlanConfig {
    fn default() -> Self {
        Self { path: None, refresh_interval_ms: default_refresh_interval_ms() }
    }
}

fn default_refresh_interval_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: default_prometheus_port() }
    }
}

fn default_metrics_interval() -> u64 {
    10
}

fn default_prometheus_port() -> u16 {
    9464
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub floor_plan: FloorPlanConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    listener: ListenerConfig,
    discovery: DiscoveryConfig,
    worker: WorkerConfig,
    detection: DetectionConfig,
    tracker: TrackerConfig,
    floor_plan: FloorPlanConfig,
    metrics: MetricsConfig,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site_id: toml_config.site.id,
            listener: toml_config.listener,
            discovery: toml_config.discovery,
            worker: toml_config.worker,
            detection: toml_config.detection,
            tracker: toml_config.tracker,
            floor_plan: toml_config.floor_plan,
            metrics: toml_config.metrics,
            config_file,
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration from a path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    // Listener
    pub fn listener_enabled(&self) -> bool {
        self.listener.enabled
    }

    pub fn listener_addr(&self) -> String {
        format!("{}:{}", self.listener.bind_address, self.listener.port)
    }

    /// Interface address shared by the listener and discovery sockets
    pub fn bind_address(&self) -> &str {
        &self.listener.bind_address
    }

    pub fn listener_port(&self) -> u16 {
        self.listener.port
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.listener.handshake_timeout_ms)
    }

    pub fn max_identity_bytes(&self) -> usize {
        self.listener.max_identity_bytes
    }

    // Discovery
    pub fn discovery_enabled(&self) -> bool {
        self.discovery.enabled
    }

    pub fn discovery_port(&self) -> u16 {
        self.discovery.port
    }

    pub fn discovery_request(&self) -> &str {
        &self.discovery.request
    }

    pub fn discovery_response_prefix(&self) -> &str {
        &self.discovery.response_prefix
    }

    pub fn advertise_address(&self) -> Option<&str> {
        self.discovery.advertise_address.as_deref()
    }

    // Worker
    pub fn worker_enabled(&self) -> bool {
        self.worker.enabled
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.worker.read_timeout_ms)
    }

    pub fn read_chunk_bytes(&self) -> usize {
        self.worker.read_chunk_bytes
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.worker.max_frame_bytes
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.worker.idle_poll_ms)
    }

    pub fn request_command(&self) -> &str {
        &self.worker.request_command
    }

    // Detection
    pub fn detector_endpoint(&self) -> &str {
        &self.detection.endpoint
    }

    pub fn detector_timeout(&self) -> Duration {
        Duration::from_millis(self.detection.timeout_ms)
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.detection.confidence_threshold
    }

    pub fn nms_threshold(&self) -> f32 {
        self.detection.nms_threshold
    }

    pub fn person_class_id(&self) -> u32 {
        self.detection.person_class_id
    }

    // Tracker
    pub fn max_disappeared(&self) -> u32 {
        self.tracker.max_disappeared
    }

    pub fn frame_width(&self) -> u32 {
        self.tracker.frame_width
    }

    pub fn max_pending_events(&self) -> usize {
        self.tracker.max_pending_events
    }

    // Floor plan
    pub fn floor_plan_path(&self) -> Option<&Path> {
        self.floor_plan.path.as_deref()
    }

    pub fn occupancy_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.floor_plan.refresh_interval_ms)
    }

    // Metrics
    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics.interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.metrics.prometheus_port
    }

    /// Builder method for tests to listen on an ephemeral port
    pub fn with_listener_port(mut self, port: u16) -> Self {
        self.listener.port = port;
        self
    }

    /// Builder method for tests to bind somewhere other than all interfaces
    pub fn with_bind_address(mut self, address: &str) -> Self {
        self.listener.bind_address = address.to_string();
        self
    }

    pub fn with_discovery_port(mut self, port: u16) -> Self {
        self.discovery.port = port;
        self
    }

    pub fn with_advertise_address(mut self, address: &str) -> Self {
        self.discovery.advertise_address = Some(address.to_string());
        self
    }

    pub fn with_read_timeout_ms(mut self, ms: u64) -> Self {
        self.worker.read_timeout_ms = ms;
        self
    }

    pub fn with_max_pending_events(mut self, max: usize) -> Self {
        self.tracker.max_pending_events = max;
        self
    }
}
