//! Streaming worker
//!
//! Walks the connected devices in registry order. For each one it sends the
//! frame request, assembles the reply, then hands the frame to a detection
//! task. At most one detection task exists at a time: it runs while the
//! next device's frame is being received, and is joined before the next
//! one is spawned (or before its own device is asked for another frame).

use crate::domain::types::DeviceId;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::frame_reader::{read_frame, FrameReadError};
use crate::services::pipeline::{FramePipeline, PipelineError};
use crate::services::registry::{DeviceChannel, Registry};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub request_command: String,
    pub read_timeout: Duration,
    pub read_chunk_bytes: usize,
    pub max_frame_bytes: usize,
    pub idle_poll: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            request_command: config.request_command().to_string(),
            read_timeout: config.read_timeout(),
            read_chunk_bytes: config.read_chunk_bytes(),
            max_frame_bytes: config.max_frame_bytes(),
            idle_poll: config.idle_poll(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

struct InFlight {
    device_id: DeviceId,
    handle: JoinHandle<()>,
}

pub struct StreamingWorker {
    registry: Arc<Registry>,
    pipeline: Arc<FramePipeline>,
    metrics: Arc<Metrics>,
    settings: WorkerSettings,
    in_flight: Option<InFlight>,
}

impl StreamingWorker {
    pub fn new(
        registry: Arc<Registry>,
        pipeline: Arc<FramePipeline>,
        metrics: Arc<Metrics>,
        settings: WorkerSettings,
    ) -> Self {
        Self { registry, pipeline, metrics, settings, in_flight: None }
    }

    /// Run until shutdown is signalled. A cycle in progress finishes its
    /// current exchange (bounded by the read timeout) before exiting.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(command = %self.settings.request_command, "streaming_worker_started");

        'outer: loop {
            if *shutdown.borrow() {
                break;
            }

            let channels = self.registry.active_channels();
            if channels.is_empty() {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.settings.idle_poll) => {}
                }
                continue;
            }

            for (device_id, channel) in channels {
                if *shutdown.borrow() {
                    break 'outer;
                }
                self.cycle(device_id, channel).await;
            }
        }

        self.join_in_flight().await;
        info!("streaming_worker_stopped");
    }

    /// One request/receive/hand-off cycle for one device
    async fn cycle(&mut self, device_id: DeviceId, channel: DeviceChannel) {
        // Keep a device's own frames strictly ordered
        if self.in_flight.as_ref().is_some_and(|t| t.device_id == device_id) {
            self.join_in_flight().await;
        }

        let jpeg = match self.exchange(&channel).await {
            Ok(jpeg) => jpeg,
            Err(e) => {
                warn!(
                    device_id = %device_id,
                    peer = %channel.peer(),
                    error = %e,
                    "device_exchange_failed"
                );
                if self.registry.disconnect(&device_id, channel.generation()) {
                    self.metrics.record_device_disconnected();
                }
                return;
            }
        };
        self.metrics.record_frame_received(jpeg.len());
        debug!(device_id = %device_id, bytes = %jpeg.len(), "frame_received");

        self.join_in_flight().await;
        self.spawn_detection(device_id, jpeg);
    }

    async fn exchange(&self, channel: &DeviceChannel) -> Result<Bytes, FrameReadError> {
        let settings = &self.settings;
        let mut stream = channel.stream().lock().await;

        timeout(settings.read_timeout, stream.write_all(settings.request_command.as_bytes()))
            .await
            .map_err(|_| FrameReadError::Timeout(settings.read_timeout))??;
        self.metrics.record_frame_requested();

        read_frame(
            &mut *stream,
            settings.read_chunk_bytes,
            settings.read_timeout,
            settings.max_frame_bytes,
        )
        .await
    }

    fn spawn_detection(&mut self, device_id: DeviceId, jpeg: Bytes) {
        let registry = self.registry.clone();
        let pipeline = self.pipeline.clone();
        let metrics = self.metrics.clone();
        let id = device_id.clone();

        let handle = tokio::spawn(async move {
            match pipeline.process(&registry, &id, jpeg).await {
                Ok(_) => {}
                Err(PipelineError::Decode(e)) => {
                    metrics.record_decode_failure();
                    debug!(device_id = %id, error = %e, "frame_decode_failed");
                }
                Err(PipelineError::Detect(e)) => {
                    metrics.record_detect_failure();
                    warn!(device_id = %id, error = %e, "detection_failed");
                }
                Err(PipelineError::Track(e)) => {
                    metrics.record_track_failure();
                    warn!(device_id = %id, error = %e, "tracking_failed");
                }
                Err(e @ PipelineError::UnknownDevice(_)) => {
                    warn!(device_id = %id, error = %e, "frame_for_unknown_device");
                }
            }
        });
        self.in_flight = Some(InFlight { device_id, handle });
    }

    async fn join_in_flight(&mut self) {
        if let Some(task) = self.in_flight.take() {
            if let Err(e) = task.handle.await {
                error!(device_id = %task.device_id, error = %e, "detection_task_panicked");
            }
        }
    }
}
