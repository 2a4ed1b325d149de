//! Per-frame processing: decode, detect, filter, track, derive traffic
//!
//! Each stage has its own error type so a failed frame can be attributed.
//! Any failure skips the frame; the device's tracker is only touched when
//! the whole frame succeeds up to tracking.

use crate::domain::types::{Centroid, Detection, DeviceId, Frame, TrafficEvent, TrafficKind};
use crate::infra::metrics::Metrics;
use crate::io::detector::{DetectError, Detector};
use crate::services::centroid_tracker::{ObjectMap, TrackError};
use crate::services::registry::Registry;
use crate::services::zones::ZoneClassifier;
use bytes::Bytes;
use image::ImageFormat;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("undecodable frame: {0}")]
    Image(#[from] image::ImageError),
    #[error("decode task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Detect(#[from] DetectError),
    #[error(transparent)]
    Track(#[from] TrackError),
    #[error("device {0} is not registered")]
    UnknownDevice(DeviceId),
}

/// Decode assembled JPEG bytes into RGB pixels
pub fn decode_frame(jpeg: Bytes) -> Result<Frame, DecodeError> {
    let image = image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg)?.to_rgb8();
    Ok(Frame { jpeg, image: Arc::new(image) })
}

/// `decode_frame` on the blocking pool, off the async worker threads
pub async fn decode_frame_blocking(jpeg: Bytes) -> Result<Frame, DecodeError> {
    tokio::task::spawn_blocking(move || decode_frame(jpeg)).await?
}

/// Drop duplicate boxes of the same subject.
///
/// Highest confidence first; a box is dropped when its IoU with any kept
/// box exceeds `iou_threshold`.
pub fn non_max_suppression(detections: &mut Vec<Detection>, iou_threshold: f32) {
    detections.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));

    let mut kept = 0;
    for index in 0..detections.len() {
        let overlaps = (0..kept).any(|k| detections[k].bbox.iou(&detections[index].bbox) > iou_threshold);
        if !overlaps {
            detections.swap(kept, index);
            kept += 1;
        }
    }
    detections.truncate(kept);
}

/// Confidence threshold (inclusive) followed by NMS
pub fn filter_detections(
    mut detections: Vec<Detection>,
    confidence_threshold: f32,
    nms_threshold: f32,
) -> Vec<Detection> {
    detections.retain(|d| d.confidence >= confidence_threshold);
    non_max_suppression(&mut detections, nms_threshold);
    detections
}

pub fn centroids(detections: &[Detection]) -> Vec<Centroid> {
    detections.iter().map(|d| d.bbox.center()).collect()
}

/// Compare two tracker outputs: vanished ids exit at their last known
/// zone, new ids enter at their current zone. Exits come first, each
/// group in id order.
pub fn derive_traffic(
    previous: &ObjectMap,
    current: &ObjectMap,
    zones: &ZoneClassifier,
) -> Vec<TrafficEvent> {
    let exits = previous
        .iter()
        .filter(|(id, _)| !current.contains_key(id))
        .map(|(_, c)| TrafficEvent::exit(zones.classify(c.x)));
    let enters = current
        .iter()
        .filter(|(id, _)| !previous.contains_key(id))
        .map(|(_, c)| TrafficEvent::enter(zones.classify(c.x)));
    exits.chain(enters).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameOutcome {
    pub detections: usize,
    pub tracked: usize,
    pub enters: usize,
    pub exits: usize,
    /// Old events evicted from the device queue
    pub dropped: usize,
}

pub struct FramePipeline {
    detector: Arc<dyn Detector>,
    zones: ZoneClassifier,
    confidence_threshold: f32,
    nms_threshold: f32,
    metrics: Arc<Metrics>,
}

impl FramePipeline {
    pub fn new(
        detector: Arc<dyn Detector>,
        zones: ZoneClassifier,
        confidence_threshold: f32,
        nms_threshold: f32,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { detector, zones, confidence_threshold, nms_threshold, metrics }
    }

    /// Run one assembled frame through every stage and queue the resulting
    /// traffic on the device's session.
    pub async fn process(
        &self,
        registry: &Registry,
        device_id: &DeviceId,
        jpeg: Bytes,
    ) -> Result<FrameOutcome, PipelineError> {
        let frame = decode_frame_blocking(jpeg).await?;

        let start = Instant::now();
        let raw = self.detector.detect(&frame).await?;
        let latency_ms = start.elapsed().as_millis() as u64;

        let raw_count = raw.len();
        let detections = filter_detections(raw, self.confidence_threshold, self.nms_threshold);
        self.metrics.record_detection(latency_ms, detections.len());
        let points = centroids(&detections);

        let zones = self.zones;
        let outcome = registry
            .with_session(device_id, |session| -> Result<FrameOutcome, TrackError> {
                let objects = session.tracker.update(&points)?;
                let events = derive_traffic(&session.previous_objects, &objects, &zones);
                let enters = events.iter().filter(|e| e.kind == TrafficKind::Enter).count();
                let exits = events.len() - enters;
                let tracked = objects.len();
                session.previous_objects = objects;
                let dropped = session.push_traffic(events);
                session.record_frame(frame, detections);
                Ok(FrameOutcome { detections: points.len(), tracked, enters, exits, dropped })
            })
            .ok_or_else(|| PipelineError::UnknownDevice(device_id.clone()))??;

        self.metrics.record_traffic(outcome.enters, outcome.exits);
        if outcome.dropped > 0 {
            self.metrics.record_events_dropped(outcome.dropped);
        }
        debug!(
            device_id = %device_id,
            raw = %raw_count,
            kept = %outcome.detections,
            tracked = %outcome.tracked,
            enters = %outcome.enters,
            exits = %outcome.exits,
            latency_ms = %latency_ms,
            "frame_processed"
        );
        Ok(outcome)
    }
}
