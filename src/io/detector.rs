//! Person detector adapter
//!
//! The detector model runs outside this process. `HttpDetector` posts each
//! JPEG to an inference endpoint and expects
//! `{"detections":[{"x":..,"y":..,"width":..,"height":..,"confidence":..,"class_id":..}]}`
//! with boxes in frame pixel coordinates (top-left origin).

use crate::domain::types::{BoundingBox, Detection, Frame};
use crate::infra::config::Config;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("detector request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("detector returned HTTP {0}")]
    Status(u16),
    #[error("invalid detector response: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Anything that turns a frame into person boxes
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectError>;
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<WireDetection>,
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    confidence: f32,
    #[serde(default)]
    class_id: u32,
}

/// Parse a detector response body, keeping boxes of `class_id` only
pub fn parse_detections(body: &[u8], class_id: u32) -> Result<Vec<Detection>, DetectError> {
    let response: DetectResponse = serde_json::from_slice(body)?;
    Ok(response
        .detections
        .into_iter()
        .filter(|d| d.class_id == class_id)
        .map(|d| Detection::new(BoundingBox::new(d.x, d.y, d.width, d.height), d.confidence))
        .collect())
}

pub struct HttpDetector {
    client: reqwest::Client,
    endpoint: String,
    person_class_id: u32,
}

impl HttpDetector {
    pub fn new(endpoint: &str, timeout: Duration, person_class_id: u32) -> anyhow::Result<Self> {
        // Built once for connection reuse
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .http1_only()
            .build()
            .context("failed to build detector HTTP client")?;
        Ok(Self { client, endpoint: endpoint.to_string(), person_class_id })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::new(config.detector_endpoint(), config.detector_timeout(), config.person_class_id())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "image/jpeg")
            .body(frame.jpeg.clone())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DetectError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        let detections = parse_detections(&body, self.person_class_id)?;
        debug!(boxes = %detections.len(), width = %frame.width(), "detector_response");
        Ok(detections)
    }
}
