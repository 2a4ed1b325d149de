//! Shared types for the occupancy brain

use bytes::Bytes;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Opaque device identifier sent by a camera during the handshake
/// (in practice the camera's hardware address).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Newtype wrapper for tracked object IDs, unique within one tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Centre point of a detection in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Centroid {
    pub x: f32,
    pub y: f32,
}

impl Centroid {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    #[inline]
    pub fn distance(&self, other: &Centroid) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Axis-aligned box in frame pixel coordinates (top-left origin)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> Centroid {
        Centroid::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> f32 {
        let l = self.x.max(other.x);
        let r = (self.x + self.width).min(other.x + other.width);
        let t = self.y.max(other.y);
        let b = (self.y + self.height).min(other.y + other.height);
        (r - l).max(0.0) * (b - t).max(0.0)
    }

    /// Intersection over union; 0 when both boxes are degenerate
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }
}

/// One person box reported by the detector
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f32) -> Self {
        Self { bbox, confidence }
    }
}

/// Horizontal third of a frame, used as a proxy for the door a person used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Zone {
    Left,
    Middle,
    Right,
}

impl Zone {
    pub const ALL: [Zone; 3] = [Zone::Left, Zone::Middle, Zone::Right];

    pub fn as_str(&self) -> &'static str {
        match self {
            Zone::Left => "Left",
            Zone::Middle => "Middle",
            Zone::Right => "Right",
        }
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        match self {
            Zone::Left => 0,
            Zone::Middle => 1,
            Zone::Right => 2,
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for side tokens other than Left/Middle/Right
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid side token: {0:?}")]
pub struct InvalidZone(pub String);

impl FromStr for Zone {
    type Err = InvalidZone;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Left" => Ok(Zone::Left),
            "Middle" => Ok(Zone::Middle),
            "Right" => Ok(Zone::Right),
            other => Err(InvalidZone(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficKind {
    Enter,
    Exit,
}

impl TrafficKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficKind::Enter => "enter",
            TrafficKind::Exit => "exit",
        }
    }
}

/// Directional record derived from tracker identity churn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrafficEvent {
    pub kind: TrafficKind,
    pub zone: Zone,
}

impl TrafficEvent {
    pub fn enter(zone: Zone) -> Self {
        Self { kind: TrafficKind::Enter, zone }
    }

    pub fn exit(zone: Zone) -> Self {
        Self { kind: TrafficKind::Exit, zone }
    }
}

/// Compass direction a room's camera faces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Facing {
    #[default]
    N,
    E,
    S,
    W,
}

impl Facing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Facing::N => "N",
            Facing::E => "E",
            Facing::S => "S",
            Facing::W => "W",
        }
    }

    /// Parse a direction token, `None` for anything but N/E/S/W
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "N" => Some(Facing::N),
            "E" => Some(Facing::E),
            "S" => Some(Facing::S),
            "W" => Some(Facing::W),
            _ => None,
        }
    }
}

impl fmt::Display for Facing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded camera frame. The encoded bytes are kept for the detector.
#[derive(Debug, Clone)]
pub struct Frame {
    pub jpeg: Bytes,
    pub image: Arc<RgbImage>,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}
