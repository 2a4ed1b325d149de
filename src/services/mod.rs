//! Services - business logic and state management
//!
//! - `registry` - Device sessions and reconnection by identity
//! - `centroid_tracker` - Identity tracking across frames
//! - `zones` - Left/Middle/Right frame classification
//! - `pipeline` - Per-frame decode, detect, filter, track, traffic
//! - `worker` - Streaming worker pulling frames from cameras
//! - `occupancy` - Applies traffic to the floor plan
//! - `supervisor` - Service context owning all tasks

pub mod centroid_tracker;
pub mod occupancy;
pub mod pipeline;
pub mod registry;
pub mod supervisor;
pub mod worker;
pub mod zones;

// Re-export commonly used types
pub use centroid_tracker::CentroidTracker;
pub use occupancy::OccupancyEngine;
pub use registry::Registry;
pub use supervisor::{Brain, TaskKind};
