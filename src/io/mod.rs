//! IO modules - external system interfaces
//!
//! - `device_listener` - TCP listener for camera registration
//! - `discovery` - UDP responder advertising this host's address
//! - `frame_reader` - JPEG frame assembly from the camera stream
//! - `detector` - Person detector adapter (HTTP inference endpoint)
//! - `plan_file` - `.floorplan` persistence
//! - `prometheus` - Prometheus metrics and occupancy HTTP endpoint

pub mod detector;
pub mod device_listener;
pub mod discovery;
pub mod frame_reader;
pub mod plan_file;
pub mod prometheus;

// Re-export commonly used types
pub use detector::{Detector, HttpDetector};
pub use frame_reader::{read_frame, FrameReadError};
