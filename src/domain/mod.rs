//! Domain models - core types and the room graph
//!
//! - `types` - device ids, detections, zones, traffic events, frames
//! - `floor_plan` - room arena with neighbour links and occupancy counts

pub mod floor_plan;
pub mod types;

// Re-export commonly used types at module level
pub use floor_plan::{FloorPlan, GraphError, Room, RoomId, RoomOccupancy};
pub use types::{DeviceId, Detection, Facing, Frame, TrafficEvent, TrafficKind, Zone};
