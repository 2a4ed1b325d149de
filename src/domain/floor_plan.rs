//! Room graph with per-room occupancy counts
//!
//! Rooms live in an arena and refer to their neighbours by index, so
//! adjacent rooms can point at each other without shared ownership.
//! Each room has up to three doors (Left, Middle, Right) as seen from its
//! camera, which is mounted opposite the middle door.
//!
//! Links are directed: `add_room` creates both directions, but a plan
//! loaded from disk keeps exactly the edges written in the file.

use crate::domain::types::{DeviceId, Facing, TrafficEvent, TrafficKind, Zone};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::fmt::Write;

/// Placeholder a plan file writes for an absent neighbour or camera
pub const NONE_TOKEN: &str = "none";

/// Whether `value` can be written to a plan file and read back unchanged:
/// non-empty, not [`NONE_TOKEN`], words separated by single spaces.
pub fn is_storable(value: &str) -> bool {
    value != NONE_TOKEN
        && value.split(' ').all(|word| !word.is_empty() && !word.contains(char::is_whitespace))
}

/// Stable index of a room inside its plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoomId(usize);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("room {0:?} already exists")]
    DuplicateRoom(String),
    #[error("room {0:?} is not in this floor plan")]
    UnknownRoom(String),
    #[error("{side} side of room {room:?} is already connected")]
    SideOccupied { room: String, side: Zone },
    #[error("invalid side token: {0:?}")]
    InvalidSide(String),
    #[error("the first room can only be added to an empty plan")]
    NotEmpty,
    #[error("room name {0:?} cannot be stored in a plan file")]
    InvalidName(String),
    #[error("camera {0:?} cannot be stored in a plan file")]
    InvalidCamera(String),
}

#[derive(Debug, Clone)]
pub struct Room {
    name: String,
    neighbors: [Option<RoomId>; 3],
    camera: Option<DeviceId>,
    facing: Facing,
    occupancy: u32,
}

impl Room {
    fn new(name: String, camera: Option<DeviceId>, facing: Facing) -> Self {
        Self { name, neighbors: [None; 3], camera, facing, occupancy: 0 }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn neighbor(&self, side: Zone) -> Option<RoomId> {
        self.neighbors[side.index()]
    }

    pub fn camera(&self) -> Option<&DeviceId> {
        self.camera.as_ref()
    }

    pub fn facing(&self) -> Facing {
        self.facing
    }

    pub fn occupancy(&self) -> u32 {
        self.occupancy
    }

    fn add(&mut self, n: u32) {
        self.occupancy = self.occupancy.saturating_add(n);
    }

    /// Never goes below zero
    fn sub(&mut self, n: u32) {
        self.occupancy = self.occupancy.saturating_sub(n);
    }
}

/// Occupancy of one room at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomOccupancy {
    pub room: String,
    pub count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct FloorPlan {
    rooms: Vec<Room>,
    by_name: FxHashMap<String, RoomId>,
    root: Option<RoomId>,
}

impl FloorPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a plan whose root is `name`
    pub fn with_first_room(
        name: &str,
        camera: Option<DeviceId>,
        facing: Facing,
    ) -> Result<Self, GraphError> {
        let mut plan = Self::new();
        plan.add_first_room(name, camera, facing)?;
        Ok(plan)
    }

    /// Add the root room; only allowed while the plan is empty
    pub fn add_first_room(
        &mut self,
        name: &str,
        camera: Option<DeviceId>,
        facing: Facing,
    ) -> Result<RoomId, GraphError> {
        if !self.rooms.is_empty() {
            return Err(GraphError::NotEmpty);
        }
        let id = self.insert_room(name, camera, facing)?;
        self.root = Some(id);
        Ok(id)
    }

    /// Add `name` and connect it to `connect_to`.
    ///
    /// `room_side` is the door of the new room that leads to `connect_to`,
    /// `connect_side` the door of `connect_to` that leads back. Every
    /// check runs before anything is inserted, so a rejected call leaves
    /// the plan untouched.
    pub fn add_room(
        &mut self,
        name: &str,
        room_side: &str,
        connect_to: &str,
        connect_side: &str,
    ) -> Result<RoomId, GraphError> {
        if !is_storable(name) {
            return Err(GraphError::InvalidName(name.to_string()));
        }
        let target = self
            .id_of(connect_to)
            .ok_or_else(|| GraphError::UnknownRoom(connect_to.to_string()))?;
        if self.by_name.contains_key(name) {
            return Err(GraphError::DuplicateRoom(name.to_string()));
        }
        let room_side: Zone =
            room_side.parse().map_err(|_| GraphError::InvalidSide(room_side.to_string()))?;
        let connect_side: Zone =
            connect_side.parse().map_err(|_| GraphError::InvalidSide(connect_side.to_string()))?;
        if self.rooms[target.0].neighbor(connect_side).is_some() {
            return Err(GraphError::SideOccupied {
                room: connect_to.to_string(),
                side: connect_side,
            });
        }

        let id = self.insert_room(name, None, Facing::N)?;
        self.link(id, room_side, target);
        self.link(target, connect_side, id);
        Ok(id)
    }

    /// Append a room without any links
    pub(crate) fn insert_room(
        &mut self,
        name: &str,
        camera: Option<DeviceId>,
        facing: Facing,
    ) -> Result<RoomId, GraphError> {
        if !is_storable(name) {
            return Err(GraphError::InvalidName(name.to_string()));
        }
        if let Some(camera) = camera.as_ref().filter(|c| !is_storable(c.as_str())) {
            return Err(GraphError::InvalidCamera(camera.to_string()));
        }
        if self.by_name.contains_key(name) {
            return Err(GraphError::DuplicateRoom(name.to_string()));
        }
        let id = RoomId(self.rooms.len());
        self.rooms.push(Room::new(name.to_string(), camera, facing));
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Set a directed edge, replacing whatever was on that side
    pub(crate) fn link(&mut self, from: RoomId, side: Zone, to: RoomId) {
        self.rooms[from.0].neighbors[side.index()] = Some(to);
    }

    pub(crate) fn set_root(&mut self, id: RoomId) {
        self.root = Some(id);
    }

    /// Assign (or replace) the camera watching a room
    pub fn assign_camera(&mut self, room: &str, camera: DeviceId) -> Result<(), GraphError> {
        let id = self.id_of(room).ok_or_else(|| GraphError::UnknownRoom(room.to_string()))?;
        if !is_storable(camera.as_str()) {
            return Err(GraphError::InvalidCamera(camera.to_string()));
        }
        self.rooms[id.0].camera = Some(camera);
        Ok(())
    }

    pub fn set_facing(&mut self, room: &str, facing: Facing) -> Result<(), GraphError> {
        let id = self.id_of(room).ok_or_else(|| GraphError::UnknownRoom(room.to_string()))?;
        self.rooms[id.0].facing = facing;
        Ok(())
    }

    pub fn id_of(&self, name: &str) -> Option<RoomId> {
        self.by_name.get(name).copied()
    }

    pub fn room(&self, id: RoomId) -> &Room {
        &self.rooms[id.0]
    }

    pub fn room_by_name(&self, name: &str) -> Option<&Room> {
        self.id_of(name).map(|id| self.room(id))
    }

    pub fn root(&self) -> Option<RoomId> {
        self.root
    }

    /// Rooms in insertion order
    pub fn rooms(&self) -> impl Iterator<Item = (RoomId, &Room)> {
        self.rooms.iter().enumerate().map(|(i, r)| (RoomId(i), r))
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// First room (in plan order) watched by `camera`
    pub fn room_for_camera(&self, camera: &DeviceId) -> Option<RoomId> {
        self.rooms().find(|(_, r)| r.camera.as_ref() == Some(camera)).map(|(id, _)| id)
    }

    /// Apply one traffic event seen by the camera in `room`.
    ///
    /// Enter on side Z moves a person from the Z-side neighbour into this
    /// room; exit is the inverse. A missing neighbour only skips the
    /// neighbour update.
    pub fn move_person(&mut self, room: RoomId, event: TrafficEvent) {
        let neighbor = self.rooms[room.0].neighbor(event.zone);
        match event.kind {
            TrafficKind::Enter => {
                self.rooms[room.0].add(1);
                if let Some(n) = neighbor {
                    self.rooms[n.0].sub(1);
                }
            }
            TrafficKind::Exit => {
                self.rooms[room.0].sub(1);
                if let Some(n) = neighbor {
                    self.rooms[n.0].add(1);
                }
            }
        }
    }

    pub fn occupancy(&self) -> Vec<RoomOccupancy> {
        self.rooms
            .iter()
            .map(|r| RoomOccupancy { room: r.name.clone(), count: r.occupancy })
            .collect()
    }

    pub fn total_occupancy(&self) -> u64 {
        self.rooms.iter().map(|r| u64::from(r.occupancy)).sum()
    }

    /// Depth-first outline of the plan starting at the root, one `-` per
    /// level. A room is not revisited through the door it was entered by.
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        if let Some(root) = self.root {
            let mut visited = vec![false; self.rooms.len()];
            self.render_room(root, None, 0, &mut visited, &mut out);
        }
        out
    }

    fn render_room(
        &self,
        id: RoomId,
        parent: Option<RoomId>,
        depth: usize,
        visited: &mut [bool],
        out: &mut String,
    ) {
        let _ = writeln!(out, "{}{}", "-".repeat(depth), self.rooms[id.0].name);
        // Cycles longer than a back-edge would otherwise recurse forever
        visited[id.0] = true;
        for next in self.rooms[id.0].neighbors.iter().flatten() {
            if Some(*next) != parent && !visited[next.0] {
                self.render_room(*next, Some(id), depth + 1, visited, out);
            }
        }
    }
}
