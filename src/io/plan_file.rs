//! Floor plan persistence (`.floorplan` text files)
//!
//! Each room is written as six consecutive lines:
//!
//! ```text
//! 0 roomName Lobby
//! 0 leftRoom none
//! 0 middleRoom Office 2
//! 0 rightRoom none
//! 0 camera 24:0a:c4:00:00:01
//! 0 direction N
//! ```
//!
//! The leading number is the room's position in the file; the first room
//! becomes the plan's root. Missing neighbours and cameras are written as
//! `none`. Values may contain spaces: everything after the field name is
//! the value.

use crate::domain::floor_plan::{is_storable, FloorPlan, GraphError, NONE_TOKEN};
use crate::domain::types::{DeviceId, Facing, Zone};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const PLAN_EXTENSION: &str = "floorplan";

const LINES_PER_ROOM: usize = 6;
const FIELDS: [&str; LINES_PER_ROOM] =
    ["roomName", "leftRoom", "middleRoom", "rightRoom", "camera", "direction"];

#[derive(Debug, thiserror::Error)]
pub enum PlanFileError {
    #[error("{0} is not a .floorplan file")]
    BadExtension(PathBuf),
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("floor plan has no rooms")]
    Empty,
    #[error(transparent)]
    Graph(#[from] GraphError),
}

fn malformed(line: usize, reason: impl Into<String>) -> PlanFileError {
    PlanFileError::Malformed { line, reason: reason.into() }
}

/// Render a plan in file format. Fails on an empty plan, or on a name or
/// camera that would not read back unchanged.
pub fn to_plan_text(plan: &FloorPlan) -> Result<String, PlanFileError> {
    if plan.is_empty() {
        return Err(PlanFileError::Empty);
    }

    let mut out = String::new();
    for (index, (_, room)) in plan.rooms().enumerate() {
        if !is_storable(room.name()) {
            return Err(GraphError::InvalidName(room.name().to_string()).into());
        }
        if let Some(camera) = room.camera().filter(|c| !is_storable(c.as_str())) {
            return Err(GraphError::InvalidCamera(camera.to_string()).into());
        }
        let neighbor_name =
            |side: Zone| room.neighbor(side).map(|id| plan.room(id).name()).unwrap_or(NONE_TOKEN);
        let camera = room.camera().map(DeviceId::as_str).unwrap_or(NONE_TOKEN);

        let _ = writeln!(out, "{index} roomName {}", room.name());
        let _ = writeln!(out, "{index} leftRoom {}", neighbor_name(Zone::Left));
        let _ = writeln!(out, "{index} middleRoom {}", neighbor_name(Zone::Middle));
        let _ = writeln!(out, "{index} rightRoom {}", neighbor_name(Zone::Right));
        let _ = writeln!(out, "{index} camera {camera}");
        let _ = writeln!(out, "{index} direction {}", room.facing());
    }
    Ok(out)
}

/// Parse file contents into a plan. Nothing is returned unless the whole
/// file is valid.
pub fn parse_plan_text(text: &str) -> Result<FloorPlan, PlanFileError> {
    // (line number, field, value)
    let mut entries: Vec<(usize, &str, String)> = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        let line_no = i + 1;
        let tokens: Vec<&str> = raw.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        if tokens.len() < 3 {
            return Err(malformed(line_no, "expected \"<index> <field> <value>\""));
        }
        entries.push((line_no, tokens[1], tokens[2..].join(" ")));
    }

    if entries.is_empty() {
        return Err(PlanFileError::Empty);
    }
    if entries.len() % LINES_PER_ROOM != 0 {
        let last = entries.last().map(|e| e.0).unwrap_or(0);
        return Err(malformed(
            last,
            format!("{} entries is not a multiple of {LINES_PER_ROOM}", entries.len()),
        ));
    }

    let groups: Vec<&[(usize, &str, String)]> = entries.chunks(LINES_PER_ROOM).collect();
    for group in &groups {
        for ((line_no, field, _), expected) in group.iter().zip(FIELDS) {
            if *field != expected {
                return Err(malformed(
                    *line_no,
                    format!("expected field {expected}, found {field}"),
                ));
            }
        }
    }

    let mut plan = FloorPlan::new();

    // Rooms first, so neighbours can refer to rooms later in the file
    for group in &groups {
        let name = &group[0].2;
        let camera = optional(&group[4].2).map(DeviceId::new);
        let facing = match Facing::parse(&group[5].2) {
            Some(f) => f,
            None => {
                warn!(room = %name, direction = %group[5].2, "invalid_direction_defaulting_to_n");
                Facing::N
            }
        };
        plan.insert_room(name, camera, facing)?;
    }

    for group in &groups {
        let Some(from) = plan.id_of(&group[0].2) else {
            return Err(malformed(group[0].0, "room vanished during load"));
        };
        for (offset, side) in Zone::ALL.into_iter().enumerate() {
            let (line_no, _, value) = &group[1 + offset];
            if let Some(target) = optional(value) {
                let to = plan
                    .id_of(target)
                    .ok_or_else(|| malformed(*line_no, format!("unknown room {target:?}")))?;
                plan.link(from, side, to);
            }
        }
    }

    if let Some(root) = plan.id_of(&groups[0][0].2) {
        plan.set_root(root);
    }
    Ok(plan)
}

fn optional(value: &str) -> Option<&str> {
    if value == NONE_TOKEN {
        None
    } else {
        Some(value)
    }
}

fn has_plan_extension(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == PLAN_EXTENSION)
}

/// Load a plan from a `.floorplan` file
pub fn load(path: impl AsRef<Path>) -> Result<FloorPlan, PlanFileError> {
    let path = path.as_ref();
    if !has_plan_extension(path) {
        return Err(PlanFileError::BadExtension(path.to_path_buf()));
    }

    let text = fs::read_to_string(path)
        .map_err(|source| PlanFileError::Io { path: path.to_path_buf(), source })?;
    let plan = parse_plan_text(&text)?;

    info!(path = %path.display(), rooms = %plan.len(), "floor_plan_loaded");
    Ok(plan)
}

/// Save a plan, appending `.floorplan` when the path lacks it.
/// Returns the path actually written.
pub fn save(plan: &FloorPlan, path: impl AsRef<Path>) -> Result<PathBuf, PlanFileError> {
    let mut path = path.as_ref().to_path_buf();
    if !has_plan_extension(&path) {
        let mut name = path.clone().into_os_string();
        name.push(".");
        name.push(PLAN_EXTENSION);
        path = PathBuf::from(name);
    }

    let text = to_plan_text(plan)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .map_err(|source| PlanFileError::Io { path: path.clone(), source })?;
        }
    }
    fs::write(&path, text).map_err(|source| PlanFileError::Io { path: path.clone(), source })?;

    debug!(path = %path.display(), rooms = %plan.len(), "floor_plan_saved");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_plan() -> FloorPlan {
        let mut plan =
            FloorPlan::with_first_room("Front Hall", Some("cam 1".into()), Facing::E).unwrap();
        plan.add_room("Office 2", "Middle", "Front Hall", "Left").unwrap();
        plan.add_room("Kitchen", "Right", "Front Hall", "Middle").unwrap();
        plan.assign_camera("Kitchen", DeviceId::from("cam2")).unwrap();
        plan
    }

    fn neighbor_names(plan: &FloorPlan, room: &str) -> [Option<String>; 3] {
        let r = plan.room_by_name(room).unwrap();
        Zone::ALL.map(|z| r.neighbor(z).map(|id| plan.room(id).name().to_string()))
    }

    #[test]
    fn test_round_trip_preserves_graph() {
        let dir = tempdir().unwrap();
        let plan = sample_plan();

        let written = save(&plan, dir.path().join("house")).unwrap();
        assert_eq!(written.extension().unwrap(), "floorplan");

        let loaded = load(&written).unwrap();
        assert_eq!(loaded.len(), plan.len());
        assert_eq!(loaded.root(), loaded.id_of("Front Hall"));
        for (_, room) in plan.rooms() {
            let other = loaded.room_by_name(room.name()).unwrap();
            assert_eq!(other.camera(), room.camera());
            assert_eq!(other.facing(), room.facing());
            assert_eq!(neighbor_names(&loaded, room.name()), neighbor_names(&plan, room.name()));
        }
    }

    #[test]
    fn test_every_accepted_name_round_trips() {
        let dir = tempdir().unwrap();
        let mut plan = sample_plan();
        let candidates = ["", "none", " Lobby", "Lobby ", "Office  3", "Store\troom", "Room 4 b"];
        for name in candidates {
            // Whatever the plan accepts must survive a save and load
            let _ = plan.add_room(name, "Left", "Kitchen", "Left");
            let _ = plan.add_room(name, "Left", "Office 2", "Right");
        }
        assert_eq!(plan.len(), 4);

        let loaded = load(save(&plan, dir.path().join("names")).unwrap()).unwrap();
        assert_eq!(loaded.len(), plan.len());
        for (_, room) in plan.rooms() {
            assert!(loaded.room_by_name(room.name()).is_some(), "{:?}", room.name());
            assert_eq!(neighbor_names(&loaded, room.name()), neighbor_names(&plan, room.name()));
        }
    }

    #[test]
    fn test_parse_rejects_room_named_none() {
        let text = "0 roomName none\n0 leftRoom none\n0 middleRoom none\n0 rightRoom none\n0 camera none\n0 direction N\n";
        assert!(matches!(
            parse_plan_text(text),
            Err(PlanFileError::Graph(GraphError::InvalidName(_)))
        ));
    }

    #[test]
    fn test_text_format() {
        let plan = FloorPlan::with_first_room("A", None, Facing::N).unwrap();
        let text = to_plan_text(&plan).unwrap();
        assert_eq!(
            text,
            "0 roomName A\n0 leftRoom none\n0 middleRoom none\n0 rightRoom none\n0 camera none\n0 direction N\n"
        );
    }

    #[test]
    fn test_empty_plan_not_written() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.floorplan");
        assert!(matches!(save(&FloorPlan::new(), &path), Err(PlanFileError::Empty)));
        assert!(!path.exists());
    }

    #[test]
    fn test_load_rejects_bad_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plan.txt");
        fs::write(&path, to_plan_text(&sample_plan()).unwrap()).unwrap();
        assert!(matches!(load(&path), Err(PlanFileError::BadExtension(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        assert!(matches!(load(dir.path().join("nope.floorplan")), Err(PlanFileError::Io { .. })));
    }

    #[test]
    fn test_parse_rejects_truncated_room() {
        let text = "0 roomName A\n0 leftRoom none\n0 middleRoom none\n";
        assert!(matches!(parse_plan_text(text), Err(PlanFileError::Malformed { .. })));
    }

    #[test]
    fn test_parse_rejects_unknown_neighbor() {
        let text = "0 roomName A\n0 leftRoom Ghost\n0 middleRoom none\n0 rightRoom none\n0 camera none\n0 direction N\n";
        match parse_plan_text(text) {
            Err(PlanFileError::Malformed { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected malformed, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_keeps_asymmetric_links() {
        let text = "\
0 roomName A
0 leftRoom none
0 middleRoom B
0 rightRoom none
0 camera mac1
0 direction S
1 roomName B
1 leftRoom none
1 middleRoom none
1 rightRoom none
1 camera none
1 direction X
";
        let plan = parse_plan_text(text).unwrap();
        let a = plan.room_by_name("A").unwrap();
        let b = plan.room_by_name("B").unwrap();
        assert_eq!(a.neighbor(Zone::Middle), plan.id_of("B"));
        assert_eq!(b.neighbor(Zone::Middle), None);
        assert_eq!(a.camera(), Some(&DeviceId::from("mac1")));
        assert_eq!(a.facing(), Facing::S);
        assert_eq!(b.facing(), Facing::N);
    }
}
