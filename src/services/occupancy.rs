//! Occupancy engine: folds queued traffic into the active floor plan
//!
//! Lock order is plan first, then registry. The registry lock is taken
//! once per drained device and never held while the plan is walked.

use crate::domain::floor_plan::{FloorPlan, RoomOccupancy};
use crate::domain::types::DeviceId;
use crate::infra::metrics::Metrics;
use crate::io::plan_file::{self, PlanFileError};
use crate::services::registry::Registry;
use parking_lot::RwLock;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("a floor plan is already loaded")]
    AlreadyLoaded,
    #[error(transparent)]
    File(#[from] PlanFileError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OccupancySnapshot {
    pub rooms: Vec<RoomOccupancy>,
    pub total: u64,
}

#[derive(Default)]
pub struct OccupancyEngine {
    plan: RwLock<Option<FloorPlan>>,
}

impl OccupancyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_plan(&self) -> bool {
        self.plan.read().is_some()
    }

    /// Load and install a plan from disk. Fails without side effects when a
    /// plan is already active or the file is bad.
    pub fn load_plan(&self, path: impl AsRef<Path>) -> Result<(), LoadError> {
        if self.has_plan() {
            return Err(LoadError::AlreadyLoaded);
        }
        let plan = plan_file::load(path)?;
        self.install_plan(plan)
    }

    /// Make `plan` the active plan, unless one is already active
    pub fn install_plan(&self, plan: FloorPlan) -> Result<(), LoadError> {
        let mut slot = self.plan.write();
        if slot.is_some() {
            return Err(LoadError::AlreadyLoaded);
        }
        info!(rooms = %plan.len(), "floor_plan_installed");
        *slot = Some(plan);
        Ok(())
    }

    /// Drain the traffic of every device with an assigned room and apply it
    /// in FIFO order. Returns the number of events applied.
    ///
    /// Devices without a room keep their events queued. A camera assigned
    /// to several rooms feeds the first one.
    pub fn apply_pending(&self, registry: &Registry, metrics: &Metrics) -> usize {
        let mut guard = self.plan.write();
        let Some(plan) = guard.as_mut() else {
            return 0;
        };

        let mut applied = 0;
        for device_id in registry.device_ids() {
            let Some(room) = plan.room_for_camera(&device_id) else {
                continue;
            };
            let events = registry.drain_traffic(&device_id);
            for event in &events {
                plan.move_person(room, *event);
            }
            if !events.is_empty() {
                debug!(
                    device_id = %device_id,
                    room = %plan.room(room).name(),
                    events = %events.len(),
                    "traffic_applied"
                );
            }
            applied += events.len();
        }

        if applied > 0 {
            metrics.record_events_applied(applied);
        }
        applied
    }

    pub fn snapshot(&self) -> Option<OccupancySnapshot> {
        self.plan
            .read()
            .as_ref()
            .map(|plan| OccupancySnapshot { rooms: plan.occupancy(), total: plan.total_occupancy() })
    }

    pub fn room_count(&self, room: &str) -> Option<u32> {
        self.plan.read().as_ref()?.room_by_name(room).map(|r| r.occupancy())
    }

    pub fn camera_room(&self, device_id: &DeviceId) -> Option<String> {
        let guard = self.plan.read();
        let plan = guard.as_ref()?;
        plan.room_for_camera(device_id).map(|id| plan.room(id).name().to_string())
    }

    pub fn render_tree(&self) -> Option<String> {
        self.plan.read().as_ref().map(FloorPlan::render_tree)
    }
}

/// Apply pending traffic every `interval` until shutdown; logs the room
/// counts whenever they change.
pub async fn run_occupancy_loop(
    engine: Arc<OccupancyEngine>,
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_ms = %interval.as_millis(), "occupancy_loop_started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last: Option<OccupancySnapshot> = None;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if engine.apply_pending(&registry, &metrics) == 0 {
                    continue;
                }
                let snapshot = engine.snapshot();
                if snapshot != last {
                    if let Some(s) = &snapshot {
                        let rooms = s
                            .rooms
                            .iter()
                            .map(|r| format!("{}={}", r.room, r.count))
                            .collect::<Vec<_>>()
                            .join(",");
                        info!(total = %s.total, rooms = %rooms, "occupancy_changed");
                    }
                    last = snapshot;
                }
            }
        }
    }

    // Final drain so nothing queued before shutdown is lost
    engine.apply_pending(&registry, &metrics);
    info!("occupancy_loop_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Facing, TrafficEvent, Zone};
    use tempfile::tempdir;
    use tokio::net::{TcpListener, TcpStream};

    fn two_rooms() -> FloorPlan {
        let mut plan = FloorPlan::with_first_room("A", Some(DeviceId::from("cam1")), Facing::N).unwrap();
        plan.add_room("B", "Middle", "A", "Middle").unwrap();
        plan
    }

    async fn registry_with(ids: &[&str]) -> (Registry, Vec<TcpStream>) {
        let registry = Registry::new(3, 64);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut clients = Vec::new();
        for id in ids {
            let client = TcpStream::connect(addr).await.unwrap();
            let (server, peer) = listener.accept().await.unwrap();
            registry.register(DeviceId::from(*id), server, peer);
            clients.push(client);
        }
        (registry, clients)
    }

    fn queue(registry: &Registry, id: &str, events: &[TrafficEvent]) {
        registry.with_session(&DeviceId::from(id), |s| s.push_traffic(events.iter().copied()));
    }

    #[tokio::test]
    async fn test_enter_twice_exit_once() {
        let engine = OccupancyEngine::new();
        engine.install_plan(two_rooms()).unwrap();
        let (registry, _clients) = registry_with(&["cam1"]).await;
        let metrics = Metrics::new();

        queue(
            &registry,
            "cam1",
            &[
                TrafficEvent::enter(Zone::Middle),
                TrafficEvent::enter(Zone::Middle),
                TrafficEvent::exit(Zone::Middle),
            ],
        );
        assert_eq!(engine.apply_pending(&registry, &metrics), 3);

        assert_eq!(engine.room_count("A"), Some(1));
        // B: 0 -> 0 -> 0 -> 1, clamped at each step
        assert_eq!(engine.room_count("B"), Some(1));
        assert!(registry.drain_traffic(&DeviceId::from("cam1")).is_empty());
    }

    #[tokio::test]
    async fn test_unassigned_device_keeps_its_queue() {
        let engine = OccupancyEngine::new();
        engine.install_plan(two_rooms()).unwrap();
        let (registry, _clients) = registry_with(&["cam1", "cam9"]).await;

        queue(&registry, "cam9", &[TrafficEvent::enter(Zone::Left)]);
        assert_eq!(engine.apply_pending(&registry, &Metrics::new()), 0);
        assert_eq!(registry.drain_traffic(&DeviceId::from("cam9")).len(), 1);
    }

    #[tokio::test]
    async fn test_no_plan_applies_nothing() {
        let engine = OccupancyEngine::new();
        let (registry, _clients) = registry_with(&["cam1"]).await;
        queue(&registry, "cam1", &[TrafficEvent::enter(Zone::Left)]);

        assert_eq!(engine.apply_pending(&registry, &Metrics::new()), 0);
        assert!(engine.snapshot().is_none());
    }

    #[test]
    fn test_second_load_rejected_and_plan_untouched() {
        let dir = tempdir().unwrap();
        let path = plan_file::save(&two_rooms(), dir.path().join("home")).unwrap();

        let engine = OccupancyEngine::new();
        engine.load_plan(&path).unwrap();
        assert!(matches!(engine.load_plan(&path), Err(LoadError::AlreadyLoaded)));
        assert_eq!(engine.camera_room(&DeviceId::from("cam1")).as_deref(), Some("A"));
    }

    #[test]
    fn test_failed_load_installs_nothing() {
        let dir = tempdir().unwrap();
        let engine = OccupancyEngine::new();
        let bad = dir.path().join("plan.txt");
        std::fs::write(&bad, "0 roomName A\n").unwrap();

        assert!(matches!(engine.load_plan(&bad), Err(LoadError::File(_))));
        assert!(!engine.has_plan());
    }
}
