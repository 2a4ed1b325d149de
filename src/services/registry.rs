//! Device session registry
//!
//! One session per device identifier for the life of the process. A
//! reconnecting device gets its channel swapped in place, so its tracker
//! and pending traffic survive the reconnect.
//!
//! The registry lock is a plain `parking_lot::Mutex` held only for each
//! discrete read/mutate step. Network I/O happens on a cloned
//! [`DeviceChannel`] outside the lock.

use crate::domain::types::{DeviceId, Detection, Frame, TrafficEvent};
use crate::services::centroid_tracker::{CentroidTracker, ObjectMap};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Live connection to a device.
///
/// `generation` changes on every (re)connect, so a worker holding a stale
/// clone cannot disconnect the newer channel.
#[derive(Debug, Clone)]
pub struct DeviceChannel {
    stream: Arc<tokio::sync::Mutex<TcpStream>>,
    generation: u64,
    peer: SocketAddr,
}

impl DeviceChannel {
    pub fn stream(&self) -> &Arc<tokio::sync::Mutex<TcpStream>> {
        &self.stream
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    New,
    Reconnected,
}

pub struct DeviceSession {
    device_id: DeviceId,
    channel: Option<DeviceChannel>,
    last_frame: Option<Frame>,
    last_detections: Vec<Detection>,
    pub(crate) tracker: CentroidTracker,
    /// Tracker output of the previous processed frame
    pub(crate) previous_objects: ObjectMap,
    traffic: VecDeque<TrafficEvent>,
    max_pending_events: usize,
}

impl DeviceSession {
    fn new(device_id: DeviceId, max_disappeared: u32, max_pending_events: usize) -> Self {
        Self {
            device_id,
            channel: None,
            last_frame: None,
            last_detections: Vec::new(),
            tracker: CentroidTracker::new(max_disappeared),
            previous_objects: ObjectMap::new(),
            traffic: VecDeque::new(),
            max_pending_events,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    pub fn channel(&self) -> Option<&DeviceChannel> {
        self.channel.as_ref()
    }

    pub fn tracker(&self) -> &CentroidTracker {
        &self.tracker
    }

    pub fn last_frame(&self) -> Option<&Frame> {
        self.last_frame.as_ref()
    }

    pub fn last_detections(&self) -> &[Detection] {
        &self.last_detections
    }

    pub fn pending_traffic(&self) -> usize {
        self.traffic.len()
    }

    pub(crate) fn record_frame(&mut self, frame: Frame, detections: Vec<Detection>) {
        self.last_frame = Some(frame);
        self.last_detections = detections;
    }

    /// Queue events in order. Returns how many old events were dropped to
    /// stay within the cap.
    pub(crate) fn push_traffic(&mut self, events: impl IntoIterator<Item = TrafficEvent>) -> usize {
        let mut dropped = 0;
        for event in events {
            if self.max_pending_events > 0 && self.traffic.len() >= self.max_pending_events {
                self.traffic.pop_front();
                dropped += 1;
            }
            self.traffic.push_back(event);
        }
        dropped
    }

    pub(crate) fn drain_traffic(&mut self) -> Vec<TrafficEvent> {
        self.traffic.drain(..).collect()
    }
}

/// Point-in-time view of a session, for the camera viewer and HTTP output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub device_id: DeviceId,
    pub connected: bool,
    pub peer: Option<String>,
    pub frame_size: Option<(u32, u32)>,
    pub detections: usize,
    pub tracked_objects: usize,
    pub pending_events: usize,
}

impl SessionSnapshot {
    fn of(session: &DeviceSession) -> Self {
        Self {
            device_id: session.device_id.clone(),
            connected: session.is_connected(),
            peer: session.channel.as_ref().map(|c| c.peer.to_string()),
            frame_size: session.last_frame.as_ref().map(|f| (f.width(), f.height())),
            detections: session.last_detections.len(),
            tracked_objects: session.tracker.objects().len(),
            pending_events: session.traffic.len(),
        }
    }
}

struct RegistryInner {
    /// Registration order
    sessions: Vec<DeviceSession>,
    index: FxHashMap<DeviceId, usize>,
    next_generation: u64,
}

pub struct Registry {
    inner: Mutex<RegistryInner>,
    max_disappeared: u32,
    max_pending_events: usize,
}

impl Registry {
    pub fn new(max_disappeared: u32, max_pending_events: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                sessions: Vec::new(),
                index: FxHashMap::default(),
                next_generation: 1,
            }),
            max_disappeared,
            max_pending_events,
        }
    }

    /// Attach a freshly handshaken connection.
    ///
    /// A known identifier keeps its session and only the channel is
    /// replaced; a new identifier gets a new session.
    pub fn register(
        &self,
        device_id: DeviceId,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> (Registration, DeviceChannel) {
        let mut inner = self.inner.lock();
        let generation = inner.next_generation;
        inner.next_generation += 1;
        let channel = DeviceChannel { stream: Arc::new(tokio::sync::Mutex::new(stream)), generation, peer };

        let existing = inner.index.get(&device_id).copied();
        if let Some(idx) = existing {
            let session = &mut inner.sessions[idx];
            let was_connected = session.channel.is_some();
            session.channel = Some(channel.clone());
            info!(
                device_id = %device_id,
                peer = %peer,
                replaced_live_channel = %was_connected,
                tracked_objects = %session.tracker.objects().len(),
                "device_reconnected"
            );
            return (Registration::Reconnected, channel);
        }

        let mut session =
            DeviceSession::new(device_id.clone(), self.max_disappeared, self.max_pending_events);
        session.channel = Some(channel.clone());
        let idx = inner.sessions.len();
        inner.sessions.push(session);
        inner.index.insert(device_id.clone(), idx);
        info!(device_id = %device_id, peer = %peer, sessions = %inner.sessions.len(), "device_registered");
        (Registration::New, channel)
    }

    /// Connected devices in registry order
    pub fn active_channels(&self) -> Vec<(DeviceId, DeviceChannel)> {
        let inner = self.inner.lock();
        inner
            .sessions
            .iter()
            .filter_map(|s| s.channel.as_ref().map(|c| (s.device_id.clone(), c.clone())))
            .collect()
    }

    /// Null the channel if it is still the given generation.
    /// Returns false when the device has since reconnected (or is unknown).
    pub fn disconnect(&self, device_id: &DeviceId, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.index.get(device_id) else {
            warn!(device_id = %device_id, "disconnect_unknown_device");
            return false;
        };
        let session = &mut inner.sessions[idx];
        match &session.channel {
            Some(c) if c.generation == generation => {
                session.channel = None;
                debug!(device_id = %device_id, generation = %generation, "device_channel_cleared");
                true
            }
            _ => false,
        }
    }

    /// Run `f` on one session under the registry lock
    pub fn with_session<R>(
        &self,
        device_id: &DeviceId,
        f: impl FnOnce(&mut DeviceSession) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock();
        let idx = *inner.index.get(device_id)?;
        Some(f(&mut inner.sessions[idx]))
    }

    /// Take every queued event for a device, oldest first
    pub fn drain_traffic(&self, device_id: &DeviceId) -> Vec<TrafficEvent> {
        self.with_session(device_id, DeviceSession::drain_traffic).unwrap_or_default()
    }

    pub fn contains(&self, device_id: &DeviceId) -> bool {
        self.inner.lock().index.contains_key(device_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn connected_count(&self) -> usize {
        self.inner.lock().sessions.iter().filter(|s| s.is_connected()).count()
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.inner.lock().sessions.iter().map(|s| s.device_id.clone()).collect()
    }

    /// Snapshot of the session at `position` in registry order
    pub fn snapshot_at(&self, position: usize) -> Option<SessionSnapshot> {
        self.inner.lock().sessions.get(position).map(SessionSnapshot::of)
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.inner.lock().sessions.iter().map(SessionSnapshot::of).collect()
    }

    /// Drop every session (and with it every device socket).
    /// Only used on shutdown, after all tasks are joined.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let count = inner.sessions.len();
        inner.sessions.clear();
        inner.index.clear();
        info!(sessions = %count, "registry_cleared");
    }
}
