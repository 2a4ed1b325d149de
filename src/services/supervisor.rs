//! Service context
//!
//! `Brain` owns the shared state (registry, occupancy engine, metrics,
//! detector) and the long-running tasks. Each task has its own shutdown
//! channel so it can be started and stopped independently; `shutdown`
//! stops and joins all of them before the registry is released.

use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::detector::Detector;
use crate::io::device_listener::{run_device_listener, ListenerSettings};
use crate::io::discovery::{run_discovery_responder, DiscoverySettings};
use crate::services::occupancy::{run_occupancy_loop, LoadError, OccupancyEngine};
use crate::services::pipeline::FramePipeline;
use crate::services::registry::{Registry, SessionSnapshot};
use crate::services::worker::{StreamingWorker, WorkerSettings};
use crate::services::zones::ZoneClassifier;
use anyhow::Context;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Listener,
    Discovery,
    Worker,
    Occupancy,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Listener => "listener",
            TaskKind::Discovery => "discovery",
            TaskKind::Worker => "worker",
            TaskKind::Occupancy => "occupancy",
        }
    }
}

struct RunningTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
    local_addr: Option<SocketAddr>,
}

#[derive(Default)]
struct TaskSlots {
    listener: Option<RunningTask>,
    discovery: Option<RunningTask>,
    worker: Option<RunningTask>,
    occupancy: Option<RunningTask>,
}

impl TaskSlots {
    fn get(&self, kind: TaskKind) -> Option<&RunningTask> {
        match kind {
            TaskKind::Listener => self.listener.as_ref(),
            TaskKind::Discovery => self.discovery.as_ref(),
            TaskKind::Worker => self.worker.as_ref(),
            TaskKind::Occupancy => self.occupancy.as_ref(),
        }
    }

    fn slot(&mut self, kind: TaskKind) -> &mut Option<RunningTask> {
        match kind {
            TaskKind::Listener => &mut self.listener,
            TaskKind::Discovery => &mut self.discovery,
            TaskKind::Worker => &mut self.worker,
            TaskKind::Occupancy => &mut self.occupancy,
        }
    }
}

pub struct Brain {
    config: Config,
    metrics: Arc<Metrics>,
    registry: Arc<Registry>,
    engine: Arc<OccupancyEngine>,
    pipeline: Arc<FramePipeline>,
    tasks: TaskSlots,
    /// Camera viewer position in registry order
    cursor: usize,
}

impl Brain {
    pub fn new(config: Config, detector: Arc<dyn Detector>, metrics: Arc<Metrics>) -> Self {
        let registry = Arc::new(Registry::new(config.max_disappeared(), config.max_pending_events()));
        let pipeline = Arc::new(FramePipeline::new(
            detector,
            ZoneClassifier::new(config.frame_width()),
            config.confidence_threshold(),
            config.nms_threshold(),
            metrics.clone(),
        ));
        Self {
            config,
            metrics,
            registry,
            engine: Arc::new(OccupancyEngine::new()),
            pipeline,
            tasks: TaskSlots::default(),
            cursor: 0,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<OccupancyEngine> {
        &self.engine
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn is_running(&self, kind: TaskKind) -> bool {
        self.tasks.get(kind).is_some_and(|t| !t.handle.is_finished())
    }

    /// Bound address of a running listener/discovery task
    pub fn local_addr(&self, kind: TaskKind) -> Option<SocketAddr> {
        self.tasks.get(kind).and_then(|t| t.local_addr)
    }

    /// Start a task. Starting a running task is a no-op.
    pub async fn start(&mut self, kind: TaskKind) -> anyhow::Result<()> {
        if self.is_running(kind) {
            return Ok(());
        }
        // Reap a task that exited on its own
        self.stop(kind).await;

        let (stop, rx) = watch::channel(false);
        let (handle, local_addr) = match kind {
            TaskKind::Listener => {
                let addr = self.config.listener_addr();
                let listener = TcpListener::bind(&addr)
                    .await
                    .with_context(|| format!("failed to bind device listener on {addr}"))?;
                let local = listener.local_addr().ok();
                let handle = tokio::spawn(run_device_listener(
                    listener,
                    self.registry.clone(),
                    ListenerSettings::from_config(&self.config),
                    self.metrics.clone(),
                    rx,
                ));
                (handle, local)
            }
            TaskKind::Discovery => {
                let addr = format!("{}:{}", self.config.bind_address(), self.config.discovery_port());
                let socket = UdpSocket::bind(&addr)
                    .await
                    .with_context(|| format!("failed to bind discovery socket on {addr}"))?;
                let local = socket.local_addr().ok();
                let handle = tokio::spawn(run_discovery_responder(
                    socket,
                    DiscoverySettings::from_config(&self.config),
                    self.metrics.clone(),
                    rx,
                ));
                (handle, local)
            }
            TaskKind::Worker => {
                let worker = StreamingWorker::new(
                    self.registry.clone(),
                    self.pipeline.clone(),
                    self.metrics.clone(),
                    WorkerSettings::from_config(&self.config),
                );
                (tokio::spawn(worker.run(rx)), None)
            }
            TaskKind::Occupancy => {
                let handle = tokio::spawn(run_occupancy_loop(
                    self.engine.clone(),
                    self.registry.clone(),
                    self.metrics.clone(),
                    self.config.occupancy_refresh_interval(),
                    rx,
                ));
                (handle, None)
            }
        };

        info!(task = %kind.as_str(), addr = ?local_addr, "task_started");
        *self.tasks.slot(kind) = Some(RunningTask { stop, handle, local_addr });
        Ok(())
    }

    /// Signal a task and wait for it to exit
    pub async fn stop(&mut self, kind: TaskKind) {
        let Some(task) = self.tasks.slot(kind).take() else {
            return;
        };
        let _ = task.stop.send(true);
        if let Err(e) = task.handle.await {
            error!(task = %kind.as_str(), error = %e, "task_join_failed");
        }
        info!(task = %kind.as_str(), "task_stopped");
    }

    /// Start the tasks enabled in configuration
    pub async fn start_enabled(&mut self) -> anyhow::Result<()> {
        if self.config.listener_enabled() {
            self.start(TaskKind::Listener).await?;
        }
        if self.config.discovery_enabled() {
            self.start(TaskKind::Discovery).await?;
        }
        if self.config.worker_enabled() {
            self.start(TaskKind::Worker).await?;
        }
        self.start(TaskKind::Occupancy).await
    }

    /// One-shot floor plan load; rejected while a plan is active
    pub fn load_floor_plan(&self, path: impl AsRef<Path>) -> Result<(), LoadError> {
        let path = path.as_ref();
        self.engine.load_plan(path)?;
        if let Some(tree) = self.engine.render_tree() {
            info!(path = %path.display(), tree = %tree.trim_end(), "floor_plan_active");
        }
        Ok(())
    }

    /// Snapshot of the camera under the cursor, clamping the cursor to the
    /// current registry size
    pub fn selected_camera(&mut self) -> Option<SessionSnapshot> {
        let len = self.registry.len();
        if len == 0 {
            self.cursor = 0;
            return None;
        }
        self.cursor = self.cursor.min(len - 1);
        self.registry.snapshot_at(self.cursor)
    }

    pub fn select_next_camera(&mut self) -> Option<SessionSnapshot> {
        let len = self.registry.len();
        if self.cursor + 1 < len {
            self.cursor += 1;
        }
        self.selected_camera()
    }

    pub fn select_prev_camera(&mut self) -> Option<SessionSnapshot> {
        self.cursor = self.cursor.saturating_sub(1);
        self.selected_camera()
    }

    /// Stop every task, then drop all sessions (closing device sockets)
    pub async fn shutdown(&mut self) {
        for kind in [TaskKind::Listener, TaskKind::Discovery, TaskKind::Worker, TaskKind::Occupancy] {
            self.stop(kind).await;
        }
        self.registry.clear();
        info!("brain_shutdown_complete");
    }
}
