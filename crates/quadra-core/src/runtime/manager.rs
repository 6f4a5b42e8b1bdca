use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::domain::events::JobEvent;
use crate::domain::flow::{FlowHandle, FlowSpec};
use crate::domain::queue::{QueueBackend, QueueCounts};
use crate::error::CoreError;
use crate::runtime::dispatcher::Dispatcher;
use crate::runtime::flow_tracker::FlowTracker;
use crate::runtime::registry::JobRegistry;
use crate::runtime::scheduler::spawn_schedule;
use crate::runtime::worker::Worker;
use crate::types::{JobId, JobName, QueueName};

/// Tuning knobs for the manager's runtime tasks
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Concurrent workers per named queue
    pub workers_per_queue: usize,

    /// How long an idle worker sleeps between claim attempts
    pub poll_interval: Duration,

    /// How often delayed jobs are promoted and stalled jobs reaped
    pub housekeeping_interval: Duration,

    /// An `Active` job older than this is considered stalled and
    /// requeued as a fresh attempt
    pub stall_threshold: Duration,

    /// Lifecycle event channel capacity
    pub event_capacity: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            workers_per_queue: 2,
            poll_interval: Duration::from_millis(250),
            housekeeping_interval: Duration::from_secs(1),
            stall_threshold: Duration::from_secs(5 * 60),
            event_capacity: 256,
        }
    }
}

/// One queue's entry on the introspection board
#[derive(Debug, Clone, Serialize)]
pub struct QueueBoard {
    /// Queue name
    pub queue: QueueName,

    /// Job counts by state
    pub counts: QueueCounts,
}

/// Read-only snapshot of every queue for the introspection board
#[derive(Debug, Clone, Serialize)]
pub struct BoardSnapshot {
    /// Per-queue counts
    pub queues: Vec<QueueBoard>,
}

/// Owner of the job engine: registry bindings, dispatch surface, and
/// the lifecycle of workers, schedules, and housekeeping.
///
/// Explicitly constructed and passed by handle to whatever needs it
/// (the HTTP layer, the composition root); `start`/`stop` bound the
/// life of every task it spawns.
#[derive(Debug)]
pub struct JobManager {
    registry: Arc<JobRegistry>,
    backend: Arc<dyn QueueBackend>,
    tracker: Arc<FlowTracker>,
    events: broadcast::Sender<JobEvent>,
    settings: ManagerSettings,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl JobManager {
    /// Create a manager over a validated registry and a queue backend
    pub fn new(
        registry: JobRegistry,
        backend: Arc<dyn QueueBackend>,
        settings: ManagerSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity);
        let (shutdown, _) = watch::channel(false);
        let tracker = Arc::new(FlowTracker::new(backend.clone()));

        Self {
            registry: Arc::new(registry),
            backend,
            tracker,
            events,
            settings,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Enqueue handle usable independently of the manager's lifecycle
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.registry.clone(),
            self.backend.clone(),
            self.tracker.clone(),
        )
    }

    /// Enqueue a single job of a registered type
    pub async fn dispatch(&self, name: &JobName, payload: Value) -> Result<JobId, CoreError> {
        self.dispatcher().dispatch(name, payload).await
    }

    /// Enqueue a flow: one parent barred on N children
    pub async fn dispatch_flow(&self, spec: FlowSpec) -> Result<FlowHandle, CoreError> {
        self.dispatcher().dispatch_flow(spec).await
    }

    /// Subscribe to job lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// The registry this manager dispatches against
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// The backend owning all job state (for board detail lookups)
    pub fn backend(&self) -> Arc<dyn QueueBackend> {
        self.backend.clone()
    }

    /// Start workers for every registered queue, recurring-schedule
    /// tasks, and the housekeeping tick. Fails if already started.
    pub async fn start(&self) -> Result<(), CoreError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CoreError::LifecycleError(
                "Job manager already started".to_string(),
            ));
        }

        let mut tasks = self.tasks.lock().await;
        let dispatcher = self.dispatcher();

        for queue in self.registry.queues() {
            for _ in 0..self.settings.workers_per_queue {
                let worker = Worker::new(
                    queue.clone(),
                    dispatcher.clone(),
                    self.events.clone(),
                    self.settings.poll_interval,
                    self.shutdown.subscribe(),
                );
                tasks.push(worker.spawn());
            }
        }

        for definition in self.registry.definitions() {
            if definition.schedule.is_some() {
                tasks.push(spawn_schedule(
                    definition.clone(),
                    dispatcher.clone(),
                    self.shutdown.subscribe(),
                ));
            }
        }

        tasks.push(self.spawn_housekeeping());

        info!(
            queues = self.registry.queues().len(),
            definitions = self.registry.len(),
            "Job manager started"
        );
        Ok(())
    }

    /// Signal shutdown, wait for in-flight handlers to settle, and
    /// join every spawned task before returning.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Job manager stopping");
        let _ = self.shutdown.send(true);

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Engine task ended abnormally");
            }
        }
        let _ = self.shutdown.send(false);
        info!("Job manager stopped");
    }

    /// Snapshot of every queue's counts for the introspection board
    pub async fn board(&self) -> Result<BoardSnapshot, CoreError> {
        let mut queues = self.registry.queues();
        for queue in self.backend.queues().await? {
            if !queues.contains(&queue) {
                queues.push(queue);
            }
        }

        let mut board = Vec::with_capacity(queues.len());
        for queue in queues {
            let counts = self.backend.counts(&queue).await?;
            board.push(QueueBoard { queue, counts });
        }
        Ok(BoardSnapshot { queues: board })
    }

    fn spawn_housekeeping(&self) -> JoinHandle<()> {
        let backend = self.backend.clone();
        let interval = self.settings.housekeeping_interval;
        let stall_threshold = self.settings.stall_threshold;
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                        continue;
                    }
                }

                match backend.promote_due().await {
                    Ok(promoted) if !promoted.is_empty() => {
                        debug!(count = promoted.len(), "Promoted delayed jobs");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Delayed promotion failed"),
                }

                match backend.reap_stalled(stall_threshold).await {
                    Ok(reaped) if !reaped.is_empty() => {
                        warn!(count = reaped.len(), "Requeued stalled jobs");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Stalled-job reaping failed"),
                }
            }
        })
    }
}
