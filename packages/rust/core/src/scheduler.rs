//! FIFO job queue with a single background worker.
//!
//! Jobs run one at a time in enqueue order. `stop` is cooperative: the job in
//! flight finishes, then the worker exits. Each engine run happens in its own
//! task, so a panic inside one job marks only that job `failed`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use harvester_shared::{
    JobId, JobRecord, JobStatus, Platform, Result, Settings, Stage, StageOutcome,
};

use crate::bundle::JobBundle;
use crate::pipeline::{Engine, JobObserver};

#[derive(Default)]
struct QueueState {
    pending: VecDeque<JobId>,
    jobs: HashMap<JobId, JobRecord>,
    order: Vec<JobId>,
}

struct Shared {
    state: Mutex<QueueState>,
    settings: Mutex<Settings>,
    wake: Notify,
    stopped: AtomicBool,
    /// Held for the whole of a job run; at most one job is ever running.
    running: tokio::sync::Mutex<()>,
    engine: Engine,
    observer: Arc<dyn JobObserver>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the job queue and the worker that drains it.
pub struct Scheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(engine: Engine, settings: Settings, observer: Arc<dyn JobObserver>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                settings: Mutex::new(settings),
                wake: Notify::new(),
                stopped: AtomicBool::new(false),
                running: tokio::sync::Mutex::new(()),
                engine,
                observer,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Create a queued job and append it to the queue. Does not wait for the worker.
    pub fn enqueue(
        &self,
        sources: Vec<String>,
        platform: Platform,
        topic: &str,
        notes: &str,
    ) -> Result<JobId> {
        let output_root = lock(&self.shared.settings).output_dir.clone();
        let record = JobRecord::new(sources, platform, topic, notes, &output_root)?;
        let id = record.id;

        self.shared.observer.job_queued(&record);
        {
            let mut state = lock(&self.shared.state);
            state.pending.push_back(id);
            state.order.push(id);
            state.jobs.insert(id, record);
        }
        self.shared.wake.notify_one();

        info!(job = %id, %platform, "job queued");
        Ok(id)
    }

    /// Spawn the background worker. No-op while one is already running.
    pub fn start(&self) {
        let mut worker = lock(&self.worker);
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.shared.stopped.store(false, Ordering::SeqCst);
        let shared = self.shared.clone();
        *worker = Some(tokio::spawn(async move { shared.worker_loop().await }));
        info!("worker started");
    }

    /// Ask the worker to exit after the current job.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
        info!("stop requested");
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Wait for the worker spawned by [`start`](Self::start) to exit.
    pub async fn join(&self) {
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
    }

    /// Snapshot of one job.
    pub fn status(&self, id: JobId) -> Option<JobRecord> {
        lock(&self.shared.state).jobs.get(&id).cloned()
    }

    /// Snapshots of every job, in enqueue order.
    pub fn jobs(&self) -> Vec<JobRecord> {
        let state = lock(&self.shared.state);
        state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect()
    }

    /// Jobs still waiting to run.
    pub fn pending(&self) -> usize {
        lock(&self.shared.state).pending.len()
    }

    /// Replace the settings. Running jobs keep the snapshot they started with.
    pub fn update_settings(&self, settings: Settings) {
        *lock(&self.shared.settings) = settings;
    }

    /// Run queued jobs on the calling task until the queue is empty or
    /// [`stop`](Self::stop) is called. Returns the ids finished here, in order.
    pub async fn run_until_idle(&self) -> Vec<JobId> {
        let mut finished = Vec::new();
        while !self.is_stopped() {
            match self.shared.run_next().await {
                Some(id) => finished.push(id),
                None => break,
            }
        }
        finished
    }
}

impl Shared {
    async fn worker_loop(self: Arc<Self>) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            if self.run_next().await.is_none() {
                self.wake.notified().await;
            }
        }
        info!("worker stopped");
    }

    /// Run the head of the queue, if any.
    async fn run_next(self: &Arc<Self>) -> Option<JobId> {
        let _slot = self.running.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }

        let record = {
            let mut state = lock(&self.state);
            let id = state.pending.pop_front()?;
            let record = state.jobs.get_mut(&id)?;
            if let Err(e) = record.transition(JobStatus::Running) {
                warn!(error = %e, "skipping job that is not queued");
                return None;
            }
            record.clone()
        };
        let id = record.id;
        let settings = lock(&self.settings).clone();

        self.run_isolated(record, settings).await;
        Some(id)
    }

    #[instrument(skip_all, fields(job = %record.id))]
    async fn run_isolated(self: &Arc<Self>, record: JobRecord, settings: Settings) {
        let id = record.id;
        let fallback = record.clone();
        let shared = Arc::clone(self);
        let observer = SnapshotObserver {
            shared: Arc::clone(self),
        };

        let handle = tokio::spawn(async move {
            let mut record = record;
            shared.engine.run(&mut record, &settings, &observer).await;
            record
        });

        match handle.await {
            Ok(record) => {
                lock(&self.state).jobs.insert(id, record);
            }
            Err(e) => {
                error!(error = %e, "job task crashed");
                let mut record = lock(&self.state).jobs.get(&id).cloned().unwrap_or(fallback);
                for stage in Stage::ALL {
                    if record.outcome(stage).is_none() {
                        let skipped = StageOutcome::skipped(format!("job crashed: {e}"));
                        let _ = record.record_stage(stage, skipped);
                    }
                }
                if !record.status.is_terminal() {
                    let _ = record.transition(JobStatus::Failed);
                }
                if let Err(e) = JobBundle::new(&record.output_dir).write_record(&record) {
                    warn!(error = %e, "could not persist crashed job");
                }
                lock(&self.state).jobs.insert(id, record.clone());
                self.observer.job_finished(&record);
            }
        }
    }
}

/// Keeps the scheduler's snapshots current and forwards to the front end.
struct SnapshotObserver {
    shared: Arc<Shared>,
}

impl SnapshotObserver {
    fn store(&self, record: &JobRecord) {
        lock(&self.shared.state).jobs.insert(record.id, record.clone());
    }
}

impl JobObserver for SnapshotObserver {
    fn job_queued(&self, record: &JobRecord) {
        self.shared.observer.job_queued(record);
    }

    fn job_started(&self, record: &JobRecord) {
        self.store(record);
        self.shared.observer.job_started(record);
    }

    fn stage_started(&self, id: JobId, stage: Stage) {
        self.shared.observer.stage_started(id, stage);
    }

    fn stage_finished(&self, record: &JobRecord, stage: Stage) {
        self.store(record);
        self.shared.observer.stage_finished(record, stage);
    }

    fn job_finished(&self, record: &JobRecord) {
        self.store(record);
        self.shared.observer.job_finished(record);
    }
}
