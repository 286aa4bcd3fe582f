//! Job Queue (§4.6): a durable, strictly-serialized worker over outbound
//! work. Spawned as a single background task; every other caller only ever
//! enqueues and waits, never touches queue state directly (§5 single-writer
//! domain), following the `tokio::select!` + `watch::Receiver<bool>` shutdown
//! idiom guard-service's engine watchers use.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use cypher_proto::{records::Job, JobPayload};
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, Notify};
use uuid::Uuid;

use crate::error::CoreError;
use crate::transport::Transport;
use cypher_store::{KeyStore, Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Running,
    Pausing,
    Paused,
}

/// Returned by a [`TaskRunner::run`] call (§4.6 "Per-task outcome").
pub enum TaskOutcome {
    Success,
    Retry { delay: StdDuration, max_attempts: Option<u32> },
    RetryAlways,
    FailNever,
}

/// Registered per-`taskKey` work, dispatched with the decoded [`JobPayload`].
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, payload: &JobPayload) -> Result<TaskOutcome, CoreError>;

    /// Best-effort halt notification (§4.6 "Halting"); must not fail the run.
    async fn on_delayed(&self, _payload: &JobPayload) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainResult {
    Synchronised,
    Skipped,
    Busy,
}

pub struct JobQueue {
    storage: Arc<dyn Storage>,
    key_store: KeyStore,
    transport: Arc<dyn Transport>,
    runner: Arc<dyn TaskRunner>,
    state: Mutex<QueueState>,
    pause_requested: Mutex<bool>,
    wake: Notify,
    resume: Notify,
    drain_waiters: Mutex<Vec<oneshot::Sender<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl JobQueue {
    pub fn new(storage: Arc<dyn Storage>, key_store: KeyStore, transport: Arc<dyn Transport>, runner: Arc<dyn TaskRunner>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            storage,
            key_store,
            transport,
            runner,
            state: Mutex::new(QueueState::Idle),
            pause_requested: Mutex::new(false),
            wake: Notify::new(),
            resume: Notify::new(),
            drain_waiters: Mutex::new(Vec::new()),
            shutdown_tx,
        })
    }

    pub fn state(&self) -> QueueState {
        *self.state.lock()
    }

    /// Persist a new task and wake the worker (§4.6 `queueTask`).
    pub async fn queue_task(&self, payload: JobPayload, is_background: bool) -> Result<(), CoreError> {
        let payload_doc = bson::to_document(&payload).map_err(cypher_proto::ProtoError::BsonEncode)?;
        let job = Job {
            id: Uuid::new_v4(),
            task_key: payload.task_key().to_string(),
            payload: payload_doc,
            scheduled_at: Utc::now(),
            delayed_until: None,
            attempts: 0,
            is_background_task: is_background,
        };
        let sealed = self.key_store.seal(&job).await?;
        self.storage.put_job(job.id, &sealed, job.scheduled_at, is_background).await?;
        self.wake.notify_one();
        Ok(())
    }

    /// §4.6 `pause()`: takes effect only once the in-flight task (if any)
    /// finishes.
    pub fn pause(&self) {
        *self.pause_requested.lock() = true;
        let mut state = self.state.lock();
        if *state == QueueState::Running {
            *state = QueueState::Pausing;
        }
    }

    /// §4.6 `resume()`.
    pub fn resume(&self) {
        *self.pause_requested.lock() = false;
        if *self.state.lock() == QueueState::Paused {
            *self.state.lock() = QueueState::Idle;
        }
        self.resume.notify_one();
        self.wake.notify_one();
    }

    /// §4.6 `awaitDoneProcessing`.
    pub async fn await_done_processing(&self) -> DrainResult {
        if *self.state.lock() == QueueState::Paused {
            return DrainResult::Busy;
        }
        let jobs = self.storage.all_jobs_ordered().await.unwrap_or_default();
        if jobs.is_empty() {
            return DrainResult::Skipped;
        }
        let (tx, rx) = oneshot::channel();
        self.drain_waiters.lock().push(tx);
        self.wake.notify_one();
        let _ = rx.await;
        DrainResult::Synchronised
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.wake.notify_one();
        self.resume.notify_one();
    }

    /// Spawns the single worker task that owns all queue state (§5, §9
    /// "single-writer domains").
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    return;
                }
                if *self.pause_requested.lock() {
                    *self.state.lock() = QueueState::Paused;
                    tokio::select! {
                        _ = self.resume.notified() => {}
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() { return; }
                        }
                    }
                    continue;
                }

                match self.process_ready_jobs().await {
                    ProcessRun::Halted => {
                        self.drain_waiters.lock().clear();
                        *self.state.lock() = QueueState::Idle;
                        tokio::select! {
                            _ = self.wake.notified() => {}
                            _ = shutdown_rx.changed() => {
                                if *shutdown_rx.borrow() { return; }
                            }
                        }
                    }
                    ProcessRun::Drained => {
                        *self.state.lock() = QueueState::Idle;
                        for waiter in self.drain_waiters.lock().drain(..) {
                            let _ = waiter.send(());
                        }
                        tokio::select! {
                            _ = self.wake.notified() => {}
                            _ = shutdown_rx.changed() => {
                                if *shutdown_rx.borrow() { return; }
                            }
                        }
                    }
                }
            }
        })
    }

    /// Runs jobs until the queue is empty or a halting condition is hit.
    async fn process_ready_jobs(&self) -> ProcessRun {
        loop {
            let jobs = match self.load_jobs().await {
                Ok(jobs) => jobs,
                Err(err) => {
                    tracing::error!(?err, "job queue failed to load jobs from storage");
                    return ProcessRun::Halted;
                }
            };
            if jobs.is_empty() {
                return ProcessRun::Drained;
            }

            let idx = match select_next(&jobs) {
                Some(idx) => idx,
                None => return ProcessRun::Halted,
            };

            *self.state.lock() = QueueState::Running;
            if self.run_one(&jobs, idx).await.is_halt() {
                self.notify_delayed(&jobs, idx).await;
                return ProcessRun::Halted;
            }

            if *self.pause_requested.lock() {
                return ProcessRun::Halted;
            }
        }
    }

    async fn load_jobs(&self) -> Result<Vec<Job>, CoreError> {
        let rows = self.storage.all_jobs_ordered().await?;
        let mut jobs = Vec::with_capacity(rows.len());
        for (_, sealed, _) in rows {
            jobs.push(self.key_store.open(&sealed).await?);
        }
        Ok(jobs)
    }

    async fn run_one(&self, jobs: &[Job], idx: usize) -> RunStep {
        let job = &jobs[idx];
        let payload: JobPayload = match bson::from_document(job.payload.clone()) {
            Ok(payload) => payload,
            Err(_) => {
                // Decode failure: cannot retry uninterpretable work.
                let _ = self.storage.delete_job(job.id).await;
                return RunStep::Continue;
            }
        };

        if payload.requires_connectivity() && !self.transport.is_authenticated() {
            return RunStep::Halt;
        }

        match self.runner.run(&payload).await {
            Ok(TaskOutcome::Success) => {
                let _ = self.storage.delete_job(job.id).await;
                RunStep::Continue
            }
            Ok(TaskOutcome::Retry { delay, max_attempts }) => {
                let attempts = job.attempts + 1;
                if max_attempts.is_some_and(|max| attempts >= max) {
                    let _ = self.storage.delete_job(job.id).await;
                    return RunStep::Continue;
                }
                let delayed_until = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                let mut updated = job.clone();
                updated.attempts = attempts;
                updated.delayed_until = Some(delayed_until);
                if let Ok(sealed) = self.key_store.seal(&updated).await {
                    let _ = self.storage.update_job(job.id, &sealed, delayed_until).await;
                }
                RunStep::Continue
            }
            // Left in place untouched; the caller relies on an external wake
            // (connectivity regained, a fresh `queueTask`, `resume()`) to try
            // again, rather than busy-spinning on the same job.
            Ok(TaskOutcome::RetryAlways) => RunStep::Halt,
            Ok(TaskOutcome::FailNever) => {
                let _ = self.storage.delete_job(job.id).await;
                RunStep::Continue
            }
            Err(err) => {
                tracing::warn!(?err, task_key = %job.task_key, "job run failed without a declared outcome");
                RunStep::Halt
            }
        }
    }

    async fn notify_delayed(&self, jobs: &[Job], from: usize) {
        for job in &jobs[from..] {
            if let Ok(payload) = bson::from_document::<JobPayload>(job.payload.clone()) {
                self.runner.on_delayed(&payload).await;
            }
        }
    }
}

enum ProcessRun {
    Halted,
    Drained,
}

enum RunStep {
    Continue,
    Halt,
}

impl RunStep {
    fn is_halt(&self) -> bool {
        matches!(self, RunStep::Halt)
    }
}

/// §4.6 "Ordering & selection": background tasks yield to any later
/// foreground job; a job whose `delayedUntil` has not yet arrived halts
/// selection rather than being skipped over.
fn select_next(jobs: &[Job]) -> Option<usize> {
    let head = 0;
    let first_foreground = jobs.iter().position(|j| !j.is_background_task);
    let candidate = if jobs[head].is_background_task {
        first_foreground.unwrap_or(head)
    } else {
        head
    };

    if let Some(delayed_until) = jobs[candidate].delayed_until {
        if delayed_until > Utc::now() {
            return None;
        }
    }
    Some(candidate)
}
