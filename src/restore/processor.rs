// restore-sidecar/src/restore/processor.rs
//! Admission-controlled hand-off of slices to the processor.
//!
//! Slices admitted by a tracker are pushed onto the instance's [`SliceQueue`].
//! The [`SliceDispatcher`] drains that queue and only invokes the
//! [`RestoreProcessor`] once it holds one of the instance's concurrency
//! permits; everything behind it stays queued in PENDING.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::slice::{ReplicaStatus, RestoreSlice, SliceKey, SliceState};
use crate::config::{InstanceMetadata, RestoreJobConfig};
use crate::errors::RestoreJobError;

/// What the processor reports back for one slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Success,
    /// Scoped to the slice; the job carries on.
    RetriableFailure(String),
    /// Fails the whole job.
    FatalFailure(String),
}

/// Performs the actual download and staging of a slice.
///
/// Implementations must poll `cancel` at safe points and leave the staging
/// directory in a state that can be retried from scratch.
#[async_trait]
pub trait RestoreProcessor: Send + Sync {
    async fn process(&self, slice: Arc<RestoreSlice>, cancel: CancellationToken) -> ProcessOutcome;
}

/// Sending half of an instance's slice queue.
#[derive(Debug, Clone)]
pub struct SliceQueue {
    sender: mpsc::UnboundedSender<Arc<RestoreSlice>>,
    queued: Arc<AtomicUsize>,
}

impl SliceQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Arc<RestoreSlice>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = Self {
            sender,
            queued: Arc::new(AtomicUsize::new(0)),
        };
        (queue, receiver)
    }

    pub fn enqueue(&self, slice: Arc<RestoreSlice>) {
        self.queued.fetch_add(1, Ordering::AcqRel);
        if let Err(rejected) = self.sender.send(slice) {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            warn!(slice_key = %rejected.0.key(), "Slice queue is closed, dropping slice");
        }
    }

    /// Slices waiting for a concurrency permit.
    pub fn queued_count(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

pub struct SliceDispatcher {
    instance: InstanceMetadata,
    processor: Arc<dyn RestoreProcessor>,
    permits: Arc<Semaphore>,
    queue: SliceQueue,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Arc<RestoreSlice>>>>,
    active: Arc<DashMap<SliceKey, Instant>>,
    started: AtomicBool,
    slow_task_threshold: Duration,
    slow_task_report_delay: Duration,
}

impl SliceDispatcher {
    pub fn new(
        instance: InstanceMetadata,
        config: &RestoreJobConfig,
        processor: Arc<dyn RestoreProcessor>,
    ) -> Self {
        let (queue, receiver) = SliceQueue::new();
        Self {
            instance,
            processor,
            permits: Arc::new(Semaphore::new(config.process_max_concurrency())),
            queue,
            receiver: Mutex::new(Some(receiver)),
            active: Arc::new(DashMap::new()),
            started: AtomicBool::new(false),
            slow_task_threshold: config.slow_task_threshold(),
            slow_task_report_delay: config.slow_task_report_delay(),
        }
    }

    pub fn queue(&self) -> SliceQueue {
        self.queue.clone()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.queued_count()
    }

    /// Slices currently inside the processor.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Spawns the queue worker and the slow task reporter. Both stop when
    /// `shutdown` is cancelled. A dispatcher can only be started once.
    pub fn start(&self, shutdown: CancellationToken) -> bool {
        if self.started.swap(true, Ordering::AcqRel) {
            return false;
        }
        let Some(receiver) = self.receiver.lock().take() else {
            return false;
        };

        let worker = QueueWorker {
            instance: self.instance.clone(),
            processor: Arc::clone(&self.processor),
            permits: Arc::clone(&self.permits),
            queued: Arc::clone(&self.queue.queued),
            active: Arc::clone(&self.active),
        };
        tokio::spawn(worker.run(receiver, shutdown.clone()));
        tokio::spawn(report_slow_tasks(
            self.instance.id,
            Arc::clone(&self.active),
            self.slow_task_threshold,
            self.slow_task_report_delay,
            shutdown,
        ));
        info!(instance_id = self.instance.id, "Restore slice dispatcher started");
        true
    }
}

struct QueueWorker {
    instance: InstanceMetadata,
    processor: Arc<dyn RestoreProcessor>,
    permits: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    active: Arc<DashMap<SliceKey, Instant>>,
}

impl QueueWorker {
    async fn run(self, mut receiver: mpsc::UnboundedReceiver<Arc<RestoreSlice>>, shutdown: CancellationToken) {
        loop {
            let slice = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(slice) => slice,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            self.queued.fetch_sub(1, Ordering::AcqRel);

            if slice.state() != SliceState::Pending {
                debug!(slice_key = %slice.key(), state = ?slice.state(), "Skipping slice that left PENDING while queued");
                continue;
            }
            self.spawn_processing(slice, permit);
        }
        debug!(instance_id = self.instance.id, "Restore slice queue worker stopped");
    }

    fn spawn_processing(&self, slice: Arc<RestoreSlice>, permit: OwnedSemaphorePermit) {
        let processor = Arc::clone(&self.processor);
        let active = Arc::clone(&self.active);
        let replica = self.instance.address();

        tokio::spawn(async move {
            let key = slice.key();
            active.insert(key.clone(), Instant::now());

            let task = {
                let slice = Arc::clone(&slice);
                let cancel = slice.cancellation_token();
                tokio::spawn(async move { processor.process(slice, cancel).await })
            };
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => ProcessOutcome::RetriableFailure(format!("Processor task aborted: {}", e)),
            };

            active.remove(&key);
            drop(permit);
            apply_outcome(&slice, &replica, outcome);
        });
    }
}

/// Reflects a processor outcome onto the slice.
pub(crate) fn apply_outcome(slice: &RestoreSlice, replica: &str, outcome: ProcessOutcome) {
    match outcome {
        ProcessOutcome::Success => {
            if slice.complete() {
                slice.set_replica_status(replica, ReplicaStatus::Succeeded);
            }
        }
        ProcessOutcome::RetriableFailure(detail) => {
            if !slice.is_cancelled() {
                warn!(slice_key = %slice.key(), error = %detail, "Restore slice failed");
            }
            slice.set_replica_status(replica, ReplicaStatus::Failed);
            slice.fail(RestoreJobError::retriable(detail));
        }
        ProcessOutcome::FatalFailure(detail) => {
            slice.set_replica_status(replica, ReplicaStatus::Failed);
            slice.fail(RestoreJobError::fatal(detail));
        }
    }
}

async fn report_slow_tasks(
    instance_id: u32,
    active: Arc<DashMap<SliceKey, Instant>>,
    threshold: Duration,
    report_delay: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(report_delay.max(Duration::from_secs(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let now = Instant::now();
        for entry in active.iter() {
            let elapsed = now.saturating_duration_since(*entry.value());
            if elapsed >= threshold {
                warn!(
                    instance_id,
                    slice_key = %entry.key(),
                    elapsed_secs = elapsed.as_secs(),
                    "Slow restore task"
                );
            }
        }
    }
}
