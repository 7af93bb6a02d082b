//! Stage queues and the delivery channel.
//!
//! Work moves through three stages, each a worker loop draining a bounded
//! queue under a concurrency limit. A full queue drops its oldest waiting
//! task instead of blocking the submitter. Listener callbacks are funneled
//! through one [`DeliveryQueue`] so they never run concurrently.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::future::BoxFuture;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, trace, warn};

use crate::domain::errors::CancelCause;
use crate::infrastructure::config::SchedulerConfig;

use super::request::RequestId;

/// A listener callback waiting for the delivery context.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Serializes listener callbacks onto a single consumer.
///
/// The spawned flavor runs callbacks one at a time on a dedicated task. The
/// inline flavor runs them on the posting task and backs synchronous loads.
#[derive(Clone)]
pub struct DeliveryQueue {
    tx: Option<mpsc::UnboundedSender<Callback>>,
}

impl DeliveryQueue {
    /// Starts a delivery task on the current runtime.
    #[must_use]
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run_delivery_loop(rx));
        Self { tx: Some(tx) }
    }

    /// A queue that runs callbacks immediately on the caller.
    #[must_use]
    pub const fn inline() -> Self {
        Self { tx: None }
    }

    /// Queues `callback`. Runs it in place if the delivery task is gone.
    pub fn post(&self, callback: Callback) {
        let Some(tx) = &self.tx else {
            Self::run(callback);
            return;
        };
        if let Err(mpsc::error::SendError(callback)) = tx.send(callback) {
            warn!("Delivery task stopped, running callback in place");
            Self::run(callback);
        }
    }

    async fn run_delivery_loop(mut rx: mpsc::UnboundedReceiver<Callback>) {
        while let Some(callback) = rx.recv().await {
            Self::run(callback);
        }
        trace!("Delivery loop finished");
    }

    fn run(callback: Callback) {
        if std::panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
            error!("Listener callback panicked");
        }
    }
}

impl std::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("inline", &self.tx.is_none())
            .finish()
    }
}

/// The three pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Cache probing and routing. One worker.
    Dispatch,
    /// Network fetches.
    Network,
    /// Byte acquisition for local sources, then decoding.
    Decode,
}

impl Stage {
    const fn name(self) -> &'static str {
        match self {
            Self::Dispatch => "dispatch",
            Self::Network => "network",
            Self::Decode => "decode",
        }
    }
}

/// A unit of stage work.
pub struct StageTask {
    /// Request the task belongs to.
    pub id: RequestId,
    /// Body, run once a worker slot is free.
    pub run: BoxFuture<'static, ()>,
    /// Called instead of `run` when the task is dropped unrun.
    pub discard: Box<dyn FnOnce(CancelCause) + Send + 'static>,
}

impl StageTask {
    fn discard(self, cause: CancelCause) {
        (self.discard)(cause);
    }
}

/// Worker counts and queue capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageLimits {
    /// Dispatch queue capacity.
    pub dispatch_queue: usize,
    /// Parallel network fetches.
    pub network_workers: usize,
    /// Network queue capacity.
    pub network_queue: usize,
    /// Parallel decodes.
    pub decode_workers: usize,
    /// Decode queue capacity.
    pub decode_queue: usize,
}

impl Default for StageLimits {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for StageLimits {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            dispatch_queue: config.dispatch_queue.max(1),
            network_workers: config.network_workers.max(1),
            network_queue: config.network_queue.max(1),
            decode_workers: config.decode_workers.max(1),
            decode_queue: config.decode_queue.max(1),
        }
    }
}

/// Scheduler counters.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Tasks accepted across all stages.
    pub submitted: u64,
    /// Tasks dropped by a full queue.
    pub discarded: u64,
}

impl std::fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Scheduler: {} tasks submitted, {} discarded on overflow",
            self.submitted, self.discarded
        )
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    discarded: AtomicU64,
}

enum StageCommand {
    Run(StageTask),
    Shutdown,
}

struct StageWorker {
    stage: Stage,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    rx: mpsc::UnboundedReceiver<StageCommand>,
    counters: Arc<Counters>,
}

impl StageWorker {
    async fn run_worker_loop(mut self) {
        let mut queue: VecDeque<StageTask> = VecDeque::new();

        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(StageCommand::Run(task)) => {
                            if queue.len() >= self.capacity
                                && let Some(oldest) = queue.pop_front()
                            {
                                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                                debug!(stage = self.stage.name(), id = oldest.id, "Queue full, discarding oldest task");
                                oldest.discard(CancelCause::Discarded);
                            }
                            queue.push_back(task);
                        }
                        Some(StageCommand::Shutdown) | None => break,
                    }
                }
                Ok(permit) = self.semaphore.clone().acquire_owned(), if !queue.is_empty() => {
                    if let Some(task) = queue.pop_front() {
                        trace!(stage = self.stage.name(), id = task.id, "Running task");
                        tokio::spawn(async move {
                            task.run.await;
                            drop(permit);
                        });
                    }
                }
            }
        }

        self.rx.close();
        while let Ok(StageCommand::Run(task)) = self.rx.try_recv() {
            queue.push_back(task);
        }
        if !queue.is_empty() {
            debug!(stage = self.stage.name(), pending = queue.len(), "Canceling queued tasks");
        }
        for task in queue.drain(..) {
            task.discard(CancelCause::Normal);
        }
    }
}

/// Owns the stage workers.
pub struct RequestScheduler {
    dispatch: mpsc::UnboundedSender<StageCommand>,
    network: mpsc::UnboundedSender<StageCommand>,
    decode: mpsc::UnboundedSender<StageCommand>,
    shutting_down: AtomicBool,
    counters: Arc<Counters>,
    limits: StageLimits,
}

impl RequestScheduler {
    /// Spawns the three stage workers on the current runtime.
    #[must_use]
    pub fn new(limits: StageLimits) -> Self {
        let counters = Arc::new(Counters::default());
        let spawn = |stage: Stage, workers: usize, capacity: usize| {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = StageWorker {
                stage,
                capacity,
                semaphore: Arc::new(Semaphore::new(workers)),
                rx,
                counters: Arc::clone(&counters),
            };
            tokio::spawn(worker.run_worker_loop());
            tx
        };

        let dispatch = spawn(Stage::Dispatch, 1, limits.dispatch_queue);
        let network = spawn(Stage::Network, limits.network_workers, limits.network_queue);
        let decode = spawn(Stage::Decode, limits.decode_workers, limits.decode_queue);

        debug!(?limits, "Scheduler started");

        Self {
            dispatch,
            network,
            decode,
            shutting_down: AtomicBool::new(false),
            counters,
            limits,
        }
    }

    /// Queues `task` on `stage`. After shutdown the task is discarded with
    /// [`CancelCause::Normal`] instead.
    pub fn submit(&self, stage: Stage, task: StageTask) {
        if self.is_shutting_down() {
            task.discard(CancelCause::Normal);
            return;
        }
        let tx = match stage {
            Stage::Dispatch => &self.dispatch,
            Stage::Network => &self.network,
            Stage::Decode => &self.decode,
        };
        match tx.send(StageCommand::Run(task)) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::SendError(cmd)) => {
                if let StageCommand::Run(task) = cmd {
                    task.discard(CancelCause::Normal);
                }
            }
        }
    }

    /// Returns true once [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Stops every stage. Queued tasks are discarded, running ones finish.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Scheduler shutting down");
        for tx in [&self.dispatch, &self.network, &self.decode] {
            let _ = tx.send(StageCommand::Shutdown);
        }
    }

    /// The limits the scheduler was built with.
    #[must_use]
    pub const fn limits(&self) -> StageLimits {
        self.limits
    }

    /// Returns scheduler counters.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for RequestScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestScheduler")
            .field("limits", &self.limits)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl Drop for RequestScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
