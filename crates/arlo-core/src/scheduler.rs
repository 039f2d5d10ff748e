// ── Background task scheduler ──
//
// Work is submitted as explicit `ScheduledTask` values. A single timer
// loop keeps pending tasks in a heap ordered by due time and launches
// each one when it falls due; a semaphore caps concurrent executions at
// the worker count. A periodic task is re-armed only after its current
// execution returns, so two firings of the same task never overlap and
// a late firing runs as soon as possible instead of being dropped.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::error::{LastError, TaskError};

pub type TaskId = Uuid;

/// A unit of background work. Called once per firing.
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, Result<(), TaskError>> + Send + Sync>;

/// Shortest accepted period for a repeating task.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// When a task fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// As soon as a worker is free.
    Now,
    /// Once, no earlier than the delay from submission.
    After(Duration),
    /// Repeatedly; the first firing is one interval from submission.
    Every(Duration),
}

/// An explicit description of scheduled work.
#[derive(Clone)]
pub struct ScheduledTask {
    pub id: TaskId,
    pub name: String,
    pub kind: TaskKind,
    job: Job,
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl ScheduledTask {
    pub fn new<F, Fut>(name: impl Into<String>, kind: TaskKind, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let kind = match kind {
            TaskKind::Every(interval) if interval < MIN_INTERVAL => TaskKind::Every(MIN_INTERVAL),
            other => other,
        };
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            job: Arc::new(move || f().boxed()),
        }
    }

    fn initial_delay(&self) -> Duration {
        match self.kind {
            TaskKind::Now => Duration::ZERO,
            TaskKind::After(d) | TaskKind::Every(d) => d,
        }
    }
}

// ── Timer heap ───────────────────────────────────────────────────────

struct Pending {
    due: Instant,
    seq: u64,
    task: ScheduledTask,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    /// Reversed so the `BinaryHeap` pops the earliest due task first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Arm {
    task: ScheduledTask,
    due: Instant,
}

// ── TaskScheduler ────────────────────────────────────────────────────

/// Runs one-shot, delayed and periodic tasks on a fixed-size worker pool.
///
/// Cheaply cloneable. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    arm_tx: mpsc::UnboundedSender<Arm>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    workers: usize,
    executions: AtomicU64,
    failures: AtomicU64,
    errors: LastError,
}

impl TaskScheduler {
    /// Start the timer loop with `workers` concurrent execution slots.
    pub fn new(workers: usize, errors: LastError) -> Self {
        let workers = workers.max(1);
        let (arm_tx, arm_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let inner = Arc::new(Inner {
            arm_tx,
            cancel,
            tracker,
            workers,
            executions: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            errors,
        });

        let permits = Arc::new(Semaphore::new(workers));
        inner
            .tracker
            .spawn(timer_loop(Arc::downgrade(&inner), arm_rx, permits));

        Self { inner }
    }

    // ── Submission ───────────────────────────────────────────────────

    /// Run `f` as soon as a worker is free.
    pub fn run<F, Fut>(&self, name: impl Into<String>, f: F) -> TaskId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.submit(ScheduledTask::new(name, TaskKind::Now, f))
    }

    /// Run `f` once, no earlier than `delay` from now.
    pub fn run_after<F, Fut>(&self, name: impl Into<String>, delay: Duration, f: F) -> TaskId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.submit(ScheduledTask::new(name, TaskKind::After(delay), f))
    }

    /// Run `f` every `interval`. Firings of this task never overlap.
    pub fn run_every<F, Fut>(&self, name: impl Into<String>, interval: Duration, f: F) -> TaskId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.submit(ScheduledTask::new(name, TaskKind::Every(interval), f))
    }

    /// Queue a task. Never blocks. Ignored after shutdown.
    pub fn submit(&self, task: ScheduledTask) -> TaskId {
        let id = task.id;
        if self.inner.cancel.is_cancelled() {
            warn!(task = %task.name, "scheduler stopped, task ignored");
            return id;
        }
        trace!(task = %task.name, kind = ?task.kind, "task submitted");
        let due = Instant::now() + task.initial_delay();
        if self.inner.arm_tx.send(Arm { task, due }).is_err() {
            warn!("scheduler timer loop gone, task ignored");
        }
        id
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Stop firing tasks. Executions already running complete.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Wait for the timer loop and in-flight executions after
    /// [`shutdown`](Self::shutdown).
    pub async fn join(&self) {
        self.inner.tracker.wait().await;
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    /// Completed executions, successful or not.
    pub fn executions(&self) -> u64 {
        self.inner.executions.load(Ordering::Relaxed)
    }

    /// Executions that returned an error or panicked.
    pub fn failures(&self) -> u64 {
        self.inner.failures.load(Ordering::Relaxed)
    }
}

// ── Timer loop ───────────────────────────────────────────────────────

async fn timer_loop(
    inner: std::sync::Weak<Inner>,
    mut arm_rx: mpsc::UnboundedReceiver<Arm>,
    permits: Arc<Semaphore>,
) {
    let Some(cancel) = inner.upgrade().map(|i| i.cancel.clone()) else {
        return;
    };
    let mut heap: BinaryHeap<Pending> = BinaryHeap::new();
    let mut seq: u64 = 0;

    loop {
        let next_due = heap.peek().map(|p| p.due);
        let wake = async move {
            match next_due {
                Some(due) => tokio::time::sleep_until(due).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            arm = arm_rx.recv() => {
                let Some(Arm { task, due }) = arm else { break };
                seq += 1;
                heap.push(Pending { due, seq, task });
            }
            () = wake => {
                let now = Instant::now();
                while heap.peek().is_some_and(|p| p.due <= now) {
                    let Some(pending) = heap.pop() else { break };
                    let Some(inner) = inner.upgrade() else { return };
                    launch(&inner, pending, Arc::clone(&permits));
                }
            }
        }
    }

    debug!(pending = heap.len(), "scheduler timer loop exiting");
}

fn launch(inner: &Arc<Inner>, pending: Pending, permits: Arc<Semaphore>) {
    let Pending { due, task, .. } = pending;
    let inner_ref = Arc::clone(inner);

    inner.tracker.spawn(async move {
        let inner = inner_ref;
        let permit = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => return,
            permit = permits.acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return,
            },
        };

        trace!(task = %task.name, "task started");
        let outcome = AssertUnwindSafe((task.job)()).catch_unwind().await;
        drop(permit);

        inner.executions.fetch_add(1, Ordering::Relaxed);
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(panic) => Some(TaskError::Panicked(panic_message(&*panic))),
        };
        if let Some(err) = failure {
            inner.failures.fetch_add(1, Ordering::Relaxed);
            error!(task = %task.name, error = %err, "task failed");
            inner.errors.record(format_args!("task '{}' failed: {err}", task.name));
        }

        if let TaskKind::Every(interval) = task.kind {
            if inner.cancel.is_cancelled() {
                return;
            }
            let next = (due + interval).max(Instant::now());
            if inner.arm_tx.send(Arm { task, due: next }).is_err() {
                debug!("scheduler timer loop gone, periodic task not re-armed");
            }
        }
    });
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}
