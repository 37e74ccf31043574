//! Bounded worker pool for part tasks.
//!
//! Usage: [`TaskScheduler::run`] starts the workers, [`TaskScheduler::add_task`]
//! queues work, [`TaskScheduler::finish_add`] closes the queue and waits.
//! Out-of-order calls are rejected.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use partwise_protocol::constants::MAX_TASK_NUM;
use tracing::{debug, error};

use crate::TransferError;
use crate::cancel::CancelHook;

/// One unit of blocking work, run by exactly one worker.
pub trait Task: Send + 'static {
    type Output: Send + 'static;

    /// Part the task works on, used for error reporting.
    fn part_number(&self) -> u32;

    fn run(&self) -> Result<Self::Output, TransferError>;
}

/// Lifecycle of a [`TaskScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Created,
    Running,
    Draining,
    Stopped,
}

/// First fatal task error.
#[derive(Debug)]
pub struct TaskFailure {
    pub part_number: u32,
    pub error: TransferError,
}

/// What a drained scheduler did.
#[derive(Debug)]
pub struct SchedulerOutcome<O> {
    /// Outputs of successful tasks, in completion order.
    pub completed: Vec<O>,
    pub failure: Option<TaskFailure>,
    /// Parts never started because of a failure or a cancel.
    pub skipped: Vec<u32>,
    pub cancelled: bool,
}

impl<O> SchedulerOutcome<O> {
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.skipped.is_empty() && !self.cancelled
    }
}

struct Shared<O> {
    halted: AtomicBool,
    results: Mutex<Collected<O>>,
}

struct Collected<O> {
    completed: Vec<O>,
    failure: Option<TaskFailure>,
    skipped: Vec<u32>,
}

impl<O> Shared<O> {
    fn results(&self) -> MutexGuard<'_, Collected<O>> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs up to `workers` tasks in parallel.
///
/// After the first fatal error, or once the cancel hook fires, queued tasks
/// are skipped; tasks already running are left to finish.
pub struct TaskScheduler<T: Task> {
    workers: usize,
    cancel: Option<CancelHook>,
    state: SchedulerState,
    queue: Option<Sender<T>>,
    handles: Vec<JoinHandle<()>>,
    shared: Arc<Shared<T::Output>>,
}

impl<T: Task> TaskScheduler<T> {
    /// `workers` is clamped to `1..=MAX_TASK_NUM`.
    pub fn new(workers: usize, cancel: Option<CancelHook>) -> Self {
        Self {
            workers: workers.clamp(1, MAX_TASK_NUM),
            cancel,
            state: SchedulerState::Created,
            queue: None,
            handles: Vec::new(),
            shared: Arc::new(Shared {
                halted: AtomicBool::new(false),
                results: Mutex::new(Collected {
                    completed: Vec::new(),
                    failure: None,
                    skipped: Vec::new(),
                }),
            }),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Starts the workers.
    pub fn run(&mut self) -> Result<(), TransferError> {
        self.expect_state(SchedulerState::Created, "run")?;

        let (tx, rx) = mpsc::channel::<T>();
        let rx = Arc::new(Mutex::new(rx));
        for i in 0..self.workers {
            let rx = Arc::clone(&rx);
            let shared = Arc::clone(&self.shared);
            let cancel = self.cancel.clone();
            let handle = std::thread::Builder::new()
                .name(format!("partwise-worker-{i}"))
                .spawn(move || worker_loop(&rx, &shared, cancel.as_ref()));
            match handle {
                Ok(h) => self.handles.push(h),
                Err(e) => {
                    // Already started workers exit once the sender drops.
                    drop(tx);
                    self.join_workers();
                    self.state = SchedulerState::Stopped;
                    return Err(e.into());
                }
            }
        }

        debug!(workers = self.workers, "scheduler running");
        self.queue = Some(tx);
        self.state = SchedulerState::Running;
        Ok(())
    }

    /// Queues a task.
    pub fn add_task(&mut self, task: T) -> Result<(), TransferError> {
        self.expect_state(SchedulerState::Running, "add_task")?;
        let Some(queue) = &self.queue else {
            return Err(TransferError::InvalidState("scheduler queue closed".into()));
        };
        // Workers only exit after the sender drops, so a send error means
        // every worker died.
        queue
            .send(task)
            .map_err(|_| TransferError::WorkerPanic("all workers exited".into()))
    }

    /// Closes the queue, waits for every queued and running task, and
    /// returns the aggregate.
    pub fn finish_add(&mut self) -> Result<SchedulerOutcome<T::Output>, TransferError> {
        self.expect_state(SchedulerState::Running, "finish_add")?;
        self.state = SchedulerState::Draining;
        self.queue = None;
        let lost = self.join_workers();
        self.state = SchedulerState::Stopped;

        let mut results = self.shared.results();
        if lost > 0 && results.failure.is_none() {
            results.failure = Some(TaskFailure {
                part_number: 0,
                error: TransferError::WorkerPanic(format!("{lost} worker thread(s) died")),
            });
        }
        let outcome = SchedulerOutcome {
            completed: std::mem::take(&mut results.completed),
            failure: results.failure.take(),
            skipped: std::mem::take(&mut results.skipped),
            cancelled: self.cancel.as_ref().is_some_and(CancelHook::is_cancelled),
        };
        debug!(
            completed = outcome.completed.len(),
            skipped = outcome.skipped.len(),
            failed = outcome.failure.is_some(),
            cancelled = outcome.cancelled,
            "scheduler stopped"
        );
        Ok(outcome)
    }

    fn expect_state(&self, want: SchedulerState, op: &str) -> Result<(), TransferError> {
        if self.state != want {
            return Err(TransferError::InvalidState(format!(
                "scheduler {op} called in state {:?}",
                self.state
            )));
        }
        Ok(())
    }

    /// Joins every worker; returns how many died outside a task.
    fn join_workers(&mut self) -> usize {
        self.handles
            .drain(..)
            .map(JoinHandle::join)
            .filter(Result::is_err)
            .count()
    }
}

impl<T: Task> Drop for TaskScheduler<T> {
    fn drop(&mut self) {
        self.queue = None;
        self.join_workers();
    }
}

fn worker_loop<T: Task>(
    rx: &Mutex<Receiver<T>>,
    shared: &Shared<T::Output>,
    cancel: Option<&CancelHook>,
) {
    loop {
        let next = rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
        let Ok(task) = next else {
            return;
        };
        let part = task.part_number();

        let stopped = shared.halted.load(Ordering::Acquire)
            || cancel.is_some_and(CancelHook::is_cancelled);
        if stopped {
            shared.results().skipped.push(part);
            continue;
        }

        let result = match catch_unwind(AssertUnwindSafe(|| task.run())) {
            Ok(r) => r,
            Err(panic) => Err(TransferError::WorkerPanic(panic_message(panic.as_ref()))),
        };

        match result {
            Ok(output) => shared.results().completed.push(output),
            Err(e) => {
                let first = !shared.halted.swap(true, Ordering::AcqRel);
                let mut results = shared.results();
                if first {
                    error!(part, error = %e, "part task failed, halting dispatch");
                    results.failure = Some(TaskFailure {
                        part_number: part,
                        error: e,
                    });
                } else {
                    debug!(part, error = %e, "additional part failure");
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
