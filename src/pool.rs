//! Worker pool and callback queue.
//!
//! Tool invocations execute on a fixed set of worker threads; completions
//! flow back over a single FIFO channel consumed by the coordinator, which
//! owns all scheduler state. Workers never touch that state: a task is a
//! closure over the data it needs, and everything it learns travels back
//! inside the completion message.
//!
//! Failures are captured, not propagated, on the worker: a tool's structured
//! failure and a panic both arrive at the coordinator as values, so the
//! coordinator keeps full control over counters and shutdown.

use crate::error::BuildFailure;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::{
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

/// What a successfully completed task produced.
#[derive(Debug)]
pub(crate) struct TaskOutput {
    /// Paths the tool created, or the prior outputs when skipped.
    pub outputs: Vec<PathBuf>,
    /// True when no work was performed because the inputs were up to date.
    pub up_to_date: bool,
}

/// Why a task did not produce output.
#[derive(Debug)]
pub(crate) enum TaskError {
    /// The tool's command failed; counted and scheduling continues.
    Failure(BuildFailure),
    /// The task panicked; rethrown on the coordinator as a fatal error.
    Panic(String),
}

#[derive(Debug)]
pub(crate) struct TaskOutcome {
    pub result: Result<TaskOutput, TaskError>,
    /// Wall-clock time the worker spent on the task.
    pub elapsed: Duration,
}

/// Messages arriving on the coordinator's callback queue.
pub(crate) enum Callback<C> {
    /// A task finished; `ctx` is the completion context bound at enqueue.
    Finished { ctx: C, outcome: TaskOutcome },
    /// The pool has been stopped; the coordinator loop should exit.
    Exit,
}

pub(crate) type Work = Box<dyn FnOnce() -> Result<TaskOutput, BuildFailure> + Send + 'static>;

enum PoolMessage<C> {
    Task { work: Work, ctx: C },
    Shutdown,
}

/// A fixed-size pool of worker threads feeding one callback queue.
pub(crate) struct ThreadPool<C> {
    task_tx: Sender<PoolMessage<C>>,
    callback_tx: Sender<Callback<C>>,
    aborted: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl<C: Send + 'static> ThreadPool<C> {
    /// Starts `jobs` workers and returns the pool plus the callback queue
    /// receiver the coordinator blocks on.
    pub fn start(jobs: usize) -> (Self, Receiver<Callback<C>>) {
        let jobs = jobs.max(1);
        let (task_tx, task_rx) = unbounded::<PoolMessage<C>>();
        let (callback_tx, callback_rx) = unbounded::<Callback<C>>();
        let aborted = Arc::new(AtomicBool::new(false));

        let workers = (0..jobs)
            .map(|_| {
                let task_rx = task_rx.clone();
                let callback_tx = callback_tx.clone();
                let aborted = Arc::clone(&aborted);
                std::thread::spawn(move || worker_loop(task_rx, callback_tx, aborted))
            })
            .collect();

        (Self { task_tx, callback_tx, aborted, workers }, callback_rx)
    }

    /// Submits a task. `ctx` is handed back untouched with the completion.
    pub fn add_task(&self, work: Work, ctx: C) {
        let _ = self.task_tx.send(PoolMessage::Task { work, ctx });
    }

    /// Drains the workers and emits the exit sentinel on the callback queue.
    ///
    /// Only call once no tasks are outstanding; the sentinel is pushed
    /// directly, so an in-flight completion would race past it otherwise.
    pub fn stop(&self) {
        trace!("stopping worker pool");
        for _ in &self.workers {
            let _ = self.task_tx.send(PoolMessage::Shutdown);
        }
        let _ = self.callback_tx.send(Callback::Exit);
    }

    /// Immediate shutdown on fatal error: workers stop picking up queued
    /// tasks; anything already running finishes and its result is discarded.
    pub fn abort(&self) {
        trace!("aborting worker pool");
        self.aborted.store(true, Ordering::SeqCst);
        for _ in &self.workers {
            let _ = self.task_tx.send(PoolMessage::Shutdown);
        }
    }

    /// Waits for all workers to exit. Call after `stop` or `abort`.
    pub fn join(&mut self) {
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl<C> Drop for ThreadPool<C> {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.task_tx.send(PoolMessage::Shutdown);
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop<C>(
    task_rx: Receiver<PoolMessage<C>>,
    callback_tx: Sender<Callback<C>>,
    aborted: Arc<AtomicBool>,
) {
    while let Ok(message) = task_rx.recv() {
        let (work, ctx) = match message {
            PoolMessage::Task { work, ctx } => (work, ctx),
            PoolMessage::Shutdown => break,
        };
        if aborted.load(Ordering::SeqCst) {
            continue;
        }

        let started = Instant::now();
        let result = match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(failure)) => Err(TaskError::Failure(failure)),
            Err(payload) => Err(TaskError::Panic(panic_message(payload))),
        };
        let outcome = TaskOutcome { result, elapsed: started.elapsed() };
        let _ = callback_tx.send(Callback::Finished { ctx, outcome });
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
