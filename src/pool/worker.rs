//! Worker thread implementation for the thread pool.
//!
//! Each worker pops tasks from the shared queue and parks when there is
//! nothing to do. A recheck between raising the idle flag and parking
//! avoids lost wakeups. Workers retire when the pool shrinks below their
//! count and exit when the pool stops.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use metrics::counter;

use super::{PoolShared, Task};

/// A handle to a worker thread kept by the pool.
pub(crate) struct WorkerHandle {
    /// Shared flag indicating whether this worker is parked.
    pub(crate) idle: Arc<AtomicBool>,
    thread: thread::Thread,
    join: thread::JoinHandle<()>,
}

impl WorkerHandle {
    /// Wakes the worker from its parked state.
    pub(crate) fn wake(&self) {
        self.thread.unpark();
    }

    /// Whether the worker thread has already exited.
    pub(crate) fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the worker thread to exit.
    pub(crate) fn join(self) {
        let _ = self.join.join();
    }
}

/// A worker thread bound to the pool's shared state.
pub(crate) struct Worker {
    id: usize,
    idle: Arc<AtomicBool>,
    shared: Arc<PoolShared>,
}

impl Worker {
    /// Spawns a new worker thread and returns a handle to interact with it.
    pub(crate) fn start(id: usize, shared: Arc<PoolShared>) -> WorkerHandle {
        let idle = Arc::new(AtomicBool::new(false));
        let idle_flag = Arc::clone(&idle);

        let builder = thread::Builder::new().name(format!("tidepool-worker-{id}"));
        let join = builder
            .spawn(move || {
                let worker = Worker {
                    id,
                    idle: idle_flag,
                    shared,
                };
                worker.run();
            })
            .expect("failed to spawn worker thread");

        WorkerHandle {
            idle,
            thread: join.thread().clone(),
            join,
        }
    }

    /// The main run loop: pop a task, run it, park when the queue is dry.
    fn run(&self) {
        log::debug!("worker {} started", self.id);

        loop {
            if self.shared.should_stop.load(Ordering::Acquire) {
                self.shared.running.fetch_sub(1, Ordering::AcqRel);
                break;
            }
            // Retiring claims the running-count slot, so only the surplus exits.
            if self.shared.try_retire() {
                break;
            }

            if let Some(task) = self.shared.queue.pop() {
                eprintln!("DEBUG: worker {} popped a task, executing", self.id);
                self.execute(task);
                eprintln!("DEBUG: worker {} finished task", self.id);
                continue;
            }

            self.idle.store(true, Ordering::Release);

            // Recheck to avoid a lost wakeup.
            if !self.shared.queue.is_empty()
                || self.shared.should_stop.load(Ordering::Acquire)
                || self.shared.retire_requested()
            {
                self.idle.store(false, Ordering::Release);
                continue;
            }

            thread::park();

            self.idle.store(false, Ordering::Release);
        }

        log::debug!("worker {} stopped", self.id);
    }

    /// Runs one task, swallowing panics so a task can never kill the worker.
    fn execute(&self, task: Task) {
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            counter!("tidepool_task_panics_total").increment(1);
            log::warn!("task panicked inside worker {}", self.id);
        }
    }
}
