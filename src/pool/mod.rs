//! A resizable pool of worker threads executing queued callbacks.
//!
//! Tasks are pushed onto a shared lock-free FIFO queue and picked up by
//! worker threads. Submission from a single thread is executed in order;
//! there is no ordering guarantee across submitters. The pool can grow and
//! shrink at runtime: growing spawns workers immediately, shrinking wakes
//! everyone so surplus workers retire at their next task boundary.

mod worker;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_queue::SegQueue;
use metrics::{counter, gauge};

use self::worker::{Worker, WorkerHandle};

/// A unit of work: run once on whichever worker dequeues it.
pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// State shared between the pool handle and its worker threads.
struct PoolShared {
    /// Global FIFO task queue where tasks can be pushed from anywhere.
    queue: SegQueue<Task>,
    /// Set once by `stop`; workers exit when they observe it.
    should_stop: AtomicBool,
    /// Number of live (not yet retired) workers.
    running: AtomicUsize,
    /// Target worker count; workers above it retire.
    max_threads: AtomicUsize,
    /// Monotonic id source for worker thread names.
    next_worker_id: AtomicUsize,
}

impl PoolShared {
    /// Tries to claim a retirement slot for the calling worker.
    ///
    /// Claiming decrements the running count, so concurrent retirees can
    /// never take the pool below the requested size.
    fn try_retire(&self) -> bool {
        let mut running = self.running.load(Ordering::Acquire);
        while running > self.max_threads.load(Ordering::Acquire) {
            match self.running.compare_exchange(
                running,
                running - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => running = observed,
            }
        }
        false
    }

    /// Whether more workers are live than the current target.
    fn retire_requested(&self) -> bool {
        self.running.load(Ordering::Acquire) > self.max_threads.load(Ordering::Acquire)
    }
}

/// A fixed-but-resizable pool of worker threads.
///
/// Dropping the pool stops and joins every worker. Tasks still queued at
/// that point are discarded.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl ThreadPool {
    /// Creates a pool with `threads` workers.
    pub fn new(threads: usize) -> Self {
        let pool = Self {
            shared: Arc::new(PoolShared {
                queue: SegQueue::new(),
                should_stop: AtomicBool::new(false),
                running: AtomicUsize::new(0),
                max_threads: AtomicUsize::new(0),
                next_worker_id: AtomicUsize::new(0),
            }),
            workers: Mutex::new(Vec::new()),
        };
        pool.set_thread_count(threads);
        pool
    }

    /// Enqueues a task and wakes up an idle worker if there is one.
    ///
    /// Tasks submitted from the same thread run in submission order.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.queue.push(Box::new(task));
        counter!("tidepool_tasks_submitted_total").increment(1);
        eprintln!("DEBUG: submit pushed task, calling try_unpark_one");
        self.try_unpark_one();
    }

    /// Attempts to wake up one idle worker from all available workers.
    fn try_unpark_one(&self) {
        let workers = self.workers.lock().unwrap();
        eprintln!("DEBUG: try_unpark_one, workers len={}", workers.len());
        for handle in workers.iter() {
            if handle.idle.swap(false, Ordering::AcqRel) {
                eprintln!("DEBUG: waking an idle worker");
                handle.wake();
                return;
            }
        }
        eprintln!("DEBUG: no idle worker found");
        // Everyone was already busy; the task waits in the queue.
        counter!("tidepool_worker_saturation_total").increment(1);
    }

    /// Adjusts the number of worker threads.
    ///
    /// Growing spawns the missing workers immediately. Shrinking stores the
    /// new target and wakes everyone; surplus workers observe the target at
    /// their next task boundary and retire without abandoning a running
    /// task.
    pub fn set_thread_count(&self, threads: usize) {
        let mut workers = self.workers.lock().unwrap();
        workers.retain(|handle| !handle.is_finished());

        self.shared.max_threads.store(threads, Ordering::Release);

        while self.shared.running.load(Ordering::Acquire) < threads {
            self.shared.running.fetch_add(1, Ordering::AcqRel);
            let id = self.shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
            workers.push(Worker::start(id, Arc::clone(&self.shared)));
        }

        if self.shared.running.load(Ordering::Acquire) > threads {
            for handle in workers.iter() {
                handle.wake();
            }
        }

        gauge!("tidepool_workers_running").set(self.shared.running.load(Ordering::Acquire) as f64);
    }

    /// Number of currently live workers.
    pub fn thread_count(&self) -> usize {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Stops the pool: wakes every worker and joins them. Idempotent.
    pub fn stop(&self) {
        if self.shared.should_stop.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("stopping thread pool");

        {
            let mut workers = self.workers.lock().unwrap();
            for handle in workers.iter() {
                handle.wake();
            }
            for handle in workers.drain(..) {
                handle.join();
            }
        }

        // Tasks still queued are discarded; dropping them outside the
        // workers lock lets their destructors take other locks freely.
        while self.shared.queue.pop().is_some() {}

        gauge!("tidepool_workers_running").set(0.0);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}
