//! The I/O reactor: readiness polling and callback dispatch.
//!
//! An [`IoService`] watches a dynamic set of file descriptors for
//! readability and writability and dispatches the registered callbacks
//! onto its worker pool. It is the multiplexing engine under both
//! [`TcpClient`](crate::TcpClient) and [`TcpServer`](crate::TcpServer).
//!
//! # Architecture
//!
//! - **Tracked map**: per-descriptor records (callbacks, in-flight flags,
//!   deferred-removal mark) behind a single tracking mutex.
//! - **Poller thread**: blocks in the readiness call, reconciles the OS
//!   interest set with the tracked map each iteration, and hands ready
//!   events to the worker pool.
//! - **Notifier**: lets any thread wake the blocked poller so fresh state
//!   is observed within one readiness cycle.
//!
//! While a read callback is in flight for a descriptor, the poller will
//! not submit another read for it; writes are gated the same way. That
//! keeps at most one in-flight dispatch per descriptor and direction, so
//! two workers can never drain the same socket concurrently. Read and
//! write dispatches for the same descriptor may run in parallel.

mod notifier;

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use metrics::{counter, gauge};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};

use self::notifier::{NOTIFIER_TOKEN, Notifier};
use crate::error::{Error, Result};
use crate::net::socket::{INVALID_FD, TcpSocket};
use crate::pool::ThreadPool;

/// Workers dispatching callbacks when no count is given.
pub const DEFAULT_WORKER_COUNT: usize = 1;

/// Upper bound on readiness events drained per poll call.
const EVENT_CAPACITY: usize = 1024;

/// Readiness timeout for the poller. The notifier makes wakeups prompt, so
/// no bound is needed; a build may pin one here to cap wakeup latency.
const POLL_TIMEOUT: Option<Duration> = None;

/// A callback invoked on a worker when a tracked descriptor is ready.
pub type EventCallback = Arc<dyn Fn(RawFd) + Send + Sync + 'static>;

/// Which direction a dispatch serves.
#[derive(Debug, Clone, Copy)]
enum Direction {
    Read,
    Write,
}

/// Per-descriptor tracking record.
#[derive(Default)]
struct TrackedSocket {
    read_callback: Option<EventCallback>,
    write_callback: Option<EventCallback>,
    /// A read dispatch is in flight; the poller must not submit another.
    executing_read: bool,
    /// A write dispatch is in flight.
    executing_write: bool,
    /// Removal requested while a dispatch was in flight; the record is
    /// erased once the last in-flight callback completes.
    marked_for_untrack: bool,
    /// Interest currently registered with the OS selector.
    registered: Option<Interest>,
}

/// State shared between the service handle, the poller and the workers.
struct Shared {
    tracked: Mutex<HashMap<RawFd, TrackedSocket>>,
    /// Signaled under the tracking lock whenever a record is erased.
    removal: Condvar,
    registry: Registry,
    notifier: Notifier,
    should_stop: AtomicBool,
    pool: ThreadPool,
}

impl Shared {
    /// Reconciles the OS interest set with the tracked map.
    ///
    /// A descriptor is watched for reads iff it has a read callback and no
    /// read dispatch in flight, symmetrically for writes. Records marked
    /// for untrack with nothing in flight are erased here.
    fn sync_interest(&self) {
        let mut tracked = self.tracked.lock().unwrap();

        let mut stale = Vec::new();
        for (&fd, record) in tracked.iter_mut() {
            if record.marked_for_untrack && !record.executing_read && !record.executing_write {
                stale.push(fd);
                continue;
            }

            let want_read = record.read_callback.is_some() && !record.executing_read;
            let want_write = record.write_callback.is_some() && !record.executing_write;
            let desired = match (want_read, want_write) {
                (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
                (true, false) => Some(Interest::READABLE),
                (false, true) => Some(Interest::WRITABLE),
                (false, false) => None,
            };

            if desired == record.registered {
                continue;
            }

            let mut source = SourceFd(&fd);
            let token = Token(fd as usize);
            let updated = match (record.registered, desired) {
                (None, Some(interest)) => self.registry.register(&mut source, token, interest),
                (Some(_), Some(interest)) => self.registry.reregister(&mut source, token, interest),
                (Some(_), None) => self.registry.deregister(&mut source),
                (None, None) => Ok(()),
            };

            match updated {
                Ok(()) => record.registered = desired,
                Err(err) => log::warn!("failed to update interest for fd {fd}: {err}"),
            }
        }

        for fd in stale {
            self.remove_locked(&mut tracked, fd);
        }
    }

    /// Erases a record, deregistering the descriptor and waking any
    /// `wait_for_removal` callers. Must run under the tracking lock.
    fn remove_locked(&self, tracked: &mut HashMap<RawFd, TrackedSocket>, fd: RawFd) {
        eprintln!("DEBUG: remove_locked fd={fd}");
        if let Some(record) = tracked.remove(&fd) {
            log::debug!("untrack fd {fd}");
            if record.registered.is_some() {
                // The descriptor may already be closed, in which case the
                // OS dropped it from the selector on its own.
                let _ = self.registry.deregister(&mut SourceFd(&fd));
            }
            gauge!("tidepool_tracked_sockets").set(tracked.len() as f64);
            self.removal.notify_all();
        }
    }

    /// Clears an in-flight flag after a dispatch, finishing a deferred
    /// untrack when this was the last in-flight callback.
    fn complete_dispatch(&self, fd: RawFd, direction: Direction) {
        eprintln!("DEBUG: complete_dispatch fd={fd}");
        let mut tracked = self.tracked.lock().unwrap();

        let mut remove = false;
        if let Some(record) = tracked.get_mut(&fd) {
            match direction {
                Direction::Read => {
                    record.executing_read = false;
                    remove = record.marked_for_untrack && !record.executing_write;
                }
                Direction::Write => {
                    record.executing_write = false;
                    remove = record.marked_for_untrack && !record.executing_read;
                }
            }
        }
        if remove {
            self.remove_locked(&mut tracked, fd);
        }
        drop(tracked);

        self.notifier.notify();
    }
}

/// Runs `complete_dispatch` when dropped, so a dispatch always clears its
/// in-flight flag even when the callback panics.
struct DispatchGuard {
    shared: Arc<Shared>,
    fd: RawFd,
    direction: Direction,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        self.shared.complete_dispatch(self.fd, self.direction);
    }
}

/// Submits one dispatch closure for a ready descriptor.
fn dispatch(shared: &Arc<Shared>, fd: RawFd, callback: EventCallback, direction: Direction) {
    counter!(
        "tidepool_dispatches_total",
        "direction" => match direction {
            Direction::Read => "read",
            Direction::Write => "write",
        }
    )
    .increment(1);

    let guard = DispatchGuard {
        shared: Arc::clone(shared),
        fd,
        direction,
    };
    shared.pool.submit(move || {
        callback(guard.fd);
    });
}

/// Hands the polled events to the worker pool.
fn process_events(shared: &Arc<Shared>, events: &Events) {
    let mut tracked = shared.tracked.lock().unwrap();

    for event in events.iter() {
        if event.token() == NOTIFIER_TOKEN {
            continue;
        }

        let fd = event.token().0 as RawFd;
        let Some(record) = tracked.get_mut(&fd) else {
            continue;
        };

        let read_ready = event.is_readable() || event.is_read_closed() || event.is_error();
        eprintln!("DEBUG: event fd={fd} read_ready={read_ready} executing_read={}", record.executing_read);
        if read_ready && !record.executing_read {
            if let Some(callback) = record.read_callback.clone() {
                record.executing_read = true;
                eprintln!("DEBUG: dispatching read for fd={fd}");
                dispatch(shared, fd, callback, Direction::Read);
            }
        }

        let write_ready = event.is_writable() || event.is_write_closed() || event.is_error();
        if write_ready && !record.executing_write {
            if let Some(callback) = record.write_callback.clone() {
                record.executing_write = true;
                dispatch(shared, fd, callback, Direction::Write);
            }
        }
    }
}

/// The poller loop, run on a dedicated thread until the service stops.
fn poll_loop(shared: &Arc<Shared>, mut poll: Poll) {
    log::debug!("starting poll loop");
    let mut events = Events::with_capacity(EVENT_CAPACITY);

    while !shared.should_stop.load(Ordering::Acquire) {
        shared.sync_interest();
        eprintln!("DEBUG: after sync_interest, about to poll");

        // Blocks until a descriptor is ready or the notifier fires.
        if let Err(err) = poll.poll(&mut events, POLL_TIMEOUT) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("poll failure, reactor stopping: {err}");
            break;
        }
        eprintln!("DEBUG: poll returned, events: {}", events.iter().count());

        process_events(shared, &events);
    }

    log::debug!("stopping poll loop");
}

/// The reactor: tracks descriptors and dispatches readiness callbacks.
///
/// An `IoService` owns one poller thread and a worker pool. Clients and
/// servers share a service via `Arc`; a process-wide default instance is
/// available through [`default_io_service`]. Dropping the service stops
/// the poller and the workers; callers that need every callback settled
/// should quiesce their sockets first.
pub struct IoService {
    shared: Arc<Shared>,
    poller: Mutex<Option<thread::JoinHandle<()>>>,
}

impl IoService {
    /// Creates a service with [`DEFAULT_WORKER_COUNT`] workers.
    pub fn new() -> Result<Self> {
        Self::with_workers(DEFAULT_WORKER_COUNT)
    }

    /// Creates a service with `workers` callback workers.
    pub fn with_workers(workers: usize) -> Result<Self> {
        let poll = Poll::new().map_err(|err| Error::from_io("failed to create the poller", err))?;
        let registry = poll
            .registry()
            .try_clone()
            .map_err(|err| Error::from_io("failed to clone the poll registry", err))?;
        let notifier = Notifier::new(poll.registry())
            .map_err(|err| Error::from_io("failed to create the poll notifier", err))?;

        let shared = Arc::new(Shared {
            tracked: Mutex::new(HashMap::new()),
            removal: Condvar::new(),
            registry,
            notifier,
            should_stop: AtomicBool::new(false),
            pool: ThreadPool::new(workers),
        });

        let poller_shared = Arc::clone(&shared);
        let poller = thread::Builder::new()
            .name("tidepool-poll".into())
            .spawn(move || poll_loop(&poller_shared, poll))
            .map_err(|err| Error::from_io("failed to spawn the poller thread", err))?;

        log::debug!("io service created");
        Ok(Self {
            shared,
            poller: Mutex::new(Some(poller)),
        })
    }

    /// Inserts (or resets) the tracking record for `socket`.
    ///
    /// Existing callbacks are overwritten; in-flight flags and a pending
    /// untrack mark are cleared. Tracking a closed socket is a no-op.
    pub fn track(
        &self,
        socket: &TcpSocket,
        read_callback: Option<EventCallback>,
        write_callback: Option<EventCallback>,
    ) {
        let fd = socket.fd();
        if fd == INVALID_FD {
            return;
        }

        {
            let mut tracked = self.shared.tracked.lock().unwrap();
            log::debug!("track fd {fd}");
            let record = tracked.entry(fd).or_default();
            record.read_callback = read_callback;
            record.write_callback = write_callback;
            record.executing_read = false;
            record.executing_write = false;
            record.marked_for_untrack = false;
            gauge!("tidepool_tracked_sockets").set(tracked.len() as f64);
        }

        self.shared.notifier.notify();
    }

    /// Updates the read callback for `socket`; `None` clears read interest.
    ///
    /// A dispatch already in flight still runs with the callback captured
    /// when its event fired; the change is observed by the next poll cycle.
    pub fn set_read_callback(&self, socket: &TcpSocket, callback: Option<EventCallback>) {
        let fd = socket.fd();
        if fd == INVALID_FD {
            return;
        }

        {
            let mut tracked = self.shared.tracked.lock().unwrap();
            tracked.entry(fd).or_default().read_callback = callback;
        }

        self.shared.notifier.notify();
    }

    /// Updates the write callback for `socket`; `None` clears write interest.
    pub fn set_write_callback(&self, socket: &TcpSocket, callback: Option<EventCallback>) {
        let fd = socket.fd();
        if fd == INVALID_FD {
            return;
        }

        {
            let mut tracked = self.shared.tracked.lock().unwrap();
            tracked.entry(fd).or_default().write_callback = callback;
        }

        self.shared.notifier.notify();
    }

    /// Stops tracking `socket`.
    ///
    /// With a dispatch in flight for the descriptor the record is only
    /// marked; it is erased once the last in-flight callback completes.
    pub fn untrack(&self, socket: &TcpSocket) {
        let fd = socket.fd();
        eprintln!("DEBUG: untrack fd={fd}");

        {
            let mut tracked = self.shared.tracked.lock().unwrap();
            if let Some(record) = tracked.get_mut(&fd) {
                if record.executing_read || record.executing_write {
                    log::debug!("mark fd {fd} for untracking");
                    record.marked_for_untrack = true;
                } else {
                    self.shared.remove_locked(&mut tracked, fd);
                }
            }
        }

        self.shared.notifier.notify();
    }

    /// Blocks until `socket`'s descriptor is absent from the tracked map,
    /// i.e. until all pending callbacks for it have completed.
    pub fn wait_for_removal(&self, socket: &TcpSocket) {
        self.wait_for_removal_fd(socket.fd());
    }

    pub(crate) fn wait_for_removal_fd(&self, fd: RawFd) {
        eprintln!("DEBUG: wait_for_removal_fd fd={fd}");
        let mut tracked = self.shared.tracked.lock().unwrap();
        while tracked.contains_key(&fd) {
            eprintln!("DEBUG: wait_for_removal_fd still contains key, waiting");
            tracked = self.shared.removal.wait(tracked).unwrap();
        }
        eprintln!("DEBUG: wait_for_removal_fd returning");
    }

    /// Resizes the worker pool dispatch callbacks run on.
    pub fn set_worker_count(&self, workers: usize) {
        self.shared.pool.set_thread_count(workers);
    }
}

impl Drop for IoService {
    fn drop(&mut self) {
        log::debug!("destroying io service");
        self.shared.should_stop.store(true, Ordering::Release);
        self.shared.notifier.notify();

        if let Some(poller) = self.poller.lock().unwrap().take() {
            let _ = poller.join();
        }
        self.shared.pool.stop();
    }
}

static DEFAULT_IO_SERVICE: Mutex<Option<Arc<IoService>>> = Mutex::new(None);

/// Returns the process-wide default service, creating it on first use.
///
/// Clients and servers built without an explicit service share this
/// instance.
pub fn default_io_service() -> Arc<IoService> {
    let mut slot = DEFAULT_IO_SERVICE.lock().unwrap();
    if let Some(service) = slot.as_ref() {
        return Arc::clone(service);
    }

    let service = Arc::new(IoService::new().expect("failed to initialize the default io service"));
    *slot = Some(Arc::clone(&service));
    service
}

/// Replaces (or, with `None`, clears) the process-wide default service.
pub fn set_default_io_service(service: Option<Arc<IoService>>) {
    log::debug!("setting new default io service");
    *DEFAULT_IO_SERVICE.lock().unwrap() = service;
}
