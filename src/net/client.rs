//! Asynchronous TCP client driven by the reactor.
//!
//! A [`TcpClient`] owns a blocking socket and two independent FIFO queues
//! of pending read and write requests. Scheduling a request installs the
//! matching interest on the shared [`IoService`]; when the reactor reports
//! readiness, a worker pops exactly one request, performs the blocking
//! `recv`/`send`, and invokes the user callback. Each direction is strict
//! FIFO; the two directions are independent.
//!
//! A failed read or write flips the client into the disconnected state,
//! reports `success = false` to that request's callback, and fires the
//! disconnection handler exactly once per precipitating failure.

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::net::socket::TcpSocket;
use crate::reactor::{EventCallback, IoService, default_io_service};

/// Callback invoked with the outcome of one [`ReadRequest`].
pub type ReadCallback = Box<dyn FnOnce(ReadResult) + Send + 'static>;

/// Callback invoked with the outcome of one [`WriteRequest`].
pub type WriteCallback = Box<dyn FnOnce(WriteResult) + Send + 'static>;

/// Handler fired when a failed I/O operation disconnects the client.
pub type DisconnectionHandler = Arc<dyn Fn() + Send + Sync + 'static>;

/// A pending asynchronous read.
pub struct ReadRequest {
    /// Maximum number of bytes to receive.
    pub size: usize,
    /// Invoked once with the outcome; `None` to fire-and-forget.
    pub callback: Option<ReadCallback>,
}

/// A pending asynchronous write.
pub struct WriteRequest {
    /// Bytes handed to a single `send` call.
    pub buffer: Vec<u8>,
    /// Invoked once with the outcome; `None` to fire-and-forget.
    pub callback: Option<WriteCallback>,
}

/// Outcome of a read: on success `buffer` holds the received bytes, which
/// may be fewer than requested.
#[derive(Debug, Clone, Default)]
pub struct ReadResult {
    pub success: bool,
    pub buffer: Vec<u8>,
}

/// Outcome of a write: on success `size` is how many bytes the OS accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteResult {
    pub success: bool,
    pub size: usize,
}

struct Inner {
    io: Arc<IoService>,
    socket: Mutex<TcpSocket>,
    connected: AtomicBool,
    read_requests: Mutex<VecDeque<ReadRequest>>,
    write_requests: Mutex<VecDeque<WriteRequest>>,
    disconnection_handler: Mutex<Option<DisconnectionHandler>>,
}

/// An asynchronous TCP client.
///
/// Two clients compare equal when they wrap the same underlying socket.
/// Dropping the client disconnects it and waits for the reactor to release
/// the descriptor.
pub struct TcpClient {
    inner: Arc<Inner>,
}

impl TcpClient {
    /// Creates a disconnected client on the process-wide default service.
    pub fn new() -> Self {
        Self::with_io_service(default_io_service())
    }

    /// Creates a disconnected client on the given service.
    pub fn with_io_service(io: Arc<IoService>) -> Self {
        log::debug!("create tcp client");
        Self {
            inner: Arc::new(Inner {
                io,
                socket: Mutex::new(TcpSocket::new()),
                connected: AtomicBool::new(false),
                read_requests: Mutex::new(VecDeque::new()),
                write_requests: Mutex::new(VecDeque::new()),
                disconnection_handler: Mutex::new(None),
            }),
        }
    }

    /// Wraps an already-connected socket, e.g. one returned by `accept`.
    ///
    /// The socket is tracked on `io` with no interest installed and the
    /// client starts out connected.
    pub fn adopt(socket: TcpSocket, io: Arc<IoService>) -> Self {
        log::debug!("create tcp client from accepted socket");
        io.track(&socket, None, None);
        Self {
            inner: Arc::new(Inner {
                io,
                socket: Mutex::new(socket),
                connected: AtomicBool::new(true),
                read_requests: Mutex::new(VecDeque::new()),
                write_requests: Mutex::new(VecDeque::new()),
                disconnection_handler: Mutex::new(None),
            }),
        }
    }

    /// Connects to `host:port`, optionally bounded by `timeout_ms`
    /// (`0` means a plain blocking connect).
    ///
    /// Fails if the client is already connected. On connect failure the
    /// socket is closed and the error returned.
    pub fn connect(&self, host: &str, port: u32, timeout_ms: u32) -> Result<()> {
        if self.is_connected() {
            return Err(Error::warn("tcp client is already connected"));
        }

        {
            let mut socket = self.inner.socket.lock().unwrap();
            if let Err(err) = socket.connect(host, port, timeout_ms) {
                socket.close();
                return Err(err);
            }
            self.inner.io.track(&socket, None, None);
        }

        self.inner.connected.store(true, Ordering::Release);
        log::info!("tcp client connected to {host}:{port}");
        Ok(())
    }

    /// Disconnects the client. Idempotent; only the first call acts.
    ///
    /// Pending requests are discarded without invoking their callbacks.
    /// With `wait_for_removal` the call blocks until the reactor has
    /// released the descriptor, i.e. until in-flight callbacks finished.
    pub fn disconnect(&self, wait_for_removal: bool) {
        self.inner.disconnect(wait_for_removal);
    }

    /// Schedules an asynchronous read.
    ///
    /// Reads are serviced strictly in submission order, one per readiness
    /// event. Fails when the client is disconnected.
    pub fn async_read(&self, request: ReadRequest) -> Result<()> {
        let mut requests = self.inner.read_requests.lock().unwrap();
        if !self.is_connected() {
            return Err(Error::warn("tcp client is disconnected"));
        }

        let handler = Arc::clone(&self.inner);
        let callback: EventCallback = Arc::new(move |fd| handler.on_read_available(fd));
        {
            let socket = self.inner.socket.lock().unwrap();
            self.inner.io.set_read_callback(&socket, Some(callback));
        }

        requests.push_back(request);
        Ok(())
    }

    /// Schedules an asynchronous write.
    ///
    /// Writes are serviced strictly in submission order, one per readiness
    /// event. Fails when the client is disconnected.
    pub fn async_write(&self, request: WriteRequest) -> Result<()> {
        let mut requests = self.inner.write_requests.lock().unwrap();
        if !self.is_connected() {
            return Err(Error::warn("tcp client is disconnected"));
        }

        let handler = Arc::clone(&self.inner);
        let callback: EventCallback = Arc::new(move |fd| handler.on_write_available(fd));
        {
            let socket = self.inner.socket.lock().unwrap();
            self.inner.io.set_write_callback(&socket, Some(callback));
        }

        requests.push_back(request);
        Ok(())
    }

    /// Whether the client currently considers itself connected.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Stores the handler fired when a failed I/O operation disconnects
    /// the client; `None` clears it.
    pub fn set_disconnection_handler(&self, handler: Option<DisconnectionHandler>) {
        *self.inner.disconnection_handler.lock().unwrap() = handler;
    }

    /// The host this client was last pointed at.
    pub fn host(&self) -> String {
        self.inner.socket.lock().unwrap().host().to_string()
    }

    /// The port this client was last pointed at.
    pub fn port(&self) -> u32 {
        self.inner.socket.lock().unwrap().port()
    }

    /// Direct access to the underlying socket.
    pub fn socket(&self) -> MutexGuard<'_, TcpSocket> {
        self.inner.socket.lock().unwrap()
    }

    /// The service this client is multiplexed on.
    pub fn io_service(&self) -> Arc<IoService> {
        Arc::clone(&self.inner.io)
    }
}

impl Inner {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Reactor read callback: services exactly one queued read request.
    fn on_read_available(&self, _fd: RawFd) {
        log::debug!("read available");

        let Some((result, callback)) = self.process_read() else {
            return;
        };

        let success = result.success;
        if !success {
            log::warn!("read operation failure");
            self.disconnect(false);
        }
        if let Some(callback) = callback {
            callback(result);
        }
        if !success {
            self.call_disconnection_handler();
        }
    }

    /// Reactor write callback: services exactly one queued write request.
    fn on_write_available(&self, _fd: RawFd) {
        log::debug!("write available");

        let Some((result, callback)) = self.process_write() else {
            return;
        };

        let success = result.success;
        if !success {
            log::warn!("write operation failure");
            self.disconnect(false);
        }
        if let Some(callback) = callback {
            callback(result);
        }
        if !success {
            self.call_disconnection_handler();
        }
    }

    /// Pops and performs one read. Returns `None` on a spurious wakeup
    /// with nothing queued, after clearing read interest.
    fn process_read(&self) -> Option<(ReadResult, Option<ReadCallback>)> {
        let mut requests = self.read_requests.lock().unwrap();

        let Some(request) = requests.pop_front() else {
            let socket = self.socket.lock().unwrap();
            self.io.set_read_callback(&socket, None);
            return None;
        };

        let result = {
            let mut socket = self.socket.lock().unwrap();
            match socket.recv(request.size) {
                Ok(buffer) => ReadResult {
                    success: true,
                    buffer,
                },
                Err(_) => ReadResult {
                    success: false,
                    buffer: Vec::new(),
                },
            }
        };

        // Draining the queue requires clearing the reactor interest, or the
        // poller would keep reporting readiness with nothing to do.
        if requests.is_empty() {
            let socket = self.socket.lock().unwrap();
            self.io.set_read_callback(&socket, None);
        }

        Some((result, request.callback))
    }

    /// Pops and performs one write; the counterpart to `process_read`.
    fn process_write(&self) -> Option<(WriteResult, Option<WriteCallback>)> {
        let mut requests = self.write_requests.lock().unwrap();

        let Some(request) = requests.pop_front() else {
            let socket = self.socket.lock().unwrap();
            self.io.set_write_callback(&socket, None);
            return None;
        };

        let result = {
            let mut socket = self.socket.lock().unwrap();
            match socket.send(&request.buffer) {
                Ok(size) => WriteResult {
                    success: true,
                    size,
                },
                Err(_) => WriteResult {
                    success: false,
                    size: 0,
                },
            }
        };

        if requests.is_empty() {
            let socket = self.socket.lock().unwrap();
            self.io.set_write_callback(&socket, None);
        }

        Some((result, request.callback))
    }

    fn disconnect(&self, wait_for_removal: bool) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }

        self.clear_read_requests();
        self.clear_write_requests();

        let fd = {
            let socket = self.socket.lock().unwrap();
            self.io.untrack(&socket);
            socket.fd()
        };
        if wait_for_removal {
            self.io.wait_for_removal_fd(fd);
        }

        self.socket.lock().unwrap().close();
        log::info!("tcp client disconnected");
    }

    fn clear_read_requests(&self) {
        self.read_requests.lock().unwrap().clear();
    }

    fn clear_write_requests(&self) {
        self.write_requests.lock().unwrap().clear();
    }

    fn call_disconnection_handler(&self) {
        let handler = self.disconnection_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}

impl Default for TcpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for TcpClient {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        let (fd_a, role_a) = {
            let socket = self.inner.socket.lock().unwrap();
            (socket.fd(), socket.role())
        };
        let (fd_b, role_b) = {
            let socket = other.inner.socket.lock().unwrap();
            (socket.fd(), socket.role())
        };
        fd_a == fd_b && role_a == role_b
    }
}

impl Eq for TcpClient {}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.inner.disconnect(true);
    }
}
