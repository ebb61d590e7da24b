//! TCP server accepting connections through the reactor.
//!
//! A [`TcpServer`] binds and listens on a blocking socket and tracks it in
//! the shared [`IoService`] with an accept handler as read callback. Each
//! accepted connection is wrapped in a [`TcpClient`]; the accept callback
//! decides whether it takes ownership or the server retains the client in
//! its own list until disconnection.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::net::client::TcpClient;
use crate::net::socket::TcpSocket;
use crate::reactor::{EventCallback, IoService, default_io_service};

/// Listen backlog used by [`TcpServer::start`].
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Accept callback: returns `true` when it takes ownership of the client,
/// `false` to let the server retain it.
pub type OnNewConnection = Arc<dyn Fn(&Arc<TcpClient>) -> bool + Send + Sync + 'static>;

struct ServerInner {
    io: Arc<IoService>,
    socket: Mutex<TcpSocket>,
    running: AtomicBool,
    on_new_connection: Mutex<Option<OnNewConnection>>,
    clients: Mutex<Vec<Arc<TcpClient>>>,
}

/// An asynchronous TCP server.
///
/// Dropping the server stops it without waiting for reactor removal.
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

impl TcpServer {
    /// Creates a stopped server on the process-wide default service.
    pub fn new() -> Self {
        Self::with_io_service(default_io_service())
    }

    /// Creates a stopped server on the given service.
    pub fn with_io_service(io: Arc<IoService>) -> Self {
        log::debug!("create tcp server");
        Self {
            inner: Arc::new(ServerInner {
                io,
                socket: Mutex::new(TcpSocket::new()),
                running: AtomicBool::new(false),
                on_new_connection: Mutex::new(None),
                clients: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Binds, listens with [`DEFAULT_BACKLOG`] and starts accepting.
    ///
    /// `on_new_connection` runs on a worker for every accepted connection;
    /// returning `true` means the caller takes ownership of the client,
    /// `false` leaves it owned by the server until it disconnects.
    pub fn start<F>(&self, host: &str, port: u32, on_new_connection: F) -> Result<()>
    where
        F: Fn(&Arc<TcpClient>) -> bool + Send + Sync + 'static,
    {
        self.start_with_backlog(host, port, DEFAULT_BACKLOG, on_new_connection)
    }

    /// Same as [`start`](Self::start) with an explicit listen backlog.
    pub fn start_with_backlog<F>(
        &self,
        host: &str,
        port: u32,
        backlog: i32,
        on_new_connection: F,
    ) -> Result<()>
    where
        F: Fn(&Arc<TcpClient>) -> bool + Send + Sync + 'static,
    {
        if self.is_running() {
            return Err(Error::warn("tcp server is already running"));
        }

        *self.inner.on_new_connection.lock().unwrap() = Some(Arc::new(on_new_connection));

        {
            let mut socket = self.inner.socket.lock().unwrap();
            socket.bind(host, port)?;
            socket.listen(backlog)?;

            let handler = Arc::clone(&self.inner);
            let callback: EventCallback =
                Arc::new(move |fd| ServerInner::on_read_available(&handler, fd));
            self.inner.io.track(&socket, Some(callback), None);
        }

        self.inner.running.store(true, Ordering::Release);
        log::info!("tcp server listening on {host}:{port}");
        Ok(())
    }

    /// Stops the server. Idempotent; only the first call acts.
    ///
    /// Untracks and closes the listen socket (waiting for reactor removal
    /// when `wait_for_removal` is set), then disconnects every retained
    /// client (each waiting too when `recursive` is also set) and empties
    /// the client list.
    pub fn stop(&self, wait_for_removal: bool, recursive: bool) {
        self.inner.stop(wait_for_removal, recursive);
    }

    /// Whether the server is currently accepting connections.
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// Snapshot of the clients the server currently owns.
    pub fn clients(&self) -> Vec<Arc<TcpClient>> {
        self.inner.clients.lock().unwrap().clone()
    }

    /// Direct access to the listen socket.
    pub fn socket(&self) -> MutexGuard<'_, TcpSocket> {
        self.inner.socket.lock().unwrap()
    }

    /// The service this server is multiplexed on.
    pub fn io_service(&self) -> Arc<IoService> {
        Arc::clone(&self.inner.io)
    }
}

impl ServerInner {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Reactor read callback on the listen socket: accepts one connection.
    fn on_read_available(this: &Arc<Self>, _fd: RawFd) {
        let accepted = this.socket.lock().unwrap().accept();

        match accepted {
            Ok(socket) => {
                log::info!(
                    "tcp server accepted a connection from {}:{}",
                    socket.host(),
                    socket.port()
                );
                let client = Arc::new(TcpClient::adopt(socket, Arc::clone(&this.io)));

                let callback = this.on_new_connection.lock().unwrap().clone();
                let handled = callback.map(|on_accept| on_accept(&client)).unwrap_or(false);

                if handled {
                    log::debug!("connection handled by the accept callback");
                } else {
                    log::debug!("connection retained by the server");
                    let server = Arc::downgrade(this);
                    let who = Arc::downgrade(&client);
                    client.set_disconnection_handler(Some(Arc::new(move || {
                        if let (Some(server), Some(client)) = (server.upgrade(), who.upgrade()) {
                            server.on_client_disconnected(&client);
                        }
                    })));
                    this.clients.lock().unwrap().push(client);
                }
            }
            Err(_) => {
                log::warn!("accept operation failure");
                this.stop(false, false);
            }
        }
    }

    /// Disconnection handler installed on retained clients: drops the
    /// client from the list while the server is running.
    fn on_client_disconnected(&self, client: &Arc<TcpClient>) {
        // During stop the list is already being torn down.
        if !self.is_running() {
            return;
        }

        log::debug!("handle server client disconnection");
        let mut clients = self.clients.lock().unwrap();
        if let Some(position) = clients.iter().position(|c| Arc::ptr_eq(c, client)) {
            clients.remove(position);
        }
    }

    fn stop(&self, wait_for_removal: bool, recursive: bool) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let fd = {
            let socket = self.socket.lock().unwrap();
            self.io.untrack(&socket);
            socket.fd()
        };
        if wait_for_removal {
            self.io.wait_for_removal_fd(fd);
        }
        self.socket.lock().unwrap().close();

        // The list is drained before disconnecting so a disconnection
        // handler running concurrently never contends with a held lock.
        let clients = std::mem::take(&mut *self.clients.lock().unwrap());
        for client in &clients {
            client.disconnect(wait_for_removal && recursive);
        }

        log::info!("tcp server stopped");
    }
}

impl Default for TcpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for TcpServer {
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

impl Eq for TcpServer {}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.inner.stop(false, false);
    }
}
