//! A callback-driven TCP networking library built around a readiness
//! reactor and a resizable worker pool.
//!
//! One poller thread per [`IoService`] watches a dynamic set of sockets
//! for readability and writability; ready events are dispatched as
//! callbacks onto worker threads. On top of the reactor sit blocking
//! [`TcpSocket`]s, asynchronous [`TcpClient`]s with per-direction FIFO
//! request queues, and an asynchronous [`TcpServer`]. It consists of:
//!
//! - [`reactor`]: descriptor tracking, the poll loop and callback dispatch
//! - [`pool`]: the worker pool executing dispatched callbacks
//! - [`net`]: socket, client and server types
//! - [`error`]: the unified error type
//!
//! ```no_run
//! use tidepool::{ReadRequest, TcpClient, WriteRequest};
//!
//! let client = TcpClient::new();
//! client.connect("127.0.0.1", 3001, 1000)?;
//! client.async_write(WriteRequest {
//!     buffer: b"ping".to_vec(),
//!     callback: None,
//! })?;
//! client.async_read(ReadRequest {
//!     size: 1024,
//!     callback: Some(Box::new(|result| {
//!         if result.success {
//!             println!("received {} bytes", result.buffer.len());
//!         }
//!     })),
//! })?;
//! # Ok::<(), tidepool::Error>(())
//! ```

pub mod error;
pub mod net;
pub mod pool;
pub mod reactor;

pub use error::{Error, Result, Severity};
pub use net::client::{
    DisconnectionHandler, ReadCallback, ReadRequest, ReadResult, TcpClient, WriteCallback,
    WriteRequest, WriteResult,
};
pub use net::server::{DEFAULT_BACKLOG, OnNewConnection, TcpServer};
pub use net::socket::{INVALID_FD, Role, TcpSocket};
pub use pool::ThreadPool;
pub use reactor::{
    DEFAULT_WORKER_COUNT, EventCallback, IoService, default_io_service, set_default_io_service,
};
