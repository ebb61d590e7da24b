//! TCP networking primitives built on top of the reactor.
//!
//! This module provides the user-visible transport types: a blocking
//! [`TcpSocket`](socket::TcpSocket) wrapper, an asynchronous
//! [`TcpClient`](client::TcpClient) and an asynchronous
//! [`TcpServer`](server::TcpServer), all multiplexed over a shared
//! [`IoService`](crate::IoService).

pub mod client;
pub mod server;
pub mod socket;
