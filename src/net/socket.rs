//! Blocking TCP socket wrapper over the platform socket primitives.
//!
//! `TcpSocket` owns at most one file descriptor at a time and carries the
//! host/port it was pointed at plus the role it is used in. The descriptor
//! is created lazily on first use, choosing the address family from the
//! stored host. All operations are blocking; only `connect` with a timeout
//! temporarily flips the descriptor to non-blocking and restores it.

use std::io::{Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::{Error, Result};

/// Sentinel for "no descriptor".
pub const INVALID_FD: RawFd = -1;

/// What a socket is being used as.
///
/// A socket starts `Unknown` and is pinned to `Client` or `Server` by the
/// first role-specific operation; mixing roles is a usage error. `close`
/// resets the role to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unknown,
    Client,
    Server,
}

/// A blocking TCP socket.
#[derive(Debug)]
pub struct TcpSocket {
    sock: Option<Socket>,
    host: String,
    port: u32,
    role: Role,
}

impl TcpSocket {
    /// Creates an empty socket with no descriptor.
    pub fn new() -> Self {
        Self {
            sock: None,
            host: String::new(),
            port: 0,
            role: Role::Unknown,
        }
    }

    /// Wraps an already-open descriptor (e.g. one returned by `accept`).
    pub(crate) fn from_parts(sock: Socket, host: String, port: u32, role: Role) -> Self {
        Self {
            sock: Some(sock),
            host,
            port,
            role,
        }
    }

    /// Connects to `host:port`, optionally bounded by `timeout_ms`.
    ///
    /// With `timeout_ms == 0` this is a plain blocking connect. Otherwise
    /// the descriptor is flipped to non-blocking, the connect is raced
    /// against the timeout via a readiness wait plus `SO_ERROR` check, and
    /// blocking mode is restored on success. Expiry is an error. On any
    /// failure the socket is closed.
    pub fn connect(&mut self, host: &str, port: u32, timeout_ms: u32) -> Result<()> {
        self.host = host.to_string();
        self.port = port;

        self.create_socket_if_necessary()?;
        self.check_or_set_role(Role::Client)?;

        let addr = match self.resolve() {
            Ok(addr) => addr,
            Err(err) => {
                self.close();
                return Err(err);
            }
        };
        let sock = self.sock.as_ref().expect("socket was just created");

        let connected = if timeout_ms > 0 {
            sock.connect_timeout(
                &SockAddr::from(addr),
                Duration::from_millis(u64::from(timeout_ms)),
            )
        } else {
            sock.connect(&SockAddr::from(addr))
        };

        if let Err(err) = connected {
            self.close();
            return Err(if err.kind() == std::io::ErrorKind::TimedOut {
                Error::from_io("connect() timed out", err)
            } else {
                Error::from_io("connect() failure", err)
            });
        }

        Ok(())
    }

    /// Binds the socket to `host:port` for listening.
    pub fn bind(&mut self, host: &str, port: u32) -> Result<()> {
        self.host = host.to_string();
        self.port = port;

        self.create_socket_if_necessary()?;
        self.check_or_set_role(Role::Server)?;

        let addr = self.resolve()?;
        let sock = self.sock.as_ref().expect("socket was just created");

        sock.set_reuse_address(true)
            .map_err(|err| Error::from_io("setsockopt(SO_REUSEADDR) failure", err))?;
        sock.bind(&SockAddr::from(addr))
            .map_err(|err| Error::from_io("bind() failure", err))
    }

    /// Starts listening with the given backlog.
    pub fn listen(&mut self, backlog: i32) -> Result<()> {
        self.create_socket_if_necessary()?;
        self.check_or_set_role(Role::Server)?;

        self.sock
            .as_ref()
            .expect("socket was just created")
            .listen(backlog)
            .map_err(|err| Error::from_io("listen() failure", err))
    }

    /// Accepts one pending connection, returning a client-role socket for it.
    pub fn accept(&mut self) -> Result<TcpSocket> {
        self.create_socket_if_necessary()?;
        self.check_or_set_role(Role::Server)?;

        let (sock, addr) = self
            .sock
            .as_ref()
            .expect("socket was just created")
            .accept()
            .map_err(|err| Error::from_io("accept() failure", err))?;

        let (host, port) = match addr.as_socket() {
            Some(SocketAddr::V4(v4)) => (v4.ip().to_string(), u32::from(v4.port())),
            Some(SocketAddr::V6(v6)) => (format!("[{}]", v6.ip()), u32::from(v6.port())),
            None => (String::new(), 0),
        };

        Ok(TcpSocket::from_parts(sock, host, port, Role::Client))
    }

    /// Receives up to `size` bytes.
    ///
    /// A short read is returned as-is. Zero bytes means the peer closed
    /// the connection and is reported as an error.
    pub fn recv(&mut self, size: usize) -> Result<Vec<u8>> {
        self.create_socket_if_necessary()?;
        self.check_or_set_role(Role::Client)?;

        let mut buffer = vec![0u8; size];
        let read = self
            .sock
            .as_mut()
            .expect("socket was just created")
            .read(&mut buffer)
            .map_err(|err| Error::from_io("recv() failure", err))?;

        if read == 0 {
            return Err(Error::warn(
                "nothing to read, socket has been closed by remote host",
            ));
        }

        buffer.truncate(read);
        Ok(buffer)
    }

    /// Sends `data`, returning how many bytes the OS accepted.
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.create_socket_if_necessary()?;
        self.check_or_set_role(Role::Client)?;

        self.sock
            .as_mut()
            .expect("socket was just created")
            .write(data)
            .map_err(|err| Error::from_io("send() failure", err))
    }

    /// Closes the descriptor if open and resets the role. Idempotent.
    pub fn close(&mut self) {
        if self.sock.take().is_some() {
            log::debug!("close socket {}:{}", self.host, self.port);
        }
        self.role = Role::Unknown;
    }

    /// The raw descriptor, or [`INVALID_FD`] when closed.
    pub fn fd(&self) -> RawFd {
        self.sock.as_ref().map_or(INVALID_FD, |s| s.as_raw_fd())
    }

    /// The host this socket was last pointed at.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port this socket was last pointed at.
    pub fn port(&self) -> u32 {
        self.port
    }

    /// The current role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Overrides the role, for callers that performed role-determining
    /// operations on the descriptor themselves.
    pub fn set_role(&mut self, role: Role) {
        self.role = role;
    }

    /// Heuristic: the stored host is an IPv6 address if it contains `:`.
    pub fn is_ipv6(&self) -> bool {
        self.host.contains(':')
    }

    /// Pins the socket to `role`, failing if it is already pinned to the
    /// other one.
    fn check_or_set_role(&mut self, role: Role) -> Result<()> {
        if self.role != Role::Unknown && self.role != role {
            return Err(Error::error(
                "trying to perform invalid operation on socket",
            ));
        }
        self.role = role;
        Ok(())
    }

    /// Opens the descriptor if none exists yet, choosing the address family
    /// from the stored host.
    fn create_socket_if_necessary(&mut self) -> Result<()> {
        if self.sock.is_some() {
            return Ok(());
        }

        let domain = if self.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|err| Error::from_io("socket() failure", err))?;

        self.sock = Some(sock);
        self.role = Role::Unknown;
        Ok(())
    }

    /// Resolves the stored host/port to an address of the matching family.
    fn resolve(&self) -> Result<SocketAddr> {
        let port = u16::try_from(self.port)
            .map_err(|_| Error::error(format!("invalid port {}", self.port)))?;
        let ipv6 = self.is_ipv6();
        let host = self.host.trim_start_matches('[').trim_end_matches(']');

        (host, port)
            .to_socket_addrs()
            .map_err(|err| Error::from_io("getaddrinfo() failure", err))?
            .find(|addr| addr.is_ipv6() == ipv6)
            .ok_or_else(|| Error::error(format!("no usable address for {host}:{port}")))
    }
}

impl Default for TcpSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for TcpSocket {
    fn eq(&self, other: &Self) -> bool {
        self.fd() == other.fd() && self.role == other.role
    }
}

impl Eq for TcpSocket {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_without_descriptor() {
        let sock = TcpSocket::new();
        assert_eq!(sock.fd(), INVALID_FD);
        assert_eq!(sock.role(), Role::Unknown);
    }

    #[test]
    fn ipv6_heuristic() {
        let mut sock = TcpSocket::new();
        assert!(!sock.is_ipv6());
        sock.host = "::1".into();
        assert!(sock.is_ipv6());
        sock.host = "[fe80::1]".into();
        assert!(sock.is_ipv6());
    }

    #[test]
    fn role_is_pinned_by_first_operation() {
        let mut sock = TcpSocket::new();
        sock.bind("127.0.0.1", 0).unwrap();
        assert_eq!(sock.role(), Role::Server);

        // Client operations on a server socket are rejected.
        assert!(sock.recv(16).is_err());
        assert!(sock.send(b"x").is_err());
    }

    #[test]
    fn close_resets_role_and_descriptor() {
        let mut sock = TcpSocket::new();
        sock.bind("127.0.0.1", 0).unwrap();
        assert_ne!(sock.fd(), INVALID_FD);

        sock.close();
        assert_eq!(sock.fd(), INVALID_FD);
        assert_eq!(sock.role(), Role::Unknown);

        // Idempotent.
        sock.close();
        assert_eq!(sock.fd(), INVALID_FD);
    }

    #[test]
    fn closed_sockets_compare_equal_open_ones_do_not() {
        let a = TcpSocket::new();
        let b = TcpSocket::new();
        assert_eq!(a, b);

        let mut c = TcpSocket::new();
        let mut d = TcpSocket::new();
        c.bind("127.0.0.1", 0).unwrap();
        d.bind("127.0.0.1", 0).unwrap();
        assert_ne!(c, d);
    }
}
