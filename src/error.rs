//! The unified error type for socket and reactor failures.
//!
//! Every fallible operation in this crate reports the same error kind: a
//! human-readable message plus a severity class. Usage errors (double
//! connect, wrong-role operation, orderly peer shutdown) are `Warn`;
//! syscall and resolution failures are `Error`. Errors are logged at their
//! severity when they are created, so call sites only need to propagate.

use std::io;

/// How serious a failure is, mirroring the log level it is reported at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Recoverable or caller-induced: misuse of the API, peer went away.
    Warn,
    /// A syscall or resolution failure the caller did not cause.
    Error,
}

/// The error type shared by sockets, the reactor, clients and servers.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct Error {
    message: String,
    severity: Severity,
    #[source]
    source: Option<io::Error>,
}

impl Error {
    /// Creates a `Warn`-severity error (API misuse, orderly peer shutdown).
    pub fn warn(message: impl Into<String>) -> Self {
        let message = message.into();
        log::warn!("{message}");
        Self {
            message,
            severity: Severity::Warn,
            source: None,
        }
    }

    /// Creates an `Error`-severity error.
    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        log::error!("{message}");
        Self {
            message,
            severity: Severity::Error,
            source: None,
        }
    }

    /// Creates an `Error`-severity error wrapping the OS error that caused it.
    pub fn from_io(message: impl Into<String>, source: io::Error) -> Self {
        let message = message.into();
        log::error!("{message}: {source}");
        Self {
            message,
            severity: Severity::Error,
            source: Some(source),
        }
    }

    /// The severity class this error was reported with.
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_is_preserved() {
        assert_eq!(Error::warn("nope").severity(), Severity::Warn);
        assert_eq!(Error::error("broken").severity(), Severity::Error);
    }

    #[test]
    fn displays_message_and_keeps_source() {
        let err = Error::from_io(
            "connect() failure",
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert_eq!(err.to_string(), "connect() failure");
        assert!(std::error::Error::source(&err).is_some());
    }
}
