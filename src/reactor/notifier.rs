//! Cross-thread wakeup for the poller.
//!
//! Any thread that mutates reactor state calls [`Notifier::notify`] so the
//! thread blocked in the readiness call observes the change promptly. The
//! underlying primitive is `mio::Waker` (an eventfd or pipe depending on
//! the platform); multiple pending notifications coalesce into one wakeup,
//! and draining is handled by the primitive itself.

use std::io;

use mio::{Registry, Token, Waker};

/// Token reserved for wakeup events; never collides with descriptor tokens.
pub(crate) const NOTIFIER_TOKEN: Token = Token(usize::MAX);

/// Wakes the poller from any thread.
pub(crate) struct Notifier {
    waker: Waker,
}

impl Notifier {
    /// Registers a waker on the poller's registry under [`NOTIFIER_TOKEN`].
    pub(crate) fn new(registry: &Registry) -> io::Result<Self> {
        Ok(Self {
            waker: Waker::new(registry, NOTIFIER_TOKEN)?,
        })
    }

    /// Makes the blocked readiness call return.
    ///
    /// Failures are logged and swallowed: a missed wakeup only delays
    /// observation until the next event or poll timeout.
    pub(crate) fn notify(&self) {
        if let Err(err) = self.waker.wake() {
            log::warn!("failed to wake the poller: {err}");
        }
    }
}
