use std::time::Instant;

use crossbeam_channel::Receiver;

use crate::error::Error;
use crate::latch::Latch;

/// A cancellable single event.
///
/// [`cancel`](Self::cancel) closes the channel returned by [`ch`](Self::ch)
/// exactly once; later calls are no-ops. Dropping the signal also
/// disconnects every outstanding channel, so a waiter is never stranded on a
/// signal that no longer exists.
#[derive(Debug, Default)]
pub struct OnceSignal {
    latch: Latch,
}

impl OnceSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the channel. Returns true for the call that did it.
    pub fn cancel(&self) -> bool {
        let first = self.latch.close();
        if first {
            tracing::trace!("once-signal cancelled");
        }
        first
    }

    pub fn is_done(&self) -> bool {
        self.latch.is_closed()
    }

    /// Channel that closes when the signal is cancelled.
    pub fn ch(&self) -> Receiver<()> {
        self.latch.ch()
    }

    /// Block until cancelled.
    pub fn wait(&self) {
        self.latch.wait()
    }

    /// [`Error::Cancelled`] once cancelled, `None` before.
    pub fn err(&self) -> Option<Error> {
        self.is_done().then_some(Error::Cancelled)
    }

    /// A once-signal carries no deadline.
    pub fn deadline(&self) -> Option<Instant> {
        None
    }
}
