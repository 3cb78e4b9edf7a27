//! Latched channels: channels that close once and stay closed.
//!
//! A [`Latch`] owns the only sender of a zero-capacity channel that is never
//! sent on. Closing the latch drops that sender, which disconnects every
//! receiver handed out by [`Latch::ch`]: their `recv()` returns immediately
//! from then on, and they take part in `crossbeam_channel::select!` like any
//! other channel.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;

pub struct Latch {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl Latch {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    /// Close the latch. Returns true for the call that closed it.
    pub fn close(&self) -> bool {
        self.tx.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// A receiver that disconnects when the latch closes.
    pub fn ch(&self) -> Receiver<()> {
        self.rx.clone()
    }

    /// Block until the latch closes.
    pub fn wait(&self) {
        let _ = self.rx.recv();
    }

    /// Block until the latch closes or `timeout` elapses; true if closed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        !matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Whether a latched channel has closed, without blocking.
pub fn is_closed_ch(ch: &Receiver<()>) -> bool {
    matches!(ch.try_recv(), Err(TryRecvError::Disconnected) | Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_is_idempotent_and_observable() {
        let latch = Latch::new();
        let ch = latch.ch();
        assert!(!latch.is_closed());
        assert!(!is_closed_ch(&ch));
        assert!(!latch.wait_timeout(Duration::from_millis(5)));

        assert!(latch.close());
        assert!(!latch.close());
        assert!(latch.is_closed());
        assert!(is_closed_ch(&ch));
        assert!(is_closed_ch(&latch.ch()));
        latch.wait();
    }

    #[test]
    fn close_wakes_blocked_waiters() {
        let latch = Latch::new();
        std::thread::scope(|s| {
            let waiters: Vec<_> = (0..4)
                .map(|_| {
                    let ch = latch.ch();
                    s.spawn(move || ch.recv().is_err())
                })
                .collect();
            std::thread::sleep(Duration::from_millis(20));
            latch.close();
            for waiter in waiters {
                assert!(waiter.join().unwrap());
            }
        });
    }
}
