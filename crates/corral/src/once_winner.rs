use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Receiver;

use crate::latch::Latch;

/// What a losing caller of [`OnceWinner::is_winner`] does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WinnerStrategy {
    /// Block until the winner reports done.
    #[default]
    Wait,
    /// Return immediately.
    NoWait,
}

/// Elects exactly one of many contending callers.
///
/// The first caller of [`is_winner`](Self::is_winner) wins and gets a
/// [`WinnerDone`] handle; everyone else loses and either waits for the
/// winner to finish or walks away.
#[derive(Debug, Default)]
pub struct OnceWinner {
    invoked: AtomicBool,
    latch: Latch,
}

/// Held by the winner; completes the election when done or dropped.
#[must_use = "the winner must report done, or losers wait forever"]
pub struct WinnerDone<'a> {
    winner: &'a OnceWinner,
}

impl WinnerDone<'_> {
    /// Report completion, releasing every waiting loser.
    pub fn done(self) {}
}

impl Drop for WinnerDone<'_> {
    fn drop(&mut self) {
        self.winner.latch.close();
    }
}

impl OnceWinner {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(true, Some(done))` for the single winner, `(false, None)` for
    /// everyone else.
    pub fn is_winner(&self, strategy: WinnerStrategy) -> (bool, Option<WinnerDone<'_>>) {
        if self
            .invoked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return (true, Some(WinnerDone { winner: self }));
        }
        if strategy == WinnerStrategy::Wait {
            self.latch.wait();
        }
        (false, None)
    }

    /// A winner has been selected.
    pub fn is_invoked(&self) -> bool {
        self.invoked.load(Ordering::SeqCst)
    }

    /// The winner has reported done.
    pub fn is_closed(&self) -> bool {
        self.latch.is_closed()
    }

    /// Channel that closes when the winner reports done.
    pub fn ch(&self) -> Receiver<()> {
        self.latch.ch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn exactly_one_winner_and_losers_wait() {
        let winner = OnceWinner::new();
        let wins = AtomicUsize::new(0);
        let released = AtomicUsize::new(0);
        let barrier = Barrier::new(10);

        std::thread::scope(|s| {
            for _ in 0..10 {
                s.spawn(|| {
                    barrier.wait();
                    let (is_winner, done) = winner.is_winner(WinnerStrategy::Wait);
                    if is_winner {
                        wins.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        assert_eq!(released.load(Ordering::SeqCst), 0);
                        done.expect("winner gets a done handle").done();
                    } else {
                        assert!(done.is_none());
                        assert!(winner.is_closed());
                        released.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert_eq!(released.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn no_wait_losers_return_immediately() {
        let winner = OnceWinner::new();
        assert!(!winner.is_invoked());

        let (won, done) = winner.is_winner(WinnerStrategy::NoWait);
        assert!(won);
        assert!(winner.is_invoked());
        assert!(!winner.is_closed());

        let (lost, none) = winner.is_winner(WinnerStrategy::NoWait);
        assert!(!lost);
        assert!(none.is_none());

        let ch = winner.ch();
        drop(done);
        assert!(winner.is_closed());
        assert!(ch.recv().is_err());
    }
}
