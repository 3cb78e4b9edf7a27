//! At most one computation in flight, any number of callers.
//!
//! Every caller either wins the current round and computes, or waits for a
//! round that satisfies its [`WinOrWaitStrategy`]. Rounds are elected with a
//! [`OnceWinner`] and publish through a [`Future`].

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crossbeam_channel::{Receiver, select};
use parking_lot::Mutex;

use crate::error::{Error, Result, recover};
use crate::future::Future;
use crate::latch::is_closed_ch;
use crate::once_winner::{OnceWinner, WinnerStrategy};

/// Which completed computation a waiting caller accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WinOrWaitStrategy {
    /// Any computation that completes after the caller arrived, including
    /// one already running.
    #[default]
    AnyValue,
    /// Only a computation that started after the caller arrived.
    MustBeLater,
}

type Calculator<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;

pub struct WinOrWaiter<T> {
    strategy: WinOrWaitStrategy,
    calculator: Calculator<T>,
    cancel: Receiver<()>,
    round: Mutex<Arc<Round<T>>>,
    waiting: AtomicUsize,
}

struct Round<T> {
    winner: OnceWinner,
    started: OnceLock<Instant>,
    completed: OnceLock<Instant>,
    outcome: Future<T>,
}

impl<T> Round<T> {
    fn new() -> Self {
        Self {
            winner: OnceWinner::new(),
            started: OnceLock::new(),
            completed: OnceLock::new(),
            outcome: Future::new(),
        }
    }

    fn satisfies(&self, strategy: WinOrWaitStrategy, arrival: Instant) -> bool {
        let stamp = match strategy {
            WinOrWaitStrategy::AnyValue => self.completed.get(),
            WinOrWaitStrategy::MustBeLater => self.started.get(),
        };
        stamp.is_some_and(|at| *at >= arrival)
    }
}

impl<T: Clone + Send + Sync + 'static> WinOrWaiter<T> {
    /// `cancel` aborts every waiting caller once it closes.
    pub fn new(
        strategy: WinOrWaitStrategy,
        calculator: impl Fn() -> Result<T> + Send + Sync + 'static,
        cancel: Option<Receiver<()>>,
    ) -> Self {
        Self {
            strategy,
            calculator: Box::new(calculator),
            cancel: cancel.unwrap_or_else(crossbeam_channel::never),
            round: Mutex::new(Arc::new(Round::new())),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Compute, or wait for a computation acceptable under the strategy.
    pub fn win_or_wait(&self) -> Result<T> {
        let arrival = Instant::now();
        loop {
            if is_closed_ch(&self.cancel) {
                return Err(Error::Cancelled);
            }
            let round = Arc::clone(&self.round.lock());

            let (won, done) = round.winner.is_winner(WinnerStrategy::NoWait);
            if won {
                let _ = round.started.set(Instant::now());
                let outcome = recover(|| (self.calculator)()).and_then(|r| r);
                let _ = round.completed.set(Instant::now());
                {
                    let mut current = self.round.lock();
                    if Arc::ptr_eq(&current, &round) {
                        *current = Arc::new(Round::new());
                    }
                }
                // late arrivals already see the fresh round
                round.outcome.end(outcome.clone());
                drop(done);
                return outcome;
            }

            self.waiting.fetch_add(1, Ordering::SeqCst);
            let completed = round.outcome.ch();
            let cancelled = select! {
                recv(completed) -> _ => false,
                recv(self.cancel) -> _ => true,
            };
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            if cancelled {
                return Err(Error::Cancelled);
            }

            if round.satisfies(self.strategy, arrival) {
                if let Some(outcome) = round.outcome.try_result() {
                    return outcome.cloned().map_err(Error::clone);
                }
            }
            tracing::trace!(strategy = ?self.strategy, "round too early; waiting for the next");
        }
    }

    /// A computation is running.
    pub fn is_calculating(&self) -> bool {
        let round = self.round.lock();
        round.winner.is_invoked() && !round.outcome.is_completed()
    }

    /// Callers blocked on the running computation.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

impl<T> fmt::Debug for WinOrWaiter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WinOrWaiter")
            .field("strategy", &self.strategy)
            .field("waiting", &self.waiting.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::once_signal::OnceSignal;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// A calculator whose first call blocks until released.
    fn gated() -> (
        impl Fn() -> Result<u32> + Send + Sync + 'static,
        Receiver<()>,
        OnceSignal,
        Arc<AtomicU32>,
    ) {
        let calls = Arc::new(AtomicU32::new(0));
        let (started_tx, started_rx) = crossbeam_channel::unbounded();
        let release = OnceSignal::new();
        let gate = release.ch();
        let counter = Arc::clone(&calls);
        let calculator = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 1 {
                let _ = started_tx.send(());
                let _ = gate.recv();
            }
            Ok(n)
        };
        (calculator, started_rx, release, calls)
    }

    fn wait_for_waiters<T: Clone + Send + Sync + 'static>(w: &WinOrWaiter<T>, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while w.waiting() != n {
            assert!(Instant::now() < deadline, "never saw {n} waiters");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn any_value_accepts_running_computation() {
        let (calculator, started, release, calls) = gated();
        let w = WinOrWaiter::new(WinOrWaitStrategy::AnyValue, calculator, None);

        std::thread::scope(|s| {
            let first = s.spawn(|| w.win_or_wait().unwrap());
            started.recv().unwrap();
            assert!(w.is_calculating());
            let second = s.spawn(|| w.win_or_wait().unwrap());
            wait_for_waiters(&w, 1);
            release.cancel();
            assert_eq!(first.join().unwrap(), 1);
            assert_eq!(second.join().unwrap(), 1);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!w.is_calculating());
    }

    #[test]
    fn must_be_later_forces_new_computation() {
        let (calculator, started, release, calls) = gated();
        let w = WinOrWaiter::new(WinOrWaitStrategy::MustBeLater, calculator, None);

        std::thread::scope(|s| {
            let first = s.spawn(|| w.win_or_wait().unwrap());
            started.recv().unwrap();
            let second = s.spawn(|| w.win_or_wait().unwrap());
            wait_for_waiters(&w, 1);
            release.cancel();
            assert_eq!(first.join().unwrap(), 1);
            assert_eq!(second.join().unwrap(), 2);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn fresh_round_is_in_place_before_outcome_is_published() {
        let (calculator, started, release, _calls) = gated();
        let w = WinOrWaiter::new(WinOrWaitStrategy::MustBeLater, calculator, None);

        std::thread::scope(|s| {
            let first = s.spawn(|| w.win_or_wait().unwrap());
            started.recv().unwrap();
            let round = Arc::clone(&w.round.lock());
            let completed = round.outcome.ch();
            release.cancel();

            let _ = completed.recv();
            assert!(!Arc::ptr_eq(&w.round.lock(), &round));
            assert!(!w.is_calculating());
            assert_eq!(first.join().unwrap(), 1);
        });
    }

    #[test]
    fn crowd_shares_few_computations() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let w = WinOrWaiter::new(
            WinOrWaitStrategy::AnyValue,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(10));
                Ok("fresh".to_string())
            },
            None,
        );
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| assert_eq!(w.win_or_wait().unwrap(), "fresh"));
            }
        });
        let calls = calls.load(Ordering::SeqCst);
        assert!((1..=8).contains(&calls), "calls: {calls}");
    }

    #[test]
    fn cancel_aborts_waiters() {
        let (calculator, started, release, _calls) = gated();
        let cancel = OnceSignal::new();
        let w = WinOrWaiter::new(WinOrWaitStrategy::AnyValue, calculator, Some(cancel.ch()));

        std::thread::scope(|s| {
            let first = s.spawn(|| w.win_or_wait());
            started.recv().unwrap();
            let second = s.spawn(|| w.win_or_wait());
            wait_for_waiters(&w, 1);
            cancel.cancel();
            assert!(second.join().unwrap().unwrap_err().is_cancelled());
            release.cancel();
            assert_eq!(first.join().unwrap().unwrap(), 1);
        });
        assert!(w.win_or_wait().unwrap_err().is_cancelled());
    }

    #[test]
    fn calculator_panic_reaches_every_caller() {
        let w: WinOrWaiter<u8> =
            WinOrWaiter::new(WinOrWaitStrategy::AnyValue, || panic!("calc failed"), None);
        assert!(w.win_or_wait().unwrap_err().is_panic());
        // a fresh round runs after the failed one
        assert!(w.win_or_wait().unwrap_err().is_panic());
    }
}
