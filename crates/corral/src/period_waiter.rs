use parking_lot::{Condvar, Mutex};

/// A barrier that can be raised and lowered repeatedly.
///
/// While held, [`wait`](Self::wait) blocks. [`release`](Self::release)
/// lets every thread of the current hold period through, even if the
/// barrier is raised again before they wake up.
#[derive(Default)]
pub struct PeriodWaiter {
    state: Mutex<PeriodState>,
    cv: Condvar,
}

#[derive(Default)]
struct PeriodState {
    held: bool,
    generation: u64,
    waiting: usize,
}

impl PeriodWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the barrier. A no-op while already held.
    pub fn hold(&self) {
        let mut state = self.state.lock();
        if !state.held {
            state.held = true;
            state.generation += 1;
        }
    }

    /// Lower the barrier and wake every held thread.
    pub fn release(&self) {
        let mut state = self.state.lock();
        if state.held {
            state.held = false;
            self.cv.notify_all();
        }
    }

    /// Block while the barrier is held.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        if !state.held {
            return;
        }
        let generation = state.generation;
        state.waiting += 1;
        while state.held && state.generation == generation {
            self.cv.wait(&mut state);
        }
        state.waiting -= 1;
    }

    pub fn is_hold(&self) -> bool {
        self.state.lock().held
    }

    /// Threads currently blocked in [`wait`](Self::wait).
    pub fn count(&self) -> usize {
        self.state.lock().waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_for_count(waiter: &PeriodWaiter, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while waiter.count() != n {
            assert!(Instant::now() < deadline, "count never reached {n}");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn open_barrier_does_not_block() {
        let waiter = PeriodWaiter::new();
        assert!(!waiter.is_hold());
        waiter.wait();
        assert_eq!(waiter.count(), 0);
    }

    #[test]
    fn hold_blocks_until_release() {
        let waiter = PeriodWaiter::new();
        waiter.hold();
        assert!(waiter.is_hold());
        std::thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| waiter.wait());
            }
            wait_for_count(&waiter, 3);
            waiter.release();
        });
        assert_eq!(waiter.count(), 0);
        assert!(!waiter.is_hold());
    }

    #[test]
    fn rehold_starts_new_period() {
        let waiter = PeriodWaiter::new();
        waiter.hold();
        std::thread::scope(|s| {
            let early = s.spawn(|| waiter.wait());
            wait_for_count(&waiter, 1);
            waiter.release();
            waiter.hold();
            // the early waiter belongs to the released period and gets through
            early.join().unwrap();
            assert!(waiter.is_hold());

            s.spawn(|| waiter.wait());
            wait_for_count(&waiter, 1);
            waiter.release();
        });
    }
}
