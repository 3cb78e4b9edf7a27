use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use corral_types::{CounterSnapshot, SyncSnapshot};

use crate::latch::Latch;
use crate::registry::Inspect;

/// A work counter that is also a waitable barrier.
///
/// `adds` and `dones` only ever grow; `remaining = adds - dones` never goes
/// negative. The wait channel closes the first time `remaining` drops to
/// zero after at least one add, and stays closed until [`reset`](Self::reset).
pub struct GroupCounter {
    state: Mutex<CounterState>,
}

struct CounterState {
    adds: u64,
    dones: u64,
    latch: Arc<Latch>,
}

impl CounterState {
    fn remaining(&self) -> u64 {
        self.adds - self.dones
    }
}

impl GroupCounter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CounterState {
                adds: 0,
                dones: 0,
                latch: Arc::new(Latch::new()),
            }),
        }
    }

    /// Add `delta` to the counter; a negative delta counts dones.
    ///
    /// # Panics
    ///
    /// When `remaining` would go negative, or when adding to a counter whose
    /// wait channel already closed without a [`reset`](Self::reset).
    #[track_caller]
    pub fn add(&self, delta: i64) -> bool {
        let mut state = self.state.lock();
        if delta > 0 {
            if state.latch.is_closed() {
                panic!("group counter: add after reaching zero; reset it first");
            }
            state.adds += delta.unsigned_abs();
        } else if delta < 0 {
            let dones = state.dones + delta.unsigned_abs();
            if dones > state.adds {
                panic!(
                    "group counter: negative count: adds {} dones {}",
                    state.adds, dones
                );
            }
            state.dones = dones;
        }
        let is_exit = state.adds > 0 && state.remaining() == 0;
        if is_exit {
            state.latch.close();
        }
        is_exit
    }

    /// Count one done. Returns true when this brought the counter to zero.
    #[track_caller]
    pub fn done(&self) -> bool {
        self.add(-1)
    }

    pub fn current_count(&self) -> u64 {
        self.state.lock().remaining()
    }

    /// `(remaining, adds)`.
    pub fn counts(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.remaining(), state.adds)
    }

    /// True once the counter reached zero after at least one add.
    pub fn is_zero(&self) -> bool {
        self.state.lock().latch.is_closed()
    }

    /// Channel that closes when the counter reaches zero.
    pub fn wait_ch(&self) -> Receiver<()> {
        self.state.lock().latch.ch()
    }

    /// Block until the counter reaches zero after at least one add.
    pub fn wait(&self) {
        let latch = Arc::clone(&self.state.lock().latch);
        latch.wait();
    }

    /// Start over with zero counts and a fresh wait channel.
    ///
    /// # Panics
    ///
    /// When work is still outstanding.
    #[track_caller]
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if state.remaining() != 0 {
            panic!("group counter: reset with {} remaining", state.remaining());
        }
        state.adds = 0;
        state.dones = 0;
        if state.latch.is_closed() {
            state.latch = Arc::new(Latch::new());
        }
    }
}

impl Default for GroupCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GroupCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (remaining, adds) = self.counts();
        write!(f, "{remaining}({adds})")
    }
}

impl fmt::Debug for GroupCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (remaining, adds) = self.counts();
        f.debug_struct("GroupCounter")
            .field("remaining", &remaining)
            .field("adds", &adds)
            .finish()
    }
}

impl Inspect for GroupCounter {
    fn inspect(&self, name: &str, out: &mut SyncSnapshot) {
        let (remaining, adds) = self.counts();
        out.counters.push(CounterSnapshot {
            name: name.to_string(),
            remaining,
            adds,
            is_zero: self.is_zero(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latch::is_closed_ch;
    use std::time::Duration;

    #[test]
    fn add_then_done_closes_wait_channel() {
        let counter = GroupCounter::new();
        let ch = counter.wait_ch();
        assert!(!counter.is_zero(), "fresh counter is not zero");

        counter.add(2);
        assert!(!counter.done());
        assert_eq!(counter.counts(), (1, 2));
        assert!(!is_closed_ch(&ch));

        assert!(counter.done());
        assert_eq!(counter.counts(), (0, 2));
        assert!(counter.is_zero());
        assert!(is_closed_ch(&ch));
        counter.wait();
        assert_eq!(counter.to_string(), "0(2)");
    }

    #[test]
    fn add_and_subtract_restores_remaining() {
        let counter = GroupCounter::new();
        counter.add(3);
        counter.add(4);
        counter.add(-4);
        assert_eq!(counter.current_count(), 3);
        assert!(!counter.is_zero());
    }

    #[test]
    #[should_panic(expected = "negative count")]
    fn negative_remaining_panics() {
        let counter = GroupCounter::new();
        counter.add(1);
        counter.add(-2);
    }

    #[test]
    #[should_panic(expected = "add after reaching zero")]
    fn add_after_zero_panics() {
        let counter = GroupCounter::new();
        counter.add(1);
        counter.done();
        counter.add(1);
    }

    #[test]
    fn reset_rearms_wait_channel() {
        let counter = GroupCounter::new();
        counter.add(1);
        counter.done();
        let old = counter.wait_ch();
        counter.reset();

        assert_eq!(counter.counts(), (0, 0));
        assert!(!counter.is_zero());
        assert!(is_closed_ch(&old));
        assert!(!is_closed_ch(&counter.wait_ch()));

        counter.add(1);
        assert!(counter.done());
    }

    #[test]
    #[should_panic(expected = "reset with 1 remaining")]
    fn reset_while_busy_panics() {
        let counter = GroupCounter::new();
        counter.add(1);
        counter.reset();
    }

    #[test]
    fn wait_blocks_until_workers_finish() {
        let counter = GroupCounter::new();
        counter.add(4);
        std::thread::scope(|s| {
            for i in 0..4u64 {
                let counter = &counter;
                s.spawn(move || {
                    std::thread::sleep(Duration::from_millis(5 * i));
                    counter.done();
                });
            }
            counter.wait();
            assert_eq!(counter.counts(), (0, 4));
        });
    }
}
