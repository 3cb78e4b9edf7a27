use std::sync::Arc;
use std::time::{Duration, Instant};

use corral::{Registry, SharedFactory, StdThreads};

pub mod moderator_starvation;
pub mod nb_chan_backlog;
pub mod slow_invocation;
pub mod win_or_waiter_crowd;

/// A registry that also lists the threads spawned through the returned factory.
fn tracked_registry() -> (Registry, SharedFactory) {
    let threads = StdThreads::new();
    let registry = Registry::new();
    registry.track_threads(&threads);
    (registry, Arc::new(threads))
}

/// Poll `cond` until it holds, for at most five seconds.
fn wait_until(what: &str, mut cond: impl FnMut() -> bool) -> Result<(), String> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() >= deadline {
            return Err(format!("timed out waiting for {what}"));
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    Ok(())
}
