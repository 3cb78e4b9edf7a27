use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use corral::{GroupCounter, SyncSnapshot, WinOrWaitStrategy, WinOrWaiter};

use super::{tracked_registry, wait_until};

const CALLERS: u64 = 8;

/// Many callers want a fresh config; only a few reloads actually run.
pub fn run() -> Result<SyncSnapshot, String> {
    let (registry, factory) = tracked_registry();

    let reloads = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&reloads);
    let config = Arc::new(WinOrWaiter::new(
        WinOrWaitStrategy::MustBeLater,
        move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            std::thread::sleep(Duration::from_millis(50));
            Ok(format!("config v{n}"))
        },
        None,
    ));

    let callers = Arc::new(GroupCounter::new());
    registry.register("demo.config_callers", &callers);
    callers.add(CALLERS as i64);

    for i in 0..CALLERS {
        let config = Arc::clone(&config);
        let callers = Arc::clone(&callers);
        factory.spawn(
            &format!("config_reader_{i}"),
            Box::new(move || {
                match config.win_or_wait() {
                    Ok(value) => tracing::debug!(reader = i, %value, "got config"),
                    Err(err) => tracing::warn!(reader = i, %err, "config reload failed"),
                }
                callers.done();
            }),
        );
    }

    wait_until("a reload to start", || config.is_calculating())?;
    let snapshot = registry.snapshot();

    callers.wait();
    tracing::info!(
        callers = CALLERS,
        reloads = reloads.load(Ordering::SeqCst),
        "crowd served"
    );
    Ok(snapshot)
}
