use std::sync::Arc;

use corral::{GroupCounter, Moderator, OnceSignal, SyncSnapshot};

use super::{tracked_registry, wait_until};

const WAITERS: u64 = 3;

/// One caller holds the only ticket while others queue behind it.
pub fn run() -> Result<SyncSnapshot, String> {
    let (registry, factory) = tracked_registry();

    let gate = Arc::new(Moderator::new(1));
    let finished = Arc::new(GroupCounter::new());
    registry.register("demo.api_gate", &gate);
    registry.register("demo.callers", &finished);

    let release = Arc::new(OnceSignal::new());
    finished.add(WAITERS as i64 + 1);

    {
        let gate = Arc::clone(&gate);
        let release = Arc::clone(&release);
        let finished = Arc::clone(&finished);
        factory.spawn(
            "permit_holder",
            Box::new(move || {
                let ticket = gate.ticket();
                tracing::info!("permit_holder took the only ticket and sits on it");
                release.wait();
                drop(ticket);
                finished.done();
            }),
        );
    }
    wait_until("the holder to take the ticket", || gate.status().held == 1)?;

    for i in 0..WAITERS {
        let gate = Arc::clone(&gate);
        let finished = Arc::clone(&finished);
        factory.spawn(
            &format!("permit_waiter_{i}"),
            Box::new(move || {
                let _ticket = gate.ticket();
                finished.done();
            }),
        );
    }
    wait_until("the waiters to queue", || gate.waiting() == WAITERS)?;

    let snapshot = registry.snapshot();
    tracing::info!(status = %gate, callers = %finished, "gate starved");

    release.cancel();
    finished.wait();
    tracing::info!(status = %gate, "gate drained");
    Ok(snapshot)
}
