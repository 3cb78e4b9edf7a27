use std::sync::Arc;
use std::time::Duration;

use corral::{DrainerPolicy, DrainerState, NbChan, SyncSnapshot};

use super::{tracked_registry, wait_until};

const SENT: u32 = 1_000;
const CONSUMED: usize = 10;

/// A stream consumer stops reading and leaves the queue backed up.
pub fn run() -> Result<SyncSnapshot, String> {
    let (registry, factory) = tracked_registry();

    let queue = Arc::new(NbChan::with_policy(DrainerPolicy::OnDemand, factory));
    registry.register("demo.events", &queue);

    let sent = queue
        .send_many(0..SENT)
        .map_err(|e| format!("send failed: {e}"))?;
    let stream = queue.ch();

    let mut consumed = Vec::with_capacity(CONSUMED);
    for _ in 0..CONSUMED {
        let event = stream
            .recv_timeout(Duration::from_secs(5))
            .map_err(|e| format!("stream stalled early: {e}"))?;
        consumed.push(event);
    }
    tracing::info!(sent, consumed = consumed.len(), "consumer went away");

    wait_until("the drainer to block", || {
        queue.drainer_state() == DrainerState::InSendBlock
    })?;
    let snapshot = registry.snapshot();
    tracing::info!(backlog = queue.count(), "queue backed up");

    queue.close_now();
    wait_until("the drainer to exit", || {
        queue.drainer_state() == DrainerState::Exited
    })?;
    Ok(snapshot)
}
