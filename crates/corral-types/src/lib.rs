//! Shared diagnostic snapshot types for corral.
//!
//! All snapshot types live here so they can be produced by the primitives in
//! `corral`, by the thread registry in `corral-threads`, and consumed by
//! tooling without circular dependencies between the crates.

use facet::Facet;

// ── Moderator snapshot types ─────────────────────────────────────

/// Snapshot of a parallelism moderator.
#[derive(Debug, Clone, Facet)]
pub struct ModeratorSnapshot {
    pub name: String,
    pub parallelism: u64,
    pub held: u64,
    pub waiting: u64,
    pub max_waiting: u64,
    pub acquires: u64,
    pub transfers: u64,
}

// ── Counter snapshot types ───────────────────────────────────────

/// Snapshot of a group counter.
#[derive(Debug, Clone, Facet)]
pub struct CounterSnapshot {
    pub name: String,
    pub remaining: u64,
    pub adds: u64,
    pub is_zero: bool,
}

// ── Non-blocking channel snapshot types ──────────────────────────

/// Lifecycle of the thread that streams an nb-chan's items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum DrainerState {
    /// No thread exists.
    Absent,
    /// A thread exists and is looking for the next item.
    Running,
    /// The thread holds one item and waits for a consumer.
    InSendBlock,
    /// The queue was closed and the thread is gone for good.
    Exited,
}

/// Snapshot of a non-blocking unbounded channel.
#[derive(Debug, Clone, Facet)]
pub struct NbChanSnapshot {
    pub name: String,
    pub unsent: u64,
    pub input_capacity: u64,
    pub output_capacity: u64,
    pub drainer: DrainerState,
    pub end_requested: bool,
    pub closed_now: bool,
    pub is_closed: bool,
}

// ── Timing snapshot types ────────────────────────────────────────

/// A labelled progress point recorded on an invocation.
#[derive(Debug, Clone, Facet)]
pub struct IntervalSnapshot {
    pub label: String,
    pub offset_secs: f64,
}

/// A measured call that has started and not yet stopped.
#[derive(Debug, Clone, Facet)]
pub struct InvocationSnapshot {
    pub id: u64,
    pub label: String,
    pub thread: String,
    pub age_secs: f64,
    pub intervals: Vec<IntervalSnapshot>,
}

/// Snapshot of an invoke-timer.
#[derive(Debug, Clone, Facet)]
pub struct InvokeTimerSnapshot {
    pub name: String,
    pub live: u64,
    pub max_parallelism: u64,
    pub max_latency_secs: f64,
    pub ticker_running: bool,
    pub in_flight: Vec<InvocationSnapshot>,
}

/// Snapshot of a slow-detector.
#[derive(Debug, Clone, Facet)]
pub struct SlowDetectorSnapshot {
    pub name: String,
    pub threshold_secs: f64,
    pub max_secs: Option<f64>,
    pub in_flight: Vec<InvocationSnapshot>,
}

// ── Thread snapshot types ────────────────────────────────────────

/// A live thread spawned through a registering thread factory.
#[derive(Debug, Clone, Facet)]
pub struct ThreadSnapshot {
    pub name: String,
    pub thread: String,
    pub age_secs: f64,
}

// ── Aggregate ────────────────────────────────────────────────────

/// Everything a registry knows about at one point in time.
#[derive(Debug, Clone, Default, Facet)]
pub struct SyncSnapshot {
    pub moderators: Vec<ModeratorSnapshot>,
    pub counters: Vec<CounterSnapshot>,
    pub channels: Vec<NbChanSnapshot>,
    pub timers: Vec<InvokeTimerSnapshot>,
    pub slow_detectors: Vec<SlowDetectorSnapshot>,
    pub threads: Vec<ThreadSnapshot>,
}

impl SyncSnapshot {
    pub fn is_empty(&self) -> bool {
        self.moderators.is_empty()
            && self.counters.is_empty()
            && self.channels.is_empty()
            && self.timers.is_empty()
            && self.slow_detectors.is_empty()
            && self.threads.is_empty()
    }
}
