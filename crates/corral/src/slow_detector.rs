//! Reporting of invocations that run, or ran, longer than a threshold.
//!
//! An [`Invocation`] is started and stopped by the code being measured.
//! Reporting happens in two places: `stop` reports a new duration maximum at
//! or above the threshold, and a periodic ticker reports invocations still
//! running past the threshold, at most once per period each.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, select};
use parking_lot::Mutex;

use corral_threads::{SharedFactory, ThreadIdent};
use corral_types::{IntervalSnapshot, InvocationSnapshot, SlowDetectorSnapshot, SyncSnapshot};

use crate::atomics::AtomicMax;
use crate::config::Config;
use crate::error::recover;
use crate::once_signal::OnceSignal;
use crate::ranking::Ranking;
use crate::registry::Inspect;

/// What a slow-detector callback is told.
#[derive(Debug, Clone)]
pub struct SlowReport {
    pub id: u64,
    pub label: String,
    pub thread: ThreadIdent,
    /// The invocation has stopped; `duration` is final.
    pub did_return: bool,
    pub duration: Duration,
    pub intervals: Vec<(String, Duration)>,
}

impl fmt::Display for SlowReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.did_return { "took" } else { "running for" };
        write!(
            f,
            "{} {state} {:.3}s on thread {}",
            self.label,
            self.duration.as_secs_f64(),
            self.thread
        )?;
        for (label, offset) in &self.intervals {
            write!(f, " {label}@{:.3}s", offset.as_secs_f64())?;
        }
        Ok(())
    }
}

pub type SlowCallback = Arc<dyn Fn(&SlowReport) + Send + Sync>;

fn warn_callback() -> SlowCallback {
    Arc::new(|report: &SlowReport| {
        tracing::warn!(
            id = report.id,
            thread = %report.thread,
            did_return = report.did_return,
            duration_secs = report.duration.as_secs_f64(),
            "slow invocation: {report}"
        );
    })
}

/// Which thread drives the periodic reports of a [`SlowDetector`].
#[derive(Debug, Clone)]
pub enum SlowPolicy {
    /// A ticker thread shared with other detectors.
    Shared(SlowTicker),
    /// A thread of its own, from construction to shutdown.
    Own,
    /// A thread of its own, running only while invocations are in flight.
    ShutdownOnIdle,
}

// ── Shared ticker ────────────────────────────────────────────────

/// One thread ticking any number of detectors.
///
/// The thread starts with the first registered detector and exits once
/// every registered detector is gone or on [`shutdown`](Self::shutdown).
#[derive(Clone)]
pub struct SlowTicker {
    inner: Arc<TickerInner>,
}

struct TickerInner {
    period: Duration,
    factory: SharedFactory,
    state: Mutex<TickerState>,
}

#[derive(Default)]
struct TickerState {
    detectors: Vec<Weak<DetectorInner>>,
    stop: Option<OnceSignal>,
}

impl SlowTicker {
    pub fn new(period: Duration, factory: SharedFactory) -> Self {
        Self {
            inner: Arc::new(TickerInner {
                period: Config::clamp_period(period),
                factory,
                state: Mutex::new(TickerState::default()),
            }),
        }
    }

    /// Detectors still registered and alive.
    pub fn detectors(&self) -> usize {
        self.inner
            .state
            .lock()
            .detectors
            .iter()
            .filter(|d| d.strong_count() > 0)
            .count()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().stop.is_some()
    }

    /// Stop the thread and forget every detector.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.detectors.clear();
        if let Some(stop) = state.stop.take() {
            stop.cancel();
        }
    }

    fn register(&self, detector: &Arc<DetectorInner>) {
        let mut state = self.inner.state.lock();
        state.detectors.retain(|d| d.strong_count() > 0);
        state.detectors.push(Arc::downgrade(detector));
        if state.stop.is_none() {
            let stop = OnceSignal::new();
            self.spawn(stop.ch());
            state.stop = Some(stop);
        }
    }

    fn deregister(&self, detector: &DetectorInner) {
        let mut state = self.inner.state.lock();
        state
            .detectors
            .retain(|d| d.strong_count() > 0 && !std::ptr::eq(d.as_ptr(), detector));
    }

    fn spawn(&self, stop: Receiver<()>) {
        let inner = Arc::downgrade(&self.inner);
        let period = self.inner.period;
        self.inner.factory.spawn(
            "corral-slow-ticker",
            Box::new(move || {
                tracing::debug!("shared slow ticker started");
                let ticks = crossbeam_channel::tick(period);
                loop {
                    select! {
                        recv(ticks) -> _ => {}
                        recv(stop) -> _ => break,
                    }
                    let Some(ticker) = inner.upgrade() else {
                        break;
                    };
                    let detectors: Vec<Arc<DetectorInner>> = {
                        let mut state = ticker.state.lock();
                        state.detectors.retain(|d| d.strong_count() > 0);
                        if state.detectors.is_empty() {
                            state.stop = None;
                            break;
                        }
                        state.detectors.iter().filter_map(Weak::upgrade).collect()
                    };
                    for detector in detectors {
                        detector.check(Instant::now());
                    }
                }
                tracing::debug!("shared slow ticker stopped");
            }),
        );
    }
}

impl fmt::Debug for SlowTicker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlowTicker")
            .field("period", &self.inner.period)
            .field("detectors", &self.detectors())
            .finish()
    }
}

// ── Detector ─────────────────────────────────────────────────────

pub struct SlowDetector {
    inner: Arc<DetectorInner>,
}

struct DetectorInner {
    policy: SlowPolicy,
    callback: SlowCallback,
    threshold: Duration,
    period: Duration,
    factory: SharedFactory,
    next_id: AtomicU64,
    in_flight: Ranking<InvocationState, (Instant, u64)>,
    /// Nanoseconds.
    max: AtomicMax<u64>,
    /// Stop signal of the detector's own thread, if running.
    own: Mutex<Option<OnceSignal>>,
    shut_down: AtomicBool,
}

struct InvocationState {
    id: u64,
    label: String,
    thread: ThreadIdent,
    t0: Instant,
    intervals: Mutex<Vec<(String, Instant)>>,
    last_report: Mutex<Option<Instant>>,
}

impl InvocationState {
    fn intervals(&self) -> Vec<(String, Duration)> {
        self.intervals
            .lock()
            .iter()
            .map(|(label, at)| (label.clone(), at.saturating_duration_since(self.t0)))
            .collect()
    }

    fn report(&self, did_return: bool, duration: Duration) -> SlowReport {
        SlowReport {
            id: self.id,
            label: self.label.clone(),
            thread: self.thread,
            did_return,
            duration,
            intervals: self.intervals(),
        }
    }
}

impl SlowDetector {
    /// `callback` defaults to `warn!` events; `threshold` and `period` to
    /// [`Config::default`].
    pub fn new(
        policy: SlowPolicy,
        callback: Option<SlowCallback>,
        threshold: Option<Duration>,
        period: Option<Duration>,
        factory: SharedFactory,
    ) -> Self {
        let defaults = Config::default();
        let inner = Arc::new(DetectorInner {
            policy,
            callback: callback.unwrap_or_else(warn_callback),
            threshold: threshold.unwrap_or(defaults.slow_threshold),
            period: Config::clamp_period(period.unwrap_or(defaults.slow_period)),
            factory,
            next_id: AtomicU64::new(1),
            in_flight: Ranking::new(|state: &InvocationState| (state.t0, state.id)),
            max: AtomicMax::new(),
            own: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });
        match &inner.policy {
            SlowPolicy::Shared(ticker) => ticker.register(&inner),
            SlowPolicy::Own => inner.start_own(),
            SlowPolicy::ShutdownOnIdle => {}
        }
        Self { inner }
    }

    pub fn start(&self, label: impl Into<String>) -> Invocation {
        self.start_at(label, Instant::now())
    }

    /// Start an invocation that began at `t0`.
    pub fn start_at(&self, label: impl Into<String>, t0: Instant) -> Invocation {
        let state = Arc::new(InvocationState {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            label: label.into(),
            thread: ThreadIdent::current(),
            t0,
            intervals: Mutex::new(Vec::new()),
            last_report: Mutex::new(None),
        });
        self.inner.in_flight.add_or_update(&state);
        if matches!(self.inner.policy, SlowPolicy::ShutdownOnIdle) {
            self.inner.start_own();
        }
        Invocation {
            state,
            detector: Arc::clone(&self.inner),
            stopped: false,
        }
    }

    /// Longest stopped invocation at or above the threshold.
    pub fn max(&self) -> Option<Duration> {
        self.inner.max.get().map(Duration::from_nanos)
    }

    pub fn threshold(&self) -> Duration {
        self.inner.threshold
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// The detector's own thread is running.
    pub fn is_ticking(&self) -> bool {
        self.inner.own.lock().is_some()
    }

    /// Stop periodic reporting. Invocations can still be started and stopped.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let SlowPolicy::Shared(ticker) = &self.inner.policy {
            ticker.deregister(&self.inner);
        }
        self.inner.stop_own();
        tracing::debug!(in_flight = self.in_flight(), "slow-detector shut down");
    }
}

impl Drop for SlowDetector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl DetectorInner {
    fn start_own(self: &Arc<Self>) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let mut own = self.own.lock();
        if own.is_some() {
            return;
        }
        let stop = OnceSignal::new();
        let ch = stop.ch();
        *own = Some(stop);

        let weak = Arc::downgrade(self);
        let period = self.period;
        self.factory.spawn(
            "corral-slow-detector",
            Box::new(move || {
                let ticks = crossbeam_channel::tick(period);
                loop {
                    select! {
                        recv(ticks) -> _ => {}
                        recv(ch) -> _ => break,
                    }
                    match weak.upgrade() {
                        Some(detector) => detector.check(Instant::now()),
                        None => break,
                    }
                }
                tracing::trace!("slow-detector thread stopped");
            }),
        );
    }

    fn stop_own(&self) {
        if let Some(stop) = self.own.lock().take() {
            stop.cancel();
        }
    }

    /// Checked under `own` so a concurrent `start_own` either keeps this
    /// thread alive or spawns a fresh one after it is taken.
    fn stop_own_if_idle(&self) {
        let mut own = self.own.lock();
        if !self.in_flight.is_empty() {
            return;
        }
        if let Some(stop) = own.take() {
            stop.cancel();
        }
    }

    /// Report invocations running past the threshold, oldest first.
    fn check(&self, now: Instant) {
        for state in self.in_flight.list(0) {
            let age = now.saturating_duration_since(state.t0);
            if age < self.threshold {
                // the rest started later
                break;
            }
            {
                let mut last = state.last_report.lock();
                if last.is_some_and(|at| now.saturating_duration_since(at) < self.period) {
                    continue;
                }
                *last = Some(now);
            }
            self.fire(&state.report(false, age));
        }
    }

    fn finish(&self, state: &Arc<InvocationState>, at: Instant) -> Duration {
        let duration = at.saturating_duration_since(state.t0);
        self.in_flight.remove(state);
        if matches!(self.policy, SlowPolicy::ShutdownOnIdle) {
            self.stop_own_if_idle();
        }
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        if duration >= self.threshold && self.max.observe(nanos) {
            self.fire(&state.report(true, duration));
        }
        duration
    }

    fn fire(&self, report: &SlowReport) {
        if let Err(err) = recover(|| (self.callback)(report)) {
            tracing::error!(%err, label = %report.label, "slow-detector callback panicked");
        }
    }
}

impl fmt::Debug for SlowDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlowDetector")
            .field("policy", &self.inner.policy)
            .field("threshold", &self.inner.threshold)
            .field("in_flight", &self.in_flight())
            .field("max", &self.max())
            .finish()
    }
}

impl Inspect for SlowDetector {
    fn inspect(&self, name: &str, out: &mut SyncSnapshot) {
        let now = Instant::now();
        out.slow_detectors.push(SlowDetectorSnapshot {
            name: name.to_string(),
            threshold_secs: self.inner.threshold.as_secs_f64(),
            max_secs: self.max().map(|d| d.as_secs_f64()),
            in_flight: self
                .inner
                .in_flight
                .list(0)
                .iter()
                .map(|state| InvocationSnapshot {
                    id: state.id,
                    label: state.label.clone(),
                    thread: state.thread.to_string(),
                    age_secs: now.saturating_duration_since(state.t0).as_secs_f64(),
                    intervals: state
                        .intervals()
                        .into_iter()
                        .map(|(label, offset)| IntervalSnapshot {
                            label,
                            offset_secs: offset.as_secs_f64(),
                        })
                        .collect(),
                })
                .collect(),
        });
    }
}

// ── Invocation ───────────────────────────────────────────────────

/// A measured piece of work, stopped explicitly or on drop.
pub struct Invocation {
    state: Arc<InvocationState>,
    detector: Arc<DetectorInner>,
    stopped: bool,
}

impl Invocation {
    /// Record a labelled progress point now.
    pub fn interval(&self, label: impl Into<String>) {
        self.interval_at(label, Instant::now());
    }

    pub fn interval_at(&self, label: impl Into<String>, at: Instant) {
        self.state.intervals.lock().push((label.into(), at));
    }

    /// Stop now; returns the duration.
    pub fn stop(self) -> Duration {
        self.stop_at(Instant::now())
    }

    pub fn stop_at(mut self, at: Instant) -> Duration {
        self.stopped = true;
        self.detector.finish(&self.state, at)
    }

    pub fn age(&self) -> Duration {
        self.state.t0.elapsed()
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn label(&self) -> &str {
        &self.state.label
    }

    pub fn thread(&self) -> ThreadIdent {
        self.state.thread
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        if !self.stopped {
            self.detector.finish(&self.state, Instant::now());
        }
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("id", &self.state.id)
            .field("label", &self.state.label)
            .field("thread", &self.state.thread)
            .field("age", &self.age())
            .finish()
    }
}
