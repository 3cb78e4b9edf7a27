//! Latency and parallelism tracking around synchronous calls.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, select};
use parking_lot::Mutex;

use corral_threads::{SharedFactory, ThreadIdent};
use corral_types::{InvocationSnapshot, InvokeTimerSnapshot, SyncSnapshot};

use crate::atomics::AtomicMax;
use crate::config::Config;
use crate::error::recover;
use crate::once_signal::OnceSignal;
use crate::registry::Inspect;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertReason {
    /// More calls in flight at once than ever before.
    Parallelism,
    /// A call took, or is taking, longer than ever before.
    Latency,
}

impl fmt::Display for AlertReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertReason::Parallelism => f.write_str("parallelism"),
            AlertReason::Latency => f.write_str("latency"),
        }
    }
}

/// What an [`InvokeTimer`] callback is told.
#[derive(Debug, Clone)]
pub struct Alert {
    pub reason: AlertReason,
    pub max_parallelism: u64,
    /// New latency maximum, or the age of the call still in progress.
    pub latency: Duration,
    pub thread: Option<ThreadIdent>,
    /// The call has not returned yet.
    pub in_progress: bool,
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: max parallelism {} latency {:.3}s",
            self.reason,
            self.max_parallelism,
            self.latency.as_secs_f64()
        )?;
        if let Some(thread) = self.thread {
            write!(f, " thread {thread}")?;
        }
        if self.in_progress {
            f.write_str(" (in progress)")?;
        }
        Ok(())
    }
}

pub type AlertCallback = Arc<dyn Fn(&Alert) + Send + Sync>;

/// Callback that logs every alert as a `warn!` event.
pub fn log_alerts() -> AlertCallback {
    Arc::new(|alert: &Alert| {
        tracing::warn!(
            reason = %alert.reason,
            max_parallelism = alert.max_parallelism,
            latency_secs = alert.latency.as_secs_f64(),
            thread = ?alert.thread,
            in_progress = alert.in_progress,
            "invoke-timer alert"
        );
    })
}

/// Measures calls made through [`run`](Self::run).
///
/// Keeps the historical maxima of concurrent calls and of call duration,
/// alerting on every new maximum at or above its threshold. While at least
/// one call is in flight a ticker thread watches the oldest one and alerts
/// while it runs past the latency maximum.
pub struct InvokeTimer {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    callback: AlertCallback,
    latency_threshold: Duration,
    parallelism_threshold: u64,
    period: Duration,
    factory: SharedFactory,
    next_id: AtomicU64,
    max_parallelism: AtomicMax<u64>,
    /// Nanoseconds.
    max_latency: AtomicMax<u64>,
    state: Mutex<TimerState>,
}

#[derive(Default)]
struct TimerState {
    in_flight: BTreeMap<(Instant, u64), InFlight>,
    /// Present while the ticker thread runs; dropping it stops the thread.
    ticker: Option<OnceSignal>,
}

struct InFlight {
    thread: ThreadIdent,
    label: String,
}

/// A measured call; it ends when dropped.
pub(crate) struct Running<'a> {
    inner: &'a Arc<TimerInner>,
    key: (Instant, u64),
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.inner.finish(self.key);
    }
}

impl InvokeTimer {
    pub fn new(
        callback: AlertCallback,
        latency_threshold: Duration,
        parallelism_threshold: u64,
        period: Duration,
        factory: SharedFactory,
    ) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                callback,
                latency_threshold,
                parallelism_threshold,
                period: Config::clamp_period(period),
                factory,
                next_id: AtomicU64::new(1),
                max_parallelism: AtomicMax::new(),
                max_latency: AtomicMax::new(),
                state: Mutex::new(TimerState::default()),
            }),
        }
    }

    /// Run `f` as one measured call.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let _running = self.begin();
        f()
    }

    /// Start a measured call that ends when the guard drops.
    pub(crate) fn begin(&self) -> Running<'_> {
        let key = self.inner.start();
        Running {
            inner: &self.inner,
            key,
        }
    }

    /// Age of the oldest call in flight and its thread, never less than
    /// the latency maximum.
    pub fn oldest(&self) -> (Duration, Option<ThreadIdent>) {
        let max = self.max_latency();
        match self.inner.oldest() {
            Some((age, thread)) => (age.max(max), Some(thread)),
            None => (max, None),
        }
    }

    /// Calls currently in flight.
    pub fn live(&self) -> u64 {
        self.inner.state.lock().in_flight.len() as u64
    }

    pub fn max_parallelism(&self) -> u64 {
        self.inner.max_parallelism.get().unwrap_or(0)
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_nanos(self.inner.max_latency.get().unwrap_or(0))
    }

    pub fn is_ticking(&self) -> bool {
        self.inner.state.lock().ticker.is_some()
    }
}

impl TimerInner {
    fn start(self: &Arc<Self>) -> (Instant, u64) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = (Instant::now(), id);
        let live = {
            let mut state = self.state.lock();
            state.in_flight.insert(
                key,
                InFlight {
                    thread: ThreadIdent::current(),
                    label: std::thread::current().name().unwrap_or_default().to_string(),
                },
            );
            if state.ticker.is_none() {
                let signal = OnceSignal::new();
                self.spawn_ticker(signal.ch());
                state.ticker = Some(signal);
            }
            state.in_flight.len() as u64
        };

        if self.max_parallelism.observe(live) && live >= self.parallelism_threshold {
            self.fire(Alert {
                reason: AlertReason::Parallelism,
                max_parallelism: live,
                latency: self.latency_max(),
                thread: Some(ThreadIdent::current()),
                in_progress: true,
            });
        }
        key
    }

    fn finish(&self, key: (Instant, u64)) {
        let latency = key.0.elapsed();
        {
            let mut state = self.state.lock();
            state.in_flight.remove(&key);
            if state.in_flight.is_empty() {
                if let Some(ticker) = state.ticker.take() {
                    ticker.cancel();
                }
            }
        }

        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        if self.max_latency.observe(nanos) && latency >= self.latency_threshold {
            self.fire(Alert {
                reason: AlertReason::Latency,
                max_parallelism: self.max_parallelism.get().unwrap_or(0),
                latency,
                thread: Some(ThreadIdent::current()),
                in_progress: false,
            });
        }
    }

    fn latency_max(&self) -> Duration {
        Duration::from_nanos(self.max_latency.get().unwrap_or(0))
    }

    fn oldest(&self) -> Option<(Duration, ThreadIdent)> {
        let state = self.state.lock();
        state
            .in_flight
            .iter()
            .next()
            .map(|((t0, _), call)| (t0.elapsed(), call.thread))
    }

    /// One ticker pass: alert while the oldest call runs past the maximum.
    fn check_progress(&self) {
        let Some((age, thread)) = self.oldest() else {
            return;
        };
        if age > self.latency_max() && age >= self.latency_threshold {
            self.fire(Alert {
                reason: AlertReason::Latency,
                max_parallelism: self.max_parallelism.get().unwrap_or(0),
                latency: age,
                thread: Some(thread),
                in_progress: true,
            });
        }
    }

    fn fire(&self, alert: Alert) {
        if let Err(err) = recover(|| (self.callback)(&alert)) {
            tracing::error!(%err, %alert, "invoke-timer callback panicked");
        }
    }

    fn spawn_ticker(self: &Arc<Self>, stop: Receiver<()>) {
        let weak: Weak<TimerInner> = Arc::downgrade(self);
        let period = self.period;
        self.factory.spawn(
            "corral-invoke-timer",
            Box::new(move || {
                tracing::debug!(period_ms = period.as_millis() as u64, "invoke-timer ticker started");
                let ticks = crossbeam_channel::tick(period);
                loop {
                    select! {
                        recv(ticks) -> _ => {}
                        recv(stop) -> _ => break,
                    }
                    match weak.upgrade() {
                        Some(inner) => inner.check_progress(),
                        None => break,
                    }
                }
                tracing::debug!("invoke-timer ticker stopped");
            }),
        );
    }

    fn snapshot(&self, name: &str) -> InvokeTimerSnapshot {
        let state = self.state.lock();
        let now = Instant::now();
        InvokeTimerSnapshot {
            name: name.to_string(),
            live: state.in_flight.len() as u64,
            max_parallelism: self.max_parallelism.get().unwrap_or(0),
            max_latency_secs: self.latency_max().as_secs_f64(),
            ticker_running: state.ticker.is_some(),
            in_flight: state
                .in_flight
                .iter()
                .map(|((t0, id), call)| InvocationSnapshot {
                    id: *id,
                    label: call.label.clone(),
                    thread: call.thread.to_string(),
                    age_secs: now.duration_since(*t0).as_secs_f64(),
                    intervals: Vec::new(),
                })
                .collect(),
        }
    }
}

impl fmt::Debug for InvokeTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvokeTimer")
            .field("live", &self.live())
            .field("max_parallelism", &self.max_parallelism())
            .field("max_latency", &self.max_latency())
            .finish()
    }
}

impl Inspect for InvokeTimer {
    fn inspect(&self, name: &str, out: &mut SyncSnapshot) {
        out.timers.push(self.inner.snapshot(name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_threads::StdThreads;
    use std::sync::Barrier;

    fn recording() -> (AlertCallback, Arc<Mutex<Vec<Alert>>>) {
        let alerts = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&alerts);
        let callback: AlertCallback = Arc::new(move |alert: &Alert| sink.lock().push(alert.clone()));
        (callback, alerts)
    }

    #[test]
    fn records_parallelism_supremum() {
        let (callback, alerts) = recording();
        let timer = InvokeTimer::new(
            callback,
            Duration::from_secs(60),
            1,
            Duration::from_secs(60),
            StdThreads::shared(),
        );
        let barrier = Barrier::new(4);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| timer.run(|| barrier.wait()));
            }
        });

        assert_eq!(timer.max_parallelism(), 4);
        assert_eq!(timer.live(), 0);
        let alerts = alerts.lock();
        let reported: Vec<u64> = alerts
            .iter()
            .filter(|a| a.reason == AlertReason::Parallelism)
            .map(|a| a.max_parallelism)
            .collect();
        assert!(reported.contains(&4), "reported {reported:?}");
        assert!(reported.iter().all(|n| *n <= 4));
    }

    #[test]
    fn latency_max_tracks_slowest_call() {
        let (callback, alerts) = recording();
        let timer = InvokeTimer::new(
            callback,
            Duration::ZERO,
            u64::MAX,
            Duration::from_secs(60),
            StdThreads::shared(),
        );

        timer.run(|| std::thread::sleep(Duration::from_millis(20)));
        timer.run(|| ());

        assert!(timer.max_latency() >= Duration::from_millis(20));
        let latency: Vec<_> = alerts
            .lock()
            .iter()
            .filter(|a| a.reason == AlertReason::Latency && !a.in_progress)
            .cloned()
            .collect();
        assert_eq!(latency.len(), 1);
        assert_eq!(latency[0].thread, Some(ThreadIdent::current()));
    }

    #[test]
    fn ticker_reports_call_in_progress() {
        let (callback, alerts) = recording();
        let timer = InvokeTimer::new(
            callback,
            Duration::from_millis(10),
            u64::MAX,
            Duration::from_millis(5),
            StdThreads::shared(),
        );

        let value = timer.run(|| {
            assert!(timer.is_ticking());
            let (age, thread) = timer.oldest();
            assert_eq!(thread, Some(ThreadIdent::current()));
            assert!(age < Duration::from_secs(1));
            std::thread::sleep(Duration::from_millis(80));
            7
        });
        assert_eq!(value, 7);
        assert!(!timer.is_ticking());

        let alerts = alerts.lock();
        assert!(
            alerts
                .iter()
                .any(|a| a.reason == AlertReason::Latency && a.in_progress),
            "no progressive alert in {alerts:?}"
        );
    }

    #[test]
    fn panicking_call_still_ends() {
        let timer = InvokeTimer::new(
            log_alerts(),
            Duration::from_secs(60),
            u64::MAX,
            Duration::from_secs(60),
            StdThreads::shared(),
        );
        let outcome = recover(|| timer.run(|| -> u32 { panic!("inside") }));
        assert!(outcome.unwrap_err().is_panic());
        assert_eq!(timer.live(), 0);
        assert!(!timer.is_ticking());
        assert_eq!(timer.oldest().1, None);
    }

    #[test]
    fn snapshot_lists_in_flight_calls() {
        let timer = InvokeTimer::new(
            log_alerts(),
            Duration::from_secs(60),
            u64::MAX,
            Duration::from_secs(60),
            StdThreads::shared(),
        );
        timer.run(|| {
            let mut out = SyncSnapshot::default();
            timer.inspect("calls", &mut out);
            let snap = &out.timers[0];
            assert_eq!(snap.live, 1);
            assert!(snap.ticker_running);
            assert_eq!(snap.in_flight[0].thread, ThreadIdent::current().to_string());
        });
    }
}
