use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use corral_threads::SharedFactory;
use corral_types::SyncSnapshot;

use crate::atomics::AtomicMax;
use crate::config::Config;
use crate::error::Result;
use crate::invoke_timer::{Alert, AlertCallback, InvokeTimer};
use crate::moderator::{Moderator, Ticket};
use crate::once_signal::OnceSignal;
use crate::registry::Inspect;

/// Where an echo-moderator writes its log lines.
pub type LogFn = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct EchoConfig {
    pub parallelism: u64,
    pub latency_threshold: Duration,
    /// Waiting callers above which every new high-water mark is logged.
    pub waiting_threshold: u64,
    pub period: Duration,
    pub label: String,
}

impl EchoConfig {
    pub fn new(label: impl Into<String>, parallelism: u64) -> Self {
        let defaults = Config::default();
        Self {
            parallelism,
            latency_threshold: defaults.slow_threshold,
            waiting_threshold: defaults.waiting_threshold,
            period: defaults.timer_period,
            label: label.into(),
        }
    }
}

/// A [`Moderator`] whose admitted calls are timed by an [`InvokeTimer`].
///
/// Timer alerts and waiting-queue growth are written to the log function.
pub struct EchoModerator {
    label: String,
    moderator: Moderator,
    timer: InvokeTimer,
    waiting: AtomicU64,
    max_waiting: AtomicMax<u64>,
    log: LogFn,
}

fn warn_log() -> LogFn {
    Arc::new(|line: &str| tracing::warn!("{line}"))
}

impl EchoModerator {
    /// `log` defaults to `warn!` events.
    pub fn new(config: EchoConfig, factory: SharedFactory, log: Option<LogFn>) -> Self {
        let log = log.unwrap_or_else(warn_log);

        let timer_log = Arc::clone(&log);
        let label = config.label.clone();
        let callback: AlertCallback = Arc::new(move |alert: &Alert| {
            timer_log(&format!("{label}: {alert}"));
        });

        Self {
            moderator: Moderator::new(config.parallelism),
            timer: InvokeTimer::new(
                callback,
                config.latency_threshold,
                config.parallelism.saturating_add(1),
                config.period,
                factory,
            ),
            waiting: AtomicU64::new(0),
            max_waiting: AtomicMax::with_threshold(config.waiting_threshold.saturating_add(1)),
            label: config.label,
            log,
        }
    }

    /// Run `f` once admitted; admission starts the timed call.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let _ticket = self.admit();
        let _running = self.timer.begin();
        f()
    }

    /// Like [`run`](Self::run), giving up while still queued if `cancel` fires.
    pub fn run_cancellable<R>(&self, cancel: &OnceSignal, f: impl FnOnce() -> R) -> Result<R> {
        let _ticket = match self.moderator.try_ticket() {
            Some(ticket) => ticket,
            None => {
                self.enter_queue();
                let ticket = self.moderator.ticket_cancellable(cancel);
                self.waiting.fetch_sub(1, Ordering::SeqCst);
                ticket?
            }
        };
        let _running = self.timer.begin();
        Ok(f())
    }

    pub fn moderator(&self) -> &Moderator {
        &self.moderator
    }

    pub fn timer(&self) -> &InvokeTimer {
        &self.timer
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn admit(&self) -> Ticket<'_> {
        if let Some(ticket) = self.moderator.try_ticket() {
            return ticket;
        }
        self.enter_queue();
        let ticket = self.moderator.ticket();
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        ticket
    }

    fn enter_queue(&self) {
        let waiting = self.waiting.fetch_add(1, Ordering::SeqCst) + 1;
        if self.max_waiting.observe(waiting) {
            let (age, thread) = self.timer.oldest();
            let thread = thread.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string());
            (self.log)(&format!(
                "{}: {waiting} callers waiting, oldest in flight {:.3}s on thread {thread}",
                self.label,
                age.as_secs_f64()
            ));
        }
    }
}

impl fmt::Debug for EchoModerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EchoModerator")
            .field("label", &self.label)
            .field("moderator", &self.moderator)
            .field("timer", &self.timer)
            .finish()
    }
}

impl Inspect for EchoModerator {
    fn inspect(&self, name: &str, out: &mut SyncSnapshot) {
        self.moderator.inspect(name, out);
        self.timer.inspect(name, out);
    }
}
