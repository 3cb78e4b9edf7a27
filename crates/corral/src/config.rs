//! Tunable defaults shared by the primitives.

use std::time::Duration;

/// Smallest tick period a timer thread will run at.
pub const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Tick period of the invoke-timer thread.
    pub timer_period: Duration,
    /// Age after which a slow-detector reports an invocation.
    pub slow_threshold: Duration,
    /// Tick period of slow-detector threads, also the per-invocation report throttle.
    pub slow_period: Duration,
    /// Number of waiting callers above which an echo-moderator starts logging.
    pub waiting_threshold: u64,
    /// How often a condition-variable wait re-checks its cancel signal.
    pub cancel_poll: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timer_period: Duration::from_secs(1),
            slow_threshold: Duration::from_secs(1),
            slow_period: Duration::from_secs(1),
            waiting_threshold: 10,
            cancel_poll: Duration::from_millis(10),
        }
    }
}

impl Config {
    /// Defaults overlaid with `CORRAL_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(ms) = parse_var(&lookup, "CORRAL_TIMER_PERIOD_MS") {
            config.timer_period = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "CORRAL_SLOW_THRESHOLD_MS") {
            config.slow_threshold = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "CORRAL_SLOW_PERIOD_MS") {
            config.slow_period = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var(&lookup, "CORRAL_WAITING_THRESHOLD") {
            config.waiting_threshold = n;
        }
        config
    }

    /// The timer period, clamped to [`MIN_TIMER_PERIOD`].
    pub fn clamp_period(period: Duration) -> Duration {
        period.max(MIN_TIMER_PERIOD)
    }
}

fn parse_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(key, value = %raw, %err, "ignoring unparsable config value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn lookup_overlays_defaults() {
        let vars: HashMap<&str, &str> = [
            ("CORRAL_TIMER_PERIOD_MS", "250"),
            ("CORRAL_WAITING_THRESHOLD", " 3 "),
            ("CORRAL_SLOW_PERIOD_MS", "soon"),
        ]
        .into_iter()
        .collect();

        let config = Config::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.timer_period, Duration::from_millis(250));
        assert_eq!(config.waiting_threshold, 3);
        assert_eq!(config.slow_period, Config::default().slow_period);
        assert_eq!(config.slow_threshold, Config::default().slow_threshold);
    }

    #[test]
    fn period_is_clamped() {
        assert_eq!(Config::clamp_period(Duration::ZERO), MIN_TIMER_PERIOD);
        assert_eq!(
            Config::clamp_period(Duration::from_secs(2)),
            Duration::from_secs(2)
        );
    }
}
