use std::fmt;
use std::sync::{Arc, OnceLock};

use crossbeam_channel::Receiver;

use corral_threads::ThreadFactory;

use crate::error::{Result, recover};
use crate::latch::Latch;

/// A value written once and read by any number of threads.
///
/// Readers block in [`result`](Self::result) until [`end`](Self::end) is
/// called. Every reader observes the same outcome.
pub struct Future<T> {
    outcome: OnceLock<Result<T>>,
    latch: Latch,
}

impl<T> Future<T> {
    pub fn new() -> Self {
        Self {
            outcome: OnceLock::new(),
            latch: Latch::new(),
        }
    }

    /// Record the outcome and wake every reader.
    ///
    /// # Panics
    ///
    /// When the outcome was already recorded.
    #[track_caller]
    pub fn end(&self, outcome: Result<T>) {
        if self.outcome.set(outcome).is_err() {
            panic!("future: end called twice");
        }
        self.latch.close();
    }

    pub fn is_completed(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// Block until the outcome is recorded.
    pub fn result(&self) -> Result<&T, &crate::Error> {
        self.outcome.wait().as_ref()
    }

    /// The outcome if already recorded.
    pub fn try_result(&self) -> Option<Result<&T, &crate::Error>> {
        self.outcome.get().map(Result::as_ref)
    }

    /// Channel that closes once the outcome is recorded.
    pub fn ch(&self) -> Receiver<()> {
        self.latch.ch()
    }
}

impl<T> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("outcome", &self.outcome.get())
            .finish()
    }
}

/// Compute a future on a thread from `factory`.
///
/// A panic in `resolver` is recorded as [`Error::Panicked`](crate::Error::Panicked).
pub fn promise<T, F>(resolver: F, factory: &dyn ThreadFactory) -> Arc<Future<T>>
where
    T: Send + Sync + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let future = Arc::new(Future::new());
    let worker = Arc::clone(&future);
    factory.spawn(
        "corral-promise",
        Box::new(move || {
            let outcome = recover(resolver).and_then(|r| r);
            if let Err(err) = &outcome {
                tracing::debug!(%err, "promise resolved with error");
            }
            worker.end(outcome);
        }),
    );
    future
}
