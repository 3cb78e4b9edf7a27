use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, Location};
use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by the corral primitives.
///
/// `Clone` so that a single outcome (a future's error, a cancellation) can be
/// handed to every thread observing it.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The operation was interrupted by a cancel signal.
    #[error("cancelled")]
    Cancelled,

    /// The channel or queue has been closed.
    #[error("closed")]
    Closed,

    /// User code panicked inside a task boundary.
    #[error("panic at {location}: {message}")]
    Panicked { message: String, location: String },

    /// An error returned by user code.
    #[error("{0}")]
    Other(Arc<dyn std::error::Error + Send + Sync>),

    /// Several errors collected while closing a group of resources.
    #[error("{}", format_many(.0))]
    Multiple(Vec<Error>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn format_many(errors: &[Error]) -> String {
    match errors {
        [] => "no errors".to_string(),
        [only] => only.to_string(),
        [first, rest @ ..] => format!("{first} (and {} more)", rest.len()),
    }
}

impl Error {
    pub fn other(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Other(Arc::new(err))
    }

    /// A plain-text error from user code.
    pub fn msg(message: impl fmt::Display) -> Self {
        Error::Other(Arc::new(Message(message.to_string())))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Error::Panicked { .. })
    }

    /// Fold a list of errors into one: `None` when empty, the error itself
    /// when alone, `Multiple` otherwise.
    pub fn join(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Multiple(errors)),
        }
    }

    /// Every leaf error, with `Multiple` flattened.
    pub fn errors(&self) -> Vec<&Error> {
        match self {
            Error::Multiple(errors) => errors.iter().flat_map(Error::errors).collect(),
            other => vec![other],
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>, location: &Location<'_>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Error::Panicked {
            message,
            location: location.to_string(),
        }
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}

/// Run `f` at a task boundary, turning a panic into [`Error::Panicked`]
/// tagged with the caller's location.
#[track_caller]
pub fn recover<R>(f: impl FnOnce() -> R) -> Result<R> {
    let location = Location::caller();
    std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let err = Error::from_panic(payload, location);
        tracing::debug!(%err, "recovered panic at task boundary");
        err
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recover_tags_panic_with_location() {
        let err = recover(|| -> u32 { panic!("boom") }).unwrap_err();
        match &err {
            Error::Panicked { message, location } => {
                assert_eq!(message, "boom");
                assert!(location.contains("error.rs"), "location: {location}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_panic());
    }

    #[test]
    fn recover_passes_values_through() {
        assert_eq!(recover(|| 7).unwrap(), 7);
    }

    #[test]
    fn join_folds_errors() {
        assert!(Error::join(Vec::new()).is_none());
        assert!(Error::join(vec![Error::Closed]).unwrap().is_closed());

        let joined = Error::join(vec![Error::Closed, Error::msg("disk gone"), Error::Cancelled])
            .unwrap();
        assert_eq!(joined.to_string(), "closed (and 2 more)");
        assert_eq!(joined.errors().len(), 3);
    }
}
