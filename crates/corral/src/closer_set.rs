use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result, recover};
use crate::nb_chan::NbChan;
use crate::once_signal::OnceSignal;

/// A resource with a single close operation.
pub trait Close: Send + Sync {
    fn close(&self) -> Result<()>;
}

impl Close for OnceSignal {
    fn close(&self) -> Result<()> {
        self.cancel();
        Ok(())
    }
}

impl<T: Send + 'static> Close for NbChan<T> {
    fn close(&self) -> Result<()> {
        NbChan::close(self);
        Ok(())
    }
}

/// A set of resources closed together.
///
/// Resources are identified by their allocation, so the same `Arc` can only
/// be added once. Every operation runs under one lock; a resource must not
/// touch its own set from `close`.
#[derive(Default)]
pub struct CloserSet {
    closers: Mutex<Vec<Arc<dyn Close>>>,
}

fn same(a: &Arc<dyn Close>, b: &Arc<dyn Close>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn close_one(closer: &Arc<dyn Close>) -> Result<()> {
    recover(|| closer.close()).and_then(|r| r)
}

impl CloserSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when `closer` is already in the set.
    pub fn add(&self, closer: Arc<dyn Close>) -> bool {
        let mut closers = self.closers.lock();
        if closers.iter().any(|c| same(c, &closer)) {
            return false;
        }
        closers.push(closer);
        true
    }

    /// Take `closer` out without closing it.
    pub fn remove(&self, closer: &Arc<dyn Close>) -> bool {
        let mut closers = self.closers.lock();
        let before = closers.len();
        closers.retain(|c| !same(c, closer));
        closers.len() != before
    }

    /// Take `closer` out and close it, whether or not it was in the set.
    pub fn ensure_closed(&self, closer: &Arc<dyn Close>) -> Result<()> {
        let mut closers = self.closers.lock();
        closers.retain(|c| !same(c, closer));
        close_one(closer)
    }

    /// Close everything in insertion order and empty the set.
    ///
    /// Every resource is closed even when earlier ones fail; the failures
    /// come back as one error.
    pub fn close_all(&self) -> Result<()> {
        let mut closers = self.closers.lock();
        let errors: Vec<Error> = closers
            .drain(..)
            .filter_map(|closer| close_one(&closer).err())
            .collect();
        if !errors.is_empty() {
            tracing::debug!(failed = errors.len(), "closer-set close failures");
        }
        match Error::join(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.closers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.closers.lock().is_empty()
    }
}

impl fmt::Debug for CloserSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloserSet").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        id: usize,
        log: Arc<Mutex<Vec<usize>>>,
        fail: bool,
    }

    impl Close for Recorder {
        fn close(&self) -> Result<()> {
            self.log.lock().push(self.id);
            if self.fail {
                return Err(Error::msg(format!("resource {} failed", self.id)));
            }
            Ok(())
        }
    }

    fn recorder(id: usize, log: &Arc<Mutex<Vec<usize>>>, fail: bool) -> Arc<dyn Close> {
        Arc::new(Recorder {
            id,
            log: Arc::clone(log),
            fail,
        })
    }

    #[test]
    fn rejects_duplicates_and_removes() {
        let set = CloserSet::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recorder(1, &log, false);
        assert!(set.add(Arc::clone(&a)));
        assert!(!set.add(Arc::clone(&a)));
        assert_eq!(set.len(), 1);

        assert!(set.remove(&a));
        assert!(!set.remove(&a));
        assert!(set.is_empty());
        assert!(log.lock().is_empty(), "remove must not close");
    }

    #[test]
    fn close_all_aggregates_errors_in_order() {
        let set = CloserSet::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for (id, fail) in [(1, false), (2, true), (3, false), (4, true)] {
            set.add(recorder(id, &log, fail));
        }

        let err = set.close_all().unwrap_err();
        assert_eq!(*log.lock(), vec![1, 2, 3, 4]);
        let messages: Vec<String> = err.errors().iter().map(|e| e.to_string()).collect();
        assert_eq!(messages, vec!["resource 2 failed", "resource 4 failed"]);
        assert!(set.is_empty());
        set.close_all().unwrap();
    }

    #[test]
    fn ensure_closed_removes_then_closes() {
        let set = CloserSet::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recorder(7, &log, false);
        set.add(Arc::clone(&a));
        set.ensure_closed(&a).unwrap();
        assert!(set.is_empty());
        assert_eq!(*log.lock(), vec![7]);
    }

    #[test]
    fn panicking_close_is_captured() {
        struct Bomb(AtomicUsize);
        impl Close for Bomb {
            fn close(&self) -> Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                panic!("close exploded");
            }
        }

        let set = CloserSet::new();
        let bomb = Arc::new(Bomb(AtomicUsize::new(0)));
        set.add(bomb.clone());
        set.add(Arc::new(OnceSignal::new()));
        let err = set.close_all().unwrap_err();
        assert!(err.is_panic());
        assert_eq!(bomb.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closes_primitives() {
        let set = CloserSet::new();
        let signal = Arc::new(OnceSignal::new());
        let chan = Arc::new(NbChan::<u8>::new());
        set.add(signal.clone());
        set.add(chan.clone());
        set.close_all().unwrap();
        assert!(signal.is_done());
        assert!(chan.is_closed());
    }
}
