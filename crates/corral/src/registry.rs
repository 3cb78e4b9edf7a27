//! Opt-in diagnostics: named weak references to live primitives.
//!
//! Nothing is registered implicitly. A caller that wants a primitive to show
//! up in snapshots registers its `Arc` under a name; the registry only keeps
//! a `Weak`, so registration never extends a primitive's lifetime and dead
//! entries are pruned on the next register or snapshot.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use corral_threads::StdThreads;
use corral_types::SyncSnapshot;

/// A primitive that can describe itself in a [`SyncSnapshot`].
pub trait Inspect: Send + Sync {
    fn inspect(&self, name: &str, out: &mut SyncSnapshot);
}

struct Entry {
    name: String,
    target: Weak<dyn Inspect>,
}

#[derive(Default)]
pub struct Registry {
    entries: Mutex<Vec<Entry>>,
    threads: Mutex<Option<StdThreads>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `target` under `name` until it is dropped.
    pub fn register<P: Inspect + 'static>(&self, name: &str, target: &Arc<P>) {
        let target: Arc<dyn Inspect> = target.clone();
        let mut entries = self.entries.lock();
        entries.retain(|e| e.target.strong_count() > 0);
        entries.push(Entry {
            name: name.to_string(),
            target: Arc::downgrade(&target),
        });
    }

    /// Include the live threads of `threads` in every snapshot.
    pub fn track_threads(&self, threads: &StdThreads) {
        *self.threads.lock() = Some(threads.clone());
    }

    /// Registered primitives still alive.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.target.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        let live: Vec<(String, Arc<dyn Inspect>)> = {
            let mut entries = self.entries.lock();
            entries.retain(|e| e.target.strong_count() > 0);
            entries
                .iter()
                .filter_map(|e| e.target.upgrade().map(|t| (e.name.clone(), t)))
                .collect()
        };

        // inspect outside the registry lock; primitives take their own locks
        let mut out = SyncSnapshot::default();
        for (name, target) in &live {
            target.inspect(name, &mut out);
        }
        if let Some(threads) = self.threads.lock().as_ref() {
            out.threads = threads.snapshot();
        }
        out
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("len", &self.len()).finish()
    }
}
