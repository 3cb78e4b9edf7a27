//! Thread capabilities consumed by the corral primitives.
//!
//! The primitives never call `std::thread::spawn` directly. Every background
//! thread (nb-chan drainers, timer tickers, debouncer workers, promise
//! workers) is created through an injected [`ThreadFactory`], and every
//! thread identity comes from [`ThreadIdent::current`].
//!
//! [`StdThreads`] is the default factory: it spawns named OS threads and
//! keeps a registry of the ones still alive so they can be listed in a
//! diagnostic snapshot.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

pub use corral_types::ThreadSnapshot;

// ── Thread identity ──────────────────────────────────────────────

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

/// Opaque, comparable, printable identifier of a thread.
///
/// Numbers are handed out the first time a thread asks for its identity and
/// are never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadIdent(u64);

impl ThreadIdent {
    /// Identity of the calling thread.
    pub fn current() -> Self {
        CURRENT_THREAD_ID.with(|id| {
            if id.get() == 0 {
                id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
            }
            ThreadIdent(id.get())
        })
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ── Thread factory ───────────────────────────────────────────────

/// Work handed to a thread factory.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Creates the long-running threads of the primitives.
///
/// Implementations decide the scheduling model: OS threads, a pool, or a
/// test harness that records what was spawned.
pub trait ThreadFactory: Send + Sync + 'static {
    fn spawn(&self, name: &str, task: Task);
}

/// Shared handle to a thread factory, as stored by the primitives.
pub type SharedFactory = Arc<dyn ThreadFactory>;

struct ThreadEntry {
    ident: ThreadIdent,
    name: String,
    started_at: Instant,
}

/// RAII guard that deregisters the thread on drop.
pub struct ThreadGuard {
    registry: Arc<Mutex<Vec<ThreadEntry>>>,
    ident: ThreadIdent,
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        self.registry.lock().retain(|e| e.ident != self.ident);
    }
}

/// Spawns named OS threads and tracks the ones still running.
#[derive(Clone, Default)]
pub struct StdThreads {
    registry: Arc<Mutex<Vec<ThreadEntry>>>,
}

impl StdThreads {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh factory behind the shared handle the primitives take.
    pub fn shared() -> SharedFactory {
        Arc::new(Self::new())
    }

    /// Register the calling thread and return a guard that deregisters on drop.
    pub fn register_thread_guard(&self, name: &str) -> ThreadGuard {
        let ident = ThreadIdent::current();
        self.registry.lock().push(ThreadEntry {
            ident,
            name: name.to_string(),
            started_at: Instant::now(),
        });
        ThreadGuard {
            registry: Arc::clone(&self.registry),
            ident,
        }
    }

    pub fn live_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Threads spawned by this factory that have not exited yet.
    pub fn snapshot(&self) -> Vec<ThreadSnapshot> {
        let now = Instant::now();
        self.registry
            .lock()
            .iter()
            .map(|e| ThreadSnapshot {
                name: e.name.clone(),
                thread: e.ident.to_string(),
                age_secs: now.duration_since(e.started_at).as_secs_f64(),
            })
            .collect()
    }
}

impl ThreadFactory for StdThreads {
    fn spawn(&self, name: &str, task: Task) {
        let factory = self.clone();
        let thread_name = name.to_string();
        let spawned = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let _guard = factory.register_thread_guard(&thread_name);
                task();
            });
        if let Err(err) = spawned {
            // Same contract as std::thread::spawn: running out of threads is fatal.
            tracing::error!(thread = name, %err, "failed to spawn thread");
            panic!("failed to spawn thread {name}: {err}");
        }
    }
}
