//! corral - blocking concurrency primitives for threaded Rust
//!
//! Every primitive is an instance; nothing here keeps global state. Threads
//! are created through an injected [`ThreadFactory`], cancellation travels
//! on latched channels, and panics in user code are caught at task
//! boundaries and handed back as [`Error::Panicked`].
//!
//! - Signalling: [`OnceSignal`], [`GroupCounter`], [`OnceWinner`], [`PeriodWaiter`]
//! - Admission: [`Moderator`], [`EchoModerator`]
//! - Timing: [`InvokeTimer`], [`SlowDetector`]
//! - Data flow: [`NbChan`], [`Debouncer`], [`Future`], [`WinOrWaiter`]
//! - Bookkeeping: [`CloserSet`], [`Ranking`], [`Registry`]

pub mod atomics;
pub mod closer_set;
pub mod config;
pub mod debouncer;
pub mod echo_moderator;
pub mod error;
pub mod future;
pub mod group_counter;
pub mod invoke_timer;
pub mod latch;
pub mod moderator;
pub mod nb_chan;
pub mod once_signal;
pub mod once_winner;
pub mod period_waiter;
pub mod ranking;
pub mod registry;
pub mod slow_detector;
pub mod win_or_waiter;

pub use atomics::{Atomic, AtomicMax, AtomicMin, Integer};
pub use closer_set::{Close, CloserSet};
pub use config::{Config, MIN_TIMER_PERIOD};
pub use debouncer::Debouncer;
pub use echo_moderator::{EchoConfig, EchoModerator, LogFn};
pub use error::{Error, Result, recover};
pub use future::{Future, promise};
pub use group_counter::GroupCounter;
pub use invoke_timer::{Alert, AlertCallback, AlertReason, InvokeTimer, log_alerts};
pub use latch::{Latch, is_closed_ch};
pub use moderator::{Moderator, ModeratorStatus, Ticket};
pub use nb_chan::{DrainerPolicy, NbChan};
pub use once_signal::OnceSignal;
pub use once_winner::{OnceWinner, WinnerDone, WinnerStrategy};
pub use period_waiter::PeriodWaiter;
pub use ranking::Ranking;
pub use registry::{Inspect, Registry};
pub use slow_detector::{Invocation, SlowCallback, SlowDetector, SlowPolicy, SlowReport, SlowTicker};
pub use win_or_waiter::{WinOrWaitStrategy, WinOrWaiter};

pub use corral_threads::{SharedFactory, StdThreads, Task, ThreadFactory, ThreadIdent};
pub use corral_types::{self as types, DrainerState, SyncSnapshot};
