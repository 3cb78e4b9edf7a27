//! Non-blocking unbounded FIFO queue with an optional streaming thread.
//!
//! Senders append to an input buffer under the input lock; takers consume an
//! output buffer under the output lock. When the output buffer runs dry the
//! two are swapped under both locks, so the emptied buffer keeps its
//! capacity for the next round of sends.
//!
//! Items can be taken in bulk with [`NbChan::get`], or streamed one at a
//! time on [`NbChan::ch`] by a drainer thread. The drainer holds at most one
//! item outside the buffers, while it waits for a consumer.
//!
//! Lock order is input, output, thread.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, select};
use parking_lot::Mutex;

use corral_threads::SharedFactory;
use corral_types::{DrainerState, NbChanSnapshot, SyncSnapshot};

use crate::error::{Error, Result};
use crate::latch::Latch;
use crate::period_waiter::PeriodWaiter;
use crate::registry::Inspect;

/// When an [`NbChan`] runs a drainer thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainerPolicy {
    /// Once [`NbChan::ch`] has been called, run while there are items.
    #[default]
    OnDemand,
    /// From construction until the queue is closed.
    Always,
    /// Never; [`NbChan::ch`] is unavailable.
    NoThread,
}

pub struct NbChan<T: Send + 'static> {
    inner: Arc<ChanInner<T>>,
}

struct ChanInner<T> {
    policy: DrainerPolicy,
    factory: Option<SharedFactory>,
    input: Mutex<Input<T>>,
    output: Mutex<Output<T>>,
    thread: Mutex<ThreadState>,
    /// Appended minus taken by getters or delivered by the drainer.
    unsent: AtomicU64,
    end_requested: AtomicBool,
    gets_in_flight: Mutex<usize>,
    gate: PeriodWaiter,
    stream_tx: Mutex<Option<Sender<T>>>,
    stream_rx: Receiver<T>,
    /// Closed by `close_now`.
    now: Latch,
    /// Closed once the end was requested and every item is accounted for.
    closed: Latch,
}

struct Input<T> {
    buf: VecDeque<T>,
    /// Closed while data is available, or for good once the end is requested.
    data: Arc<Latch>,
    end_requested: bool,
    closed_now: bool,
}

struct Output<T> {
    buf: VecDeque<T>,
}

struct ThreadState {
    state: DrainerState,
    consumer_engaged: bool,
}

impl<T: Send + 'static> NbChan<T> {
    /// A queue without a drainer thread.
    pub fn new() -> Self {
        Self::build(DrainerPolicy::NoThread, None)
    }

    pub fn with_policy(policy: DrainerPolicy, factory: SharedFactory) -> Self {
        let chan = Self::build(policy, Some(factory));
        if policy == DrainerPolicy::Always {
            chan.inner.ensure_drainer();
        }
        chan
    }

    fn build(policy: DrainerPolicy, factory: Option<SharedFactory>) -> Self {
        let (stream_tx, stream_rx) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(ChanInner {
                policy,
                factory,
                input: Mutex::new(Input {
                    buf: VecDeque::new(),
                    data: Arc::new(Latch::new()),
                    end_requested: false,
                    closed_now: false,
                }),
                output: Mutex::new(Output {
                    buf: VecDeque::new(),
                }),
                thread: Mutex::new(ThreadState {
                    state: DrainerState::Absent,
                    consumer_engaged: false,
                }),
                unsent: AtomicU64::new(0),
                end_requested: AtomicBool::new(false),
                gets_in_flight: Mutex::new(0),
                gate: PeriodWaiter::new(),
                stream_tx: Mutex::new(Some(stream_tx)),
                stream_rx,
                now: Latch::new(),
                closed: Latch::new(),
            }),
        }
    }

    /// Append one item. Fails with [`Error::Closed`] once the end was requested.
    pub fn send(&self, value: T) -> Result<()> {
        self.send_many([value]).map(|_| ())
    }

    /// Append every item in order. Returns how many were appended.
    pub fn send_many(&self, values: impl IntoIterator<Item = T>) -> Result<usize> {
        let appended = {
            let mut input = self.inner.input.lock();
            if input.end_requested {
                return Err(Error::Closed);
            }
            let before = input.buf.len();
            input.buf.extend(values);
            let appended = input.buf.len() - before;
            if appended > 0 {
                self.inner.unsent.fetch_add(appended as u64, Ordering::SeqCst);
                input.data.close();
            }
            appended
        };
        if appended > 0 {
            self.inner.ensure_drainer();
        }
        Ok(appended)
    }

    /// Take up to `n` items, or every available item when `n` is 0.
    /// Never blocks on the queue being empty.
    pub fn get(&self, n: usize) -> Vec<T> {
        let inner = &self.inner;
        {
            let mut gets = inner.gets_in_flight.lock();
            *gets += 1;
            if *gets == 1 {
                inner.gate.hold();
            }
        }

        let items = inner.take(n, true);

        {
            let mut gets = inner.gets_in_flight.lock();
            *gets -= 1;
            if *gets == 0 {
                inner.gate.release();
            }
        }
        // the drainer may have given up while the gate was held
        if inner.unsent.load(Ordering::SeqCst) > 0 {
            inner.ensure_drainer();
        }
        inner.try_finish();
        items
    }

    /// Stream of items, fed by the drainer thread.
    ///
    /// The stream ends once the queue is closed and drained.
    ///
    /// # Panics
    ///
    /// For a queue built with [`DrainerPolicy::NoThread`].
    #[track_caller]
    pub fn ch(&self) -> Receiver<T> {
        if self.inner.policy == DrainerPolicy::NoThread || self.inner.factory.is_none() {
            panic!("nb-chan: ch() on a queue without a drainer thread");
        }
        self.inner.thread.lock().consumer_engaged = true;
        self.inner.ensure_drainer();
        self.inner.stream_rx.clone()
    }

    /// Channel that closes while data is available or once the queue ends.
    pub fn data_wait_ch(&self) -> Receiver<()> {
        self.inner.input.lock().data.ch()
    }

    /// Items sent and not yet taken or delivered.
    pub fn count(&self) -> u64 {
        self.inner.unsent.load(Ordering::SeqCst)
    }

    /// Combined capacity of both buffers.
    pub fn capacity(&self) -> usize {
        let input = self.inner.input.lock();
        let output = self.inner.output.lock();
        input.buf.capacity() + output.buf.capacity()
    }

    /// Closed and fully drained.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_closed()
    }

    /// Refuse further sends and close once every item is taken.
    /// Returns true for the call that requested the end.
    pub fn close(&self) -> bool {
        {
            let mut input = self.inner.input.lock();
            if input.end_requested {
                return false;
            }
            input.end_requested = true;
            input.data.close();
        }
        self.inner.end_requested.store(true, Ordering::SeqCst);
        tracing::debug!(unsent = self.count(), "nb-chan end requested");
        self.inner.try_finish();
        true
    }

    /// Close and discard every item not yet taken.
    /// Returns true for the call that did it.
    pub fn close_now(&self) -> bool {
        let discarded = {
            let mut input = self.inner.input.lock();
            let mut output = self.inner.output.lock();
            if input.closed_now {
                return false;
            }
            input.closed_now = true;
            input.end_requested = true;
            input.data.close();
            let discarded = input.buf.len() + output.buf.len();
            input.buf.clear();
            output.buf.clear();
            self.inner.unsent.fetch_sub(discarded as u64, Ordering::SeqCst);
            discarded
        };
        self.inner.end_requested.store(true, Ordering::SeqCst);
        self.inner.now.close();
        tracing::debug!(discarded, "nb-chan closed now");
        self.inner.try_finish();
        true
    }

    /// Block until the queue is closed and drained.
    pub fn wait_closed(&self) {
        self.inner.closed.wait();
    }

    pub fn drainer_state(&self) -> DrainerState {
        self.inner.thread.lock().state
    }
}

impl<T: Send + 'static> Default for NbChan<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Drop for NbChan<T> {
    fn drop(&mut self) {
        // releases a drainer blocked on a consumer that will never come
        self.close_now();
    }
}

impl<T: Send + 'static> ChanInner<T> {
    /// Move items out of the buffers, swapping when the output runs dry.
    fn take(&self, n: usize, settle: bool) -> Vec<T> {
        let mut input = self.input.lock();
        let mut output = self.output.lock();
        let mut items = Vec::new();
        loop {
            if output.buf.is_empty() {
                if input.buf.is_empty() {
                    break;
                }
                std::mem::swap(&mut input.buf, &mut output.buf);
            }
            let want = if n == 0 {
                output.buf.len()
            } else {
                (n - items.len()).min(output.buf.len())
            };
            items.extend(output.buf.drain(..want));
            if n != 0 && items.len() == n {
                break;
            }
        }
        if settle && !items.is_empty() {
            self.unsent.fetch_sub(items.len() as u64, Ordering::SeqCst);
        }
        let drained = input.buf.is_empty() && output.buf.is_empty();
        if drained && !input.end_requested && input.data.is_closed() {
            input.data = Arc::new(Latch::new());
        }
        items
    }

    fn ensure_drainer(self: &Arc<Self>) {
        let Some(factory) = &self.factory else {
            return;
        };
        let mut thread = self.thread.lock();
        if thread.state != DrainerState::Absent {
            return;
        }
        let wanted = match self.policy {
            DrainerPolicy::Always => true,
            DrainerPolicy::OnDemand => {
                thread.consumer_engaged && self.unsent.load(Ordering::SeqCst) > 0
            }
            DrainerPolicy::NoThread => false,
        };
        if !wanted || self.closed.is_closed() {
            return;
        }
        let Some(tx) = self.stream_tx.lock().clone() else {
            return;
        };
        thread.state = DrainerState::Running;
        let inner = Arc::clone(self);
        factory.spawn("corral-nb-chan", Box::new(move || inner.drain(tx)));
    }

    fn set_state(&self, state: DrainerState) {
        self.thread.lock().state = state;
    }

    fn drain(&self, tx: Sender<T>) {
        tracing::debug!(policy = ?self.policy, "nb-chan drainer started");
        let now = self.now.ch();
        loop {
            self.gate.wait();
            if let Some(value) = self.take(1, false).pop() {
                self.set_state(DrainerState::InSendBlock);
                select! {
                    send(tx, value) -> sent => {
                        if let Err(err) = sent {
                            tracing::warn!(%err, "nb-chan stream disconnected; item dropped");
                        }
                    }
                    recv(now) -> _ => {}
                }
                self.unsent.fetch_sub(1, Ordering::SeqCst);
                self.set_state(DrainerState::Running);
                self.try_finish();
                continue;
            }

            let data = {
                let mut thread = self.thread.lock();
                if self.end_requested.load(Ordering::SeqCst) {
                    if self.unsent.load(Ordering::SeqCst) == 0 {
                        thread.state = DrainerState::Exited;
                        break;
                    }
                    // a getter is settling the last items
                    drop(thread);
                    std::thread::yield_now();
                    continue;
                }
                if self.policy == DrainerPolicy::OnDemand {
                    if self.unsent.load(Ordering::SeqCst) == 0 {
                        thread.state = DrainerState::Absent;
                        break;
                    }
                    continue;
                }
                drop(thread);
                self.input.lock().data.ch()
            };
            select! {
                recv(data) -> _ => {}
                recv(now) -> _ => {}
            }
        }
        drop(tx);
        self.try_finish();
        tracing::debug!(state = ?self.drainer_state(), "nb-chan drainer stopped");
    }

    fn drainer_state(&self) -> DrainerState {
        self.thread.lock().state
    }

    /// Close for good once the end was requested and nothing is left.
    fn try_finish(&self) {
        if !self.end_requested.load(Ordering::SeqCst) {
            return;
        }
        if self.unsent.load(Ordering::SeqCst) != 0 {
            return;
        }
        if self.closed.close() {
            self.stream_tx.lock().take();
            let mut thread = self.thread.lock();
            if thread.state == DrainerState::Absent {
                thread.state = DrainerState::Exited;
            }
            tracing::debug!("nb-chan closed");
        }
    }
}

impl<T: Send + 'static> fmt::Debug for NbChan<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NbChan")
            .field("count", &self.count())
            .field("drainer", &self.drainer_state())
            .field("is_closed", &self.is_closed())
            .finish()
    }
}

impl<T: Send + 'static> Inspect for NbChan<T> {
    fn inspect(&self, name: &str, out: &mut SyncSnapshot) {
        let (input_capacity, output_capacity, end_requested, closed_now) = {
            let input = self.inner.input.lock();
            let output = self.inner.output.lock();
            (
                input.buf.capacity() as u64,
                output.buf.capacity() as u64,
                input.end_requested,
                input.closed_now,
            )
        };
        out.channels.push(NbChanSnapshot {
            name: name.to_string(),
            unsent: self.count(),
            input_capacity,
            output_capacity,
            drainer: self.drainer_state(),
            end_requested,
            closed_now,
            is_closed: self.is_closed(),
        });
    }
}
