//! A ticket pool that caps parallelism.
//!
//! Below the cap, tickets are taken and returned by compare-and-swap on a
//! single counter and no lock is touched. At the cap, contenders queue FIFO
//! behind a mutex; a returned ticket is handed straight to the oldest
//! waiter (a transfer) so the held count stays at the cap while anyone
//! waits.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::Receiver;
use parking_lot::{Condvar, Mutex};

use corral_types::{ModeratorSnapshot, SyncSnapshot};

use crate::atomics::AtomicMax;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::latch::is_closed_ch;
use crate::once_signal::OnceSignal;
use crate::registry::Inspect;

pub struct Moderator {
    parallelism: u64,
    /// Tickets out, including ones in transfer to a waiter.
    held: AtomicU64,
    /// Announced waiters, from queueing until they leave with a ticket.
    waiting: AtomicU64,
    queue: Mutex<WaitQueue>,
    cv: Condvar,
    acquires: AtomicU64,
    transfers: AtomicU64,
    max_waiting: AtomicMax<u64>,
    cancel_poll: Duration,
}

#[derive(Default)]
struct WaitQueue {
    next_id: u64,
    waiters: VecDeque<u64>,
    /// Waiters that were handed a ticket and have not woken up yet.
    granted: Vec<u64>,
}

/// `(P, held, waiting)` at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeratorStatus {
    pub parallelism: u64,
    pub held: u64,
    pub waiting: u64,
}

impl ModeratorStatus {
    pub fn available(&self) -> u64 {
        self.parallelism.saturating_sub(self.held)
    }
}

impl fmt::Display for ModeratorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.waiting == 0 {
            write!(f, "available: {}({})", self.available(), self.parallelism)
        } else {
            write!(f, "waiting: {}({})", self.waiting, self.parallelism)
        }
    }
}

/// Admission to a [`Moderator`]. The ticket goes back on drop.
#[must_use = "dropping a ticket returns it immediately"]
pub struct Ticket<'a> {
    moderator: &'a Moderator,
}

impl Ticket<'_> {
    /// Return the ticket.
    pub fn release(self) {}
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        self.moderator.release();
    }
}

impl fmt::Debug for Ticket<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("moderator", &self.moderator.status())
            .finish()
    }
}

impl Moderator {
    /// # Panics
    ///
    /// When `parallelism` is zero.
    pub fn new(parallelism: u64) -> Self {
        assert!(parallelism >= 1, "moderator: parallelism must be at least 1");
        Self {
            parallelism,
            held: AtomicU64::new(0),
            waiting: AtomicU64::new(0),
            queue: Mutex::new(WaitQueue::default()),
            cv: Condvar::new(),
            acquires: AtomicU64::new(0),
            transfers: AtomicU64::new(0),
            max_waiting: AtomicMax::new(),
            cancel_poll: Config::default().cancel_poll,
        }
    }

    pub fn parallelism(&self) -> u64 {
        self.parallelism
    }

    /// Block until a ticket is available.
    pub fn ticket(&self) -> Ticket<'_> {
        if self.take_uncontended() {
            return self.admit();
        }
        let mut queue = self.queue.lock();
        let Some(id) = self.enqueue(&mut queue) else {
            return self.admit();
        };
        loop {
            if Self::collect_grant(&mut queue, id) {
                self.waiting.fetch_sub(1, Ordering::SeqCst);
                return self.admit();
            }
            self.cv.wait(&mut queue);
        }
    }

    /// Block until a ticket is available or `cancel` fires.
    ///
    /// A waiter that was already handed a ticket keeps it even if the
    /// cancel races with the hand-over. Queued waiters notice the cancel
    /// within [`Config::cancel_poll`].
    pub fn ticket_cancellable(&self, cancel: &OnceSignal) -> Result<Ticket<'_>> {
        self.ticket_until(&cancel.ch())
    }

    /// Like [`ticket_cancellable`](Self::ticket_cancellable) with any latched channel.
    pub fn ticket_until(&self, cancel: &Receiver<()>) -> Result<Ticket<'_>> {
        if self.take_uncontended() {
            return Ok(self.admit());
        }
        let mut queue = self.queue.lock();
        let Some(id) = self.enqueue(&mut queue) else {
            return Ok(self.admit());
        };
        loop {
            if Self::collect_grant(&mut queue, id) {
                self.waiting.fetch_sub(1, Ordering::SeqCst);
                return Ok(self.admit());
            }
            if is_closed_ch(cancel) {
                queue.waiters.retain(|w| *w != id);
                self.waiting.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Cancelled);
            }
            self.cv.wait_for(&mut queue, self.cancel_poll);
        }
    }

    /// A ticket if one is free right now and nobody is queued for it.
    pub fn try_ticket(&self) -> Option<Ticket<'_>> {
        self.take_uncontended().then(|| self.admit())
    }

    pub fn status(&self) -> ModeratorStatus {
        let waiting = self.queue.lock().waiters.len() as u64;
        ModeratorStatus {
            parallelism: self.parallelism,
            held: self.held.load(Ordering::SeqCst),
            waiting,
        }
    }

    /// Callers currently queued for a ticket.
    pub fn waiting(&self) -> u64 {
        self.queue.lock().waiters.len() as u64
    }

    /// Highest number of simultaneously queued callers seen so far.
    pub fn max_waiting(&self) -> u64 {
        self.max_waiting.get().unwrap_or(0)
    }

    fn admit(&self) -> Ticket<'_> {
        self.acquires.fetch_add(1, Ordering::Relaxed);
        Ticket { moderator: self }
    }

    /// Fast path, closed while anyone is queued so nobody passes a waiter.
    fn take_uncontended(&self) -> bool {
        self.waiting.load(Ordering::SeqCst) == 0 && self.take_from_pool()
    }

    /// Atomic mode: take a ticket by CAS while below the cap.
    fn take_from_pool(&self) -> bool {
        let mut held = self.held.load(Ordering::SeqCst);
        while held < self.parallelism {
            match self.held.compare_exchange_weak(
                held,
                held + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(next) => held = next,
            }
        }
        false
    }

    /// Announce a waiter and queue it. `None` when a ticket turned up in
    /// the pool after the announcement and was taken instead.
    fn enqueue(&self, queue: &mut WaitQueue) -> Option<u64> {
        let waiting = self.waiting.fetch_add(1, Ordering::SeqCst) + 1;
        // only the head of the queue may pick a ticket out of the pool;
        // anyone behind it is served by release or recycle
        if queue.waiters.is_empty() && self.take_from_pool() {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        self.max_waiting.observe(waiting);
        let id = queue.next_id;
        queue.next_id += 1;
        queue.waiters.push_back(id);
        Some(id)
    }

    fn collect_grant(queue: &mut WaitQueue, id: u64) -> bool {
        match queue.granted.iter().position(|g| *g == id) {
            Some(pos) => {
                queue.granted.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    fn release(&self) {
        if self.waiting.load(Ordering::SeqCst) == 0 {
            self.held.fetch_sub(1, Ordering::SeqCst);
            if self.waiting.load(Ordering::SeqCst) == 0 {
                return;
            }
            // a waiter announced itself while the ticket went back to the
            // pool; make sure it is not left queued next to a free ticket
            let mut queue = self.queue.lock();
            self.recycle(&mut queue);
            return;
        }

        let mut queue = self.queue.lock();
        match queue.waiters.pop_front() {
            Some(id) => {
                queue.granted.push(id);
                self.transfers.fetch_add(1, Ordering::Relaxed);
                self.cv.notify_all();
            }
            None => {
                self.held.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Hand pool tickets to queued waiters, oldest first.
    fn recycle(&self, queue: &mut WaitQueue) {
        let mut granted = false;
        while !queue.waiters.is_empty() && self.take_from_pool() {
            if let Some(id) = queue.waiters.pop_front() {
                queue.granted.push(id);
                self.transfers.fetch_add(1, Ordering::Relaxed);
                granted = true;
            }
        }
        if granted {
            self.cv.notify_all();
        }
    }
}

impl fmt::Display for Moderator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.status(), f)
    }
}

impl fmt::Debug for Moderator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Moderator")
            .field("status", &self.status())
            .finish()
    }
}

impl Inspect for Moderator {
    fn inspect(&self, name: &str, out: &mut SyncSnapshot) {
        let status = self.status();
        out.moderators.push(ModeratorSnapshot {
            name: name.to_string(),
            parallelism: status.parallelism,
            held: status.held,
            waiting: status.waiting,
            max_waiting: self.max_waiting(),
            acquires: self.acquires.load(Ordering::Relaxed),
            transfers: self.transfers.load(Ordering::Relaxed),
        });
    }
}
