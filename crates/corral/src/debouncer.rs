use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, select};
use parking_lot::Mutex;

use corral_threads::ThreadFactory;

use crate::error::{Error, recover};
use crate::latch::Latch;

type SendFn<T> = Box<dyn FnMut(Vec<T>) + Send>;
type ErrFn = Box<dyn FnOnce(Error) + Send>;

/// Batches items from a channel and hands each batch to a sender function
/// once the input has been quiet for `delay`.
///
/// The worker stops when the input disconnects, after delivering what it
/// holds, or when `cancel` closes, without delivering.
pub struct Debouncer<T: Send + 'static> {
    worker: Mutex<Option<Worker<T>>>,
    done: Arc<Latch>,
}

struct Worker<T> {
    delay: Duration,
    input: Receiver<T>,
    sender: SendFn<T>,
    err_fn: ErrFn,
    cancel: Receiver<()>,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn new(
        delay: Duration,
        input: Receiver<T>,
        sender: impl FnMut(Vec<T>) + Send + 'static,
        err_fn: impl FnOnce(Error) + Send + 'static,
        cancel: Receiver<()>,
    ) -> Self {
        Self {
            worker: Mutex::new(Some(Worker {
                delay,
                input,
                sender: Box::new(sender),
                err_fn: Box::new(err_fn),
                cancel,
            })),
            done: Arc::new(Latch::new()),
        }
    }

    /// Start the worker on a thread from `factory`.
    ///
    /// # Panics
    ///
    /// When called a second time.
    #[track_caller]
    pub fn go(&self, factory: &dyn ThreadFactory) {
        let Some(worker) = self.worker.lock().take() else {
            panic!("debouncer: go called twice");
        };
        let done = Arc::clone(&self.done);
        factory.spawn(
            "corral-debouncer",
            Box::new(move || {
                let Worker {
                    delay,
                    input,
                    mut sender,
                    err_fn,
                    cancel,
                } = worker;
                if let Err(err) = recover(|| debounce(delay, &input, &mut sender, &cancel)) {
                    tracing::debug!(%err, "debouncer worker failed");
                    err_fn(err);
                }
                done.close();
            }),
        );
    }

    /// Block until the worker has exited.
    pub fn wait(&self) {
        self.done.wait();
    }

    pub fn is_done(&self) -> bool {
        self.done.is_closed()
    }
}

fn debounce<T>(
    delay: Duration,
    input: &Receiver<T>,
    sender: &mut SendFn<T>,
    cancel: &Receiver<()>,
) {
    let mut batch = Vec::new();
    let mut deadline: Option<Instant> = None;
    loop {
        let timer = match deadline {
            Some(at) => crossbeam_channel::at(at),
            None => crossbeam_channel::never(),
        };
        select! {
            recv(input) -> item => match item {
                Ok(item) => {
                    batch.push(item);
                    deadline = Some(Instant::now() + delay);
                }
                Err(_) => {
                    if !batch.is_empty() {
                        sender(std::mem::take(&mut batch));
                    }
                    tracing::trace!("debouncer input closed");
                    return;
                }
            },
            recv(timer) -> _ => {
                deadline = None;
                if !batch.is_empty() {
                    sender(std::mem::take(&mut batch));
                }
            }
            recv(cancel) -> _ => {
                tracing::trace!(dropped = batch.len(), "debouncer cancelled");
                return;
            }
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Debouncer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debouncer")
            .field("started", &self.worker.lock().is_none())
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::once_signal::OnceSignal;
    use corral_threads::StdThreads;

    fn collecting<T: Send + 'static>() -> (impl FnMut(Vec<T>) + Send + 'static, Receiver<Vec<T>>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (move |batch| tx.send(batch).unwrap(), rx)
    }

    #[test]
    fn quiet_period_flushes_batch() {
        let (input_tx, input_rx) = crossbeam_channel::unbounded();
        let (sender, batches) = collecting();
        let debouncer = Debouncer::new(
            Duration::from_millis(50),
            input_rx,
            sender,
            |err| panic!("unexpected error: {err}"),
            crossbeam_channel::never(),
        );
        debouncer.go(&StdThreads::new());

        input_tx.send(1).unwrap();
        input_tx.send(2).unwrap();
        assert_eq!(batches.recv_timeout(Duration::from_secs(5)).unwrap(), vec![1, 2]);

        input_tx.send(3).unwrap();
        drop(input_tx);
        assert_eq!(batches.recv_timeout(Duration::from_secs(5)).unwrap(), vec![3]);
        debouncer.wait();
        assert!(debouncer.is_done());
        assert!(batches.try_recv().is_err());
    }

    #[test]
    fn empty_input_delivers_nothing() {
        let (input_tx, input_rx) = crossbeam_channel::unbounded::<u8>();
        let (sender, batches) = collecting();
        let debouncer = Debouncer::new(
            Duration::from_millis(10),
            input_rx,
            sender,
            |_| {},
            crossbeam_channel::never(),
        );
        debouncer.go(&StdThreads::new());
        drop(input_tx);
        debouncer.wait();
        assert!(batches.try_recv().is_err());
    }

    #[test]
    fn cancel_drops_pending_batch() {
        let (input_tx, input_rx) = crossbeam_channel::unbounded();
        let (sender, batches) = collecting();
        let cancel = OnceSignal::new();
        let debouncer = Debouncer::new(
            Duration::from_secs(60),
            input_rx,
            sender,
            |_| {},
            cancel.ch(),
        );
        debouncer.go(&StdThreads::new());
        input_tx.send("pending").unwrap();
        cancel.cancel();
        debouncer.wait();
        assert!(batches.try_recv().is_err());
    }

    #[test]
    fn sender_panic_goes_to_err_fn() {
        let (input_tx, input_rx) = crossbeam_channel::unbounded();
        let (err_tx, err_rx) = crossbeam_channel::bounded(1);
        let debouncer = Debouncer::new(
            Duration::from_millis(5),
            input_rx,
            |_batch: Vec<u8>| panic!("sender broke"),
            move |err| err_tx.send(err).unwrap(),
            crossbeam_channel::never(),
        );
        debouncer.go(&StdThreads::new());
        input_tx.send(1).unwrap();

        let err = err_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(err.is_panic());
        debouncer.wait();
    }

    #[test]
    #[should_panic(expected = "go called twice")]
    fn second_go_panics() {
        let (_tx, rx) = crossbeam_channel::unbounded::<u8>();
        let debouncer = Debouncer::new(Duration::ZERO, rx, |_| {}, |_| {}, crossbeam_channel::never());
        let threads = StdThreads::new();
        debouncer.go(&threads);
        debouncer.go(&threads);
    }
}
