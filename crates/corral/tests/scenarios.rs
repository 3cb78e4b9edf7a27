//! End-to-end behaviour of the primitives, one scenario per test.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;
use std::time::{Duration, Instant};

use corral::{
    Debouncer, Future, GroupCounter, Moderator, NbChan, OnceSignal, OnceWinner, StdThreads,
    WinnerStrategy,
};

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn moderator_hands_single_ticket_over() {
    let moderator = Moderator::new(1);
    let a = moderator.ticket();

    let release_b = OnceSignal::new();
    std::thread::scope(|s| {
        let b = s.spawn(|| {
            let ticket = moderator.ticket();
            release_b.wait();
            drop(ticket);
        });

        wait_until("b to queue", || moderator.waiting() == 1);
        drop(a);
        wait_until("b to run", || moderator.waiting() == 0);
        assert_eq!(moderator.to_string(), "available: 0(1)");

        release_b.cancel();
        b.join().unwrap();
    });

    assert_eq!(moderator.to_string(), "available: 1(1)");
}

#[test]
fn nb_chan_get_and_close() {
    let chan = NbChan::new();
    chan.send(1).unwrap();
    chan.send(2).unwrap();
    assert_eq!(chan.get(0), vec![1, 2]);
    assert_eq!(chan.count(), 0);

    chan.send(3).unwrap();
    chan.close();
    assert_eq!(chan.get(0), vec![3]);
    assert!(chan.is_closed());
}

#[test]
fn group_counter_reaches_zero() {
    let counter = GroupCounter::new();
    counter.add(2);
    assert!(!counter.done());
    assert_eq!(counter.counts(), (1, 2));
    assert!(counter.done());
    assert_eq!(counter.counts(), (0, 2));
    counter.wait();
}

#[test]
fn future_result_is_shared() {
    let future = Arc::new(Future::new());
    let worker = Arc::clone(&future);
    let computing = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(10));
        worker.end(Ok(42));
    });

    assert_eq!(*future.result().unwrap(), 42);
    computing.join().unwrap();

    let observer = Arc::clone(&future);
    let second = std::thread::spawn(move || *observer.result().unwrap());
    assert_eq!(second.join().unwrap(), 42);
}

#[test]
fn once_winner_elects_one_of_ten() {
    let winner = OnceWinner::new();
    let barrier = Barrier::new(10);
    let wins = AtomicUsize::new(0);
    let losses = AtomicUsize::new(0);

    std::thread::scope(|s| {
        for _ in 0..10 {
            s.spawn(|| {
                barrier.wait();
                let (won, done) = winner.is_winner(WinnerStrategy::Wait);
                if won {
                    wins.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(10));
                    if let Some(done) = done {
                        done.done();
                    }
                } else {
                    losses.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });

    assert_eq!(wins.load(Ordering::SeqCst), 1);
    assert_eq!(losses.load(Ordering::SeqCst), 9);
    assert!(winner.is_closed());
}

#[test]
fn debouncer_batches_by_quiet_period() {
    let (input_tx, input_rx) = crossbeam_channel::unbounded();
    let (batch_tx, batch_rx) = crossbeam_channel::unbounded();
    let debouncer = Debouncer::new(
        Duration::from_millis(50),
        input_rx,
        move |batch: Vec<u32>| batch_tx.send(batch).unwrap(),
        |err| panic!("debouncer failed: {err}"),
        crossbeam_channel::never(),
    );
    debouncer.go(&StdThreads::new());

    input_tx.send(1).unwrap();
    input_tx.send(2).unwrap();
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(batch_rx.recv_timeout(Duration::from_secs(5)).unwrap(), vec![1, 2]);

    input_tx.send(3).unwrap();
    drop(input_tx);
    assert_eq!(batch_rx.recv_timeout(Duration::from_secs(5)).unwrap(), vec![3]);
    debouncer.wait();
    assert!(debouncer.is_done());
}
