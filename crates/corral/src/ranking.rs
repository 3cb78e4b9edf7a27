use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Items kept by identity and listed in rank order.
///
/// The rank of an item is computed when it is added or updated. Items of
/// equal rank list in the order they were first added.
pub struct Ranking<T, R> {
    rank: Box<dyn Fn(&T) -> R + Send + Sync>,
    state: Mutex<RankState<T, R>>,
}

struct RankState<T, R> {
    next_seq: u64,
    /// Sorted by `(rank, seq)`.
    entries: Vec<Ranked<T, R>>,
}

struct Ranked<T, R> {
    item: Arc<T>,
    rank: R,
    seq: u64,
}

impl<T, R: Ord> Ranking<T, R> {
    pub fn new(rank: impl Fn(&T) -> R + Send + Sync + 'static) -> Self {
        Self {
            rank: Box::new(rank),
            state: Mutex::new(RankState {
                next_seq: 0,
                entries: Vec::new(),
            }),
        }
    }

    /// Insert `item`, or re-rank it if already present.
    pub fn add_or_update(&self, item: &Arc<T>) {
        let rank = (self.rank)(item);
        let mut state = self.state.lock();
        let seq = match state.entries.iter().position(|e| Arc::ptr_eq(&e.item, item)) {
            Some(pos) => state.entries.remove(pos).seq,
            None => {
                state.next_seq += 1;
                state.next_seq
            }
        };
        let at = state
            .entries
            .partition_point(|e| (&e.rank, e.seq) < (&rank, seq));
        state.entries.insert(
            at,
            Ranked {
                item: Arc::clone(item),
                rank,
                seq,
            },
        );
    }

    pub fn remove(&self, item: &Arc<T>) -> bool {
        let mut state = self.state.lock();
        match state.entries.iter().position(|e| Arc::ptr_eq(&e.item, item)) {
            Some(pos) => {
                state.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// The first `n` items by rank; every item when `n` is 0.
    pub fn list(&self, n: usize) -> Vec<Arc<T>> {
        let state = self.state.lock();
        let n = if n == 0 { state.entries.len() } else { n };
        state
            .entries
            .iter()
            .take(n)
            .map(|e| Arc::clone(&e.item))
            .collect()
    }

    pub fn first(&self) -> Option<Arc<T>> {
        self.state.lock().entries.first().map(|e| Arc::clone(&e.item))
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }
}

impl<T, R> fmt::Debug for Ranking<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ranking")
            .field("len", &self.state.lock().entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct Job {
        name: &'static str,
        priority: AtomicI64,
    }

    fn job(name: &'static str, priority: i64) -> Arc<Job> {
        Arc::new(Job {
            name,
            priority: AtomicI64::new(priority),
        })
    }

    fn names(jobs: Vec<Arc<Job>>) -> Vec<&'static str> {
        jobs.iter().map(|j| j.name).collect()
    }

    #[test]
    fn lists_by_rank_with_stable_ties() {
        let ranking = Ranking::new(|j: &Job| j.priority.load(Ordering::SeqCst));
        let a = job("a", 2);
        let b = job("b", 1);
        let c = job("c", 2);
        let d = job("d", 1);
        for j in [&a, &b, &c, &d] {
            ranking.add_or_update(j);
        }

        assert_eq!(names(ranking.list(0)), vec!["b", "d", "a", "c"]);
        assert_eq!(names(ranking.list(3)), vec!["b", "d", "a"]);
        assert_eq!(ranking.first().unwrap().name, "b");
    }

    #[test]
    fn update_reorders_without_duplicating() {
        let ranking = Ranking::new(|j: &Job| j.priority.load(Ordering::SeqCst));
        let a = job("a", 1);
        let b = job("b", 2);
        ranking.add_or_update(&a);
        ranking.add_or_update(&b);

        a.priority.store(3, Ordering::SeqCst);
        ranking.add_or_update(&a);
        assert_eq!(ranking.len(), 2);
        assert_eq!(names(ranking.list(0)), vec!["b", "a"]);

        assert!(ranking.remove(&b));
        assert!(!ranking.remove(&b));
        assert_eq!(names(ranking.list(0)), vec!["a"]);
    }

    #[test]
    fn identity_not_value_decides_membership() {
        let ranking = Ranking::new(|j: &Job| j.priority.load(Ordering::SeqCst));
        let a = job("same", 1);
        let twin = job("same", 1);
        ranking.add_or_update(&a);
        ranking.add_or_update(&twin);
        assert_eq!(ranking.len(), 2);
        assert!(!ranking.is_empty());
    }
}
