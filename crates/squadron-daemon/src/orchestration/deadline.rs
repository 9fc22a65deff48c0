//! Keyed, cancellable deadlines.
//!
//! [`DeadlineQueue`] keeps at most one pending deadline per key. Scheduling
//! an existing key replaces its deadline; cancelled and replaced entries are
//! discarded lazily when they surface at the top of the heap.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::time::Instant;

/// Stale heap entries tolerated before the heap is rebuilt.
const COMPACT_SLACK: usize = 64;

#[derive(Debug)]
struct Entry<K> {
    deadline: Instant,
    generation: u64,
    key: K,
}

impl<K> PartialEq for Entry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl<K> Eq for Entry<K> {}

impl<K> PartialOrd for Entry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Entry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.generation.cmp(&other.generation))
    }
}

/// Min-heap of `(deadline, key)` with cancel-by-key.
#[derive(Debug)]
pub struct DeadlineQueue<K> {
    heap: BinaryHeap<Reverse<Entry<K>>>,
    /// Live deadline and generation per key.
    live: HashMap<K, (Instant, u64)>,
    next_generation: u64,
}

impl<K> Default for DeadlineQueue<K> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_generation: 0,
        }
    }
}

impl<K: Eq + Hash + Clone> DeadlineQueue<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `key` to fire at `deadline`.
    ///
    /// Returns `true` if a pending deadline for `key` was replaced.
    pub fn schedule(&mut self, key: K, deadline: Instant) -> bool {
        let generation = self.next_generation;
        self.next_generation += 1;
        let replaced = self
            .live
            .insert(key.clone(), (deadline, generation))
            .is_some();
        self.heap.push(Reverse(Entry {
            deadline,
            generation,
            key,
        }));
        self.maybe_compact();
        replaced
    }

    /// Cancel the pending deadline for `key`. Returns `false` if none existed.
    pub fn cancel(&mut self, key: &K) -> bool {
        let removed = self.live.remove(key).is_some();
        if removed {
            self.maybe_compact();
        }
        removed
    }

    pub fn contains(&self, key: &K) -> bool {
        self.live.contains_key(key)
    }

    pub fn deadline(&self, key: &K) -> Option<Instant> {
        self.live.get(key).map(|(deadline, _)| *deadline)
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.live.values().map(|(deadline, _)| *deadline).min()
    }

    /// Number of pending deadlines.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Remove and return every key whose deadline is at or before `now`,
    /// earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<(K, Instant)> {
        let mut due = Vec::new();
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            let is_live = self
                .live
                .get(&entry.key)
                .is_some_and(|(_, generation)| *generation == entry.generation);
            if is_live {
                self.live.remove(&entry.key);
                due.push((entry.key, entry.deadline));
            }
        }
        due
    }

    /// Drop every pending deadline.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }

    fn maybe_compact(&mut self) {
        if self.heap.len() <= self.live.len() * 2 + COMPACT_SLACK {
            return;
        }
        let live = &self.live;
        self.heap.retain(|Reverse(entry)| {
            live.get(&entry.key)
                .is_some_and(|(_, generation)| *generation == entry.generation)
        });
    }
}
