//! Rate-limited, per-key coalescing work queue.
//!
//! A given key is processed by at most one worker at a time; re-enqueues
//! during processing coalesce into a single follow-up run. Failed keys
//! re-enter with exponential per-key backoff until the caller forgets
//! them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Base delay for per-key failure backoff.
const BACKOFF_BASE_MS: u64 = 50;
/// Cap for per-key failure backoff.
const BACKOFF_MAX_MS: u64 = 30_000;

struct QueueState<T> {
    /// Keys ready to be handed to a worker, in arrival order.
    ready: VecDeque<T>,
    /// Keys that need processing (ready or waiting for `done`).
    dirty: HashSet<T>,
    /// Keys currently held by a worker.
    processing: HashSet<T>,
    /// Keys scheduled for a later add. Small; scanned linearly.
    delayed: Vec<(Instant, T)>,
    /// Per-key failure counts for rate-limited re-adds.
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    cond: Condvar,
}

impl<T: Clone + Eq + Hash> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Eq + Hash> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                delayed: Vec::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState<T>> {
        self.state.lock().expect("work queue lock poisoned")
    }

    fn add_locked(state: &mut QueueState<T>, item: T) -> bool {
        if state.shutting_down {
            return false;
        }
        if !state.dirty.insert(item.clone()) {
            return false;
        }
        if state.processing.contains(&item) {
            // Re-run after the in-flight processing finishes.
            return false;
        }
        state.ready.push_back(item);
        true
    }

    /// Enqueue a key. Duplicate adds coalesce; adds during processing
    /// schedule exactly one follow-up run.
    pub fn add(&self, item: T) {
        let mut state = self.lock();
        if Self::add_locked(&mut state, item) {
            self.cond.notify_one();
        }
    }

    /// Enqueue a key after a delay.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        state.delayed.push((Instant::now() + delay, item));
        // Wake a waiter so it recomputes its sleep deadline.
        self.cond.notify_one();
    }

    /// Enqueue a key with exponential per-key backoff. Each call counts
    /// one more failure until [`WorkQueue::forget`].
    pub fn add_rate_limited(&self, item: T) {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(item.clone()).or_insert(0);
            *failures += 1;
            let exponent = failures.saturating_sub(1).min(31);
            Duration::from_millis((BACKOFF_BASE_MS << exponent).min(BACKOFF_MAX_MS))
        };
        self.add_after(item, delay);
    }

    /// How many rate-limited re-adds this key has accumulated.
    pub fn requeues(&self, item: &T) -> u32 {
        self.lock().failures.get(item).copied().unwrap_or(0)
    }

    /// Clear the failure history for a key.
    pub fn forget(&self, item: &T) {
        self.lock().failures.remove(item);
    }

    /// Block until a key is available. Returns `None` once the queue is
    /// shutting down and drained; workers exit on `None`.
    pub fn get(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            Self::promote_ready(&mut state);
            if let Some(item) = state.ready.pop_front() {
                state.dirty.remove(&item);
                state.processing.insert(item.clone());
                return Some(item);
            }
            if state.shutting_down {
                return None;
            }
            state = match Self::next_deadline(&state) {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    self.cond
                        .wait_timeout(state, timeout.max(Duration::from_millis(1)))
                        .expect("work queue lock poisoned")
                        .0
                }
                None => self.cond.wait(state).expect("work queue lock poisoned"),
            };
        }
    }

    fn promote_ready(state: &mut QueueState<T>) {
        let now = Instant::now();
        let mut index = 0;
        while index < state.delayed.len() {
            if state.delayed[index].0 <= now {
                let (_, item) = state.delayed.swap_remove(index);
                Self::add_locked(state, item);
            } else {
                index += 1;
            }
        }
    }

    fn next_deadline(state: &QueueState<T>) -> Option<Instant> {
        state.delayed.iter().map(|(at, _)| *at).min()
    }

    /// Mark a key finished. If it was re-added while processing, it goes
    /// straight back onto the ready list.
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.ready.push_back(item.clone());
            self.cond.notify_one();
        }
    }

    /// Stop accepting new keys and wake all waiters. Already-queued keys
    /// are still handed out so workers can drain.
    pub fn shut_down(&self) {
        let mut state = self.lock();
        state.shutting_down = true;
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
