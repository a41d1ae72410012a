//! Bounded MPSC work queue with byte accounting.
//!
//! Producers (router, timer ticker, control thread) share push access; the
//! owning worker thread is the only consumer. `push_back` blocks while the
//! queue is over either limit — back-pressure is cooperative, never a
//! silent drop. `push_front` exists solely for internal control messages
//! and skips the capacity gate so control can never deadlock behind data.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

/// Cost model for queue byte accounting.
pub trait Weighted {
    fn weight(&self) -> usize;
}

struct State<T> {
    items: VecDeque<T>,
    bytes: usize,
    closed: bool,
}

pub struct Queue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    // Mirrors of the gauges, readable without the lock.
    size: AtomicUsize,
    memory: AtomicUsize,
    max_items: usize,
    max_bytes: usize,
}

impl<T: Weighted> Queue<T> {
    pub fn new(max_items: usize, max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                bytes: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            size: AtomicUsize::new(0),
            memory: AtomicUsize::new(0),
            max_items,
            max_bytes,
        }
    }

    /// FIFO enqueue. Blocks while the queue is full; returns `false` when
    /// the queue closed before the item could be accepted.
    pub fn push_back(&self, item: T) -> bool {
        let weight = item.weight();
        let mut state = self.state.lock().expect("queue lock poisoned");
        while !state.closed
            && !state.items.is_empty()
            && (state.items.len() >= self.max_items || state.bytes >= self.max_bytes)
        {
            state = self.not_full.wait(state).expect("queue lock poisoned");
        }
        if state.closed {
            return false;
        }
        state.items.push_back(item);
        state.bytes += weight;
        self.publish(&state);
        self.not_empty.notify_one();
        true
    }

    /// Priority enqueue for control messages; not subject to the capacity
    /// gate.
    pub fn push_front(&self, item: T) -> bool {
        let weight = item.weight();
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.closed {
            return false;
        }
        state.items.push_front(item);
        state.bytes += weight;
        self.publish(&state);
        self.not_empty.notify_one();
        true
    }

    /// Blocks until an item is available; `None` once the queue is closed
    /// and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        loop {
            if let Some(item) = state.items.pop_front() {
                state.bytes = state.bytes.saturating_sub(item.weight());
                self.publish(&state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self.not_empty.wait(state).expect("queue lock poisoned");
        }
    }

    /// Close the queue: producers are refused, the consumer drains what is
    /// left and then sees `None`.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn memory(&self) -> usize {
        self.memory.load(Ordering::Relaxed)
    }

    fn publish(&self, state: &State<T>) {
        self.size.store(state.items.len(), Ordering::Relaxed);
        self.memory.store(state.bytes, Ordering::Relaxed);
    }
}
