//! Pending request queue with greedy batch assembly

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// FIFO of pending requests shared by submitters and the engine worker.
///
/// The only structure of an engine that needs mutual exclusion: one lock plus a
/// wake condition for the worker.
pub(crate) struct PendingQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

impl<T> PendingQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueue one item; hands it back if the queue is closed
    pub(crate) fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(item);
        }
        state.items.push_back(item);
        self.available.notify_one();
        Ok(())
    }

    /// Enqueue several items contiguously; hands them back if the queue is closed
    pub(crate) fn push_all(&self, items: Vec<T>) -> Result<(), Vec<T>> {
        if items.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        if state.closed {
            return Err(items);
        }
        state.items.extend(items);
        self.available.notify_one();
        Ok(())
    }

    /// Take up to `max` items without waiting for more once anything is queued.
    ///
    /// Suspends while the queue is empty. Returns `None` once the queue is closed.
    pub(crate) fn next_batch(&self, max: usize) -> Option<Vec<T>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if !state.items.is_empty() {
                let take = state.items.len().min(max.max(1));
                return Some(state.items.drain(..take).collect());
            }
            self.available.wait(&mut state);
        }
    }

    /// Reject further pushes and hand back everything still queued
    pub(crate) fn close(&self) -> Vec<T> {
        let mut state = self.state.lock();
        state.closed = true;
        self.available.notify_all();
        state.items.drain(..).collect()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }
}
