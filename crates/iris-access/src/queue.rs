//! Bounded work queue shared between submitters and a worker thread.
//!
//! Mutex + condition-variable pair; all waits are bounded by a 100 ms poll
//! so the owning worker observes its stop flag promptly, and submitters
//! blocked on a full queue notice shutdown instead of hanging.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::{AccessError, Result};

const WAIT_SLICE: Duration = Duration::from_millis(100);

pub(crate) struct WorkQueue<T> {
    inner: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Push, blocking while the queue is full.
    ///
    /// Fails with `NotInitialized` if `stop` is raised while waiting.
    pub fn push_blocking(&self, item: T, stop: &AtomicBool) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while inner.len() >= self.capacity {
            if stop.load(Ordering::SeqCst) {
                return Err(AccessError::NotInitialized);
            }
            let (guard, _) = self
                .not_full
                .wait_timeout(inner, WAIT_SLICE)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            inner = guard;
        }
        inner.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pop one item, waiting at most one poll slice.
    ///
    /// Returns `None` on stop or when the slice elapsed empty.
    pub fn pop(&self, stop: &AtomicBool) -> Option<T> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if stop.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(item) = inner.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            let (guard, timeout) = self
                .not_empty
                .wait_timeout(inner, WAIT_SLICE)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            inner = guard;
            if timeout.timed_out() {
                return None;
            }
        }
    }

    /// Remove and return everything queued.
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let drained = inner.drain(..).collect();
        drop(inner);
        self.not_full.notify_all();
        drained
    }

    /// Wake every waiter (used on shutdown).
    pub fn notify_all(&self) {
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}
