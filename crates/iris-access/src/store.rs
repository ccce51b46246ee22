//! Generic id-indexed store turning asynchronous completions into blocking
//! calls.
//!
//! Producers (`push`) are completion callbacks running on transport or
//! protocol worker threads; consumers (`get`) are caller threads blocking
//! for a specific correlation id. Every pushed id is removed exactly once —
//! either by the waiter or, for abandoned requests, by the FIFO eviction
//! that bounds the store's capacity.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{AccessError, Result};

/// Items that can be stored and retrieved by correlation id.
pub trait Correlated {
    /// The item's correlation id.
    fn id(&self) -> u32;
}

/// Default capacity before the oldest entry is evicted.
pub const DEFAULT_CAPACITY: usize = 100_000;

struct Inner<T> {
    items: HashMap<u32, T>,
    order: VecDeque<u32>,
}

/// Thread-safe map from correlation id to completed request.
pub struct ResultStore<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T: Correlated> Default for ResultStore<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<T: Correlated> ResultStore<T> {
    /// Create a store that evicts its oldest entry beyond `capacity`.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: HashMap::new(),
                order: VecDeque::new(),
            }),
            available: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Insert a completed item, waking any thread waiting for its id.
    ///
    /// If the store is at capacity the oldest entry is evicted and logged
    /// as dropped; its waiter (if any) will time out.
    pub fn push(&self, item: T) {
        let id = item.id();
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        while inner.items.len() >= self.capacity {
            // order may hold ids already consumed by get(); skip those.
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if inner.items.remove(&oldest).is_some() {
                tracing::warn!("result store full, dropped result {oldest}");
            }
        }
        inner.order.push_back(id);
        inner.items.insert(id, item);
        // get() leaves consumed ids behind in order; prune once they
        // outnumber the live items so the queue stays proportional to the
        // unconsumed set instead of growing with total throughput.
        if inner.order.len() > 8 && inner.order.len() > 2 * inner.items.len() {
            let Inner { items, order } = &mut *inner;
            order.retain(|id| items.contains_key(id));
        }
        drop(inner);
        self.available.notify_all();
    }

    /// Block until the item with `id` exists, removing it atomically.
    ///
    /// `timeout_ms == 0` waits indefinitely.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Timeout`] if no item with `id` arrived within
    /// `timeout_ms`.
    pub fn get(&self, id: u32, timeout_ms: u64) -> Result<T> {
        let deadline = if timeout_ms == 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(timeout_ms))
        };

        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if let Some(item) = inner.items.remove(&id) {
                return Ok(item);
            }
            match deadline {
                None => {
                    inner = self
                        .available
                        .wait(inner)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(AccessError::Timeout {
                            duration_ms: timeout_ms,
                        });
                    }
                    let (guard, _) = self
                        .available
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    inner = guard;
                }
            }
        }
    }

    /// Number of unconsumed items.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .items
            .len()
    }

    /// True when no items are pending consumption.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all unconsumed items.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let dropped = inner.items.len();
        inner.items.clear();
        inner.order.clear();
        if dropped > 0 {
            tracing::debug!("cleared {dropped} unconsumed results");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    struct Item {
        id: u32,
        payload: u32,
    }

    impl Correlated for Item {
        fn id(&self) -> u32 {
            self.id
        }
    }

    #[test]
    fn push_then_get_returns_item() {
        let store = ResultStore::new(16);
        store.push(Item { id: 5, payload: 50 });
        let item = store.get(5, 100).unwrap();
        assert_eq!(item.payload, 50);
    }

    #[test]
    fn second_get_for_same_id_times_out() {
        let store = ResultStore::new(16);
        store.push(Item { id: 7, payload: 70 });
        assert!(store.get(7, 50).is_ok());
        assert!(matches!(
            store.get(7, 50),
            Err(AccessError::Timeout { .. })
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn get_blocks_until_push_from_other_thread() {
        let store = Arc::new(ResultStore::new(16));
        let producer = Arc::clone(&store);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            producer.push(Item { id: 9, payload: 90 });
        });
        let item = store.get(9, 2_000).unwrap();
        assert_eq!(item.payload, 90);
        handle.join().unwrap();
    }

    #[test]
    fn timeout_expires_for_missing_id() {
        let store: ResultStore<Item> = ResultStore::new(16);
        let start = Instant::now();
        let err = store.get(1, 60).unwrap_err();
        assert!(matches!(err, AccessError::Timeout { duration_ms: 60 }));
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let store = ResultStore::new(2);
        store.push(Item { id: 1, payload: 1 });
        store.push(Item { id: 2, payload: 2 });
        store.push(Item { id: 3, payload: 3 });
        // id 1 was evicted; 2 and 3 remain.
        assert!(store.get(1, 10).is_err());
        assert!(store.get(2, 10).is_ok());
        assert!(store.get(3, 10).is_ok());
    }

    #[test]
    fn eviction_skips_consumed_ids() {
        let store = ResultStore::new(2);
        store.push(Item { id: 1, payload: 1 });
        store.push(Item { id: 2, payload: 2 });
        assert!(store.get(1, 10).is_ok());
        // id 1 is stale in the order queue; pushing two more must evict 2,
        // not lose 4.
        store.push(Item { id: 3, payload: 3 });
        store.push(Item { id: 4, payload: 4 });
        assert!(store.get(2, 10).is_err());
        assert!(store.get(3, 10).is_ok());
        assert!(store.get(4, 10).is_ok());
    }

    #[test]
    fn consumed_ids_do_not_linger_in_order_queue() {
        let store = ResultStore::new(16);
        for id in 0..10_000 {
            store.push(Item { id, payload: id });
            assert!(store.get(id, 10).is_ok());
        }
        assert!(store.is_empty());
        let inner = store.inner.lock().unwrap();
        assert!(
            inner.order.len() <= 8,
            "order queue retained {} stale ids",
            inner.order.len()
        );
    }

    #[test]
    fn clear_drops_everything() {
        let store = ResultStore::new(16);
        store.push(Item { id: 1, payload: 1 });
        store.push(Item { id: 2, payload: 2 });
        store.clear();
        assert!(store.is_empty());
    }
}
