//! Bounded FIFO queue shared between async producers and worker loops.
//!
//! - **Backpressure**: `try_put` never waits; a full queue is reported as
//!   [`QueueError::Full`]
//! - **Fair hand-off**: `get` suspends until an item is available; each item is
//!   handed to exactly one caller
//! - **Join semantics**: every accepted item counts as unfinished until the
//!   consumer calls `task_done`; `join` resolves once nothing is unfinished
//! - **Control messages**: `push_control` bypasses capacity and is not counted,
//!   so a shutdown signal can always be delivered to a saturated queue

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::{Semaphore, watch};

use crate::error::QueueError;

pub struct WorkQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    // One permit per queued item.
    available: Semaphore,
    unfinished: watch::Sender<usize>,
    closed: AtomicBool,
}

impl<T> WorkQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (unfinished, _) = watch::channel(0);
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Semaphore::new(0),
            unfinished,
            closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().len() >= self.capacity
    }

    /// Items accepted but not yet marked done.
    pub fn unfinished(&self) -> usize {
        *self.unfinished.borrow()
    }

    /// Enqueue without waiting.
    pub fn try_put(&self, item: T) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        {
            let mut items = self.lock();
            if items.len() >= self.capacity {
                return Err(QueueError::Full {
                    capacity: self.capacity,
                });
            }
            items.push_back(item);
            self.unfinished.send_modify(|n| *n += 1);
        }
        self.available.add_permits(1);
        Ok(())
    }

    /// Enqueue a control message regardless of capacity or closed state.
    ///
    /// Control messages are not tracked by `task_done`/`join`.
    pub fn push_control(&self, item: T) {
        self.lock().push_back(item);
        self.available.add_permits(1);
    }

    /// Wait for the next item.
    ///
    /// Returns `None` only if the queue's internal signal was torn down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let permit = self.available.acquire().await.ok()?;
            permit.forget();
            if let Some(item) = self.lock().pop_front() {
                return Some(item);
            }
        }
    }

    /// Take the next item if one is immediately available.
    pub fn try_get(&self) -> Option<T> {
        let permit = self.available.try_acquire().ok()?;
        permit.forget();
        self.lock().pop_front()
    }

    /// Remove every queued item. Each returned tracked item still needs a
    /// matching `task_done`.
    pub fn drain(&self) -> Vec<T> {
        let mut drained = Vec::new();
        while let Some(item) = self.try_get() {
            drained.push(item);
        }
        drained
    }

    /// Mark one dequeued item as finished.
    pub fn task_done(&self) {
        self.unfinished.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Resolve once every accepted item has been marked done.
    pub async fn join(&self) {
        let mut rx = self.unfinished.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Stop accepting new items. Queued items remain available to `get`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> core::fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("unfinished", &self.unfinished())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use proptest::prelude::*;

    #[test]
    fn full_queue_rejects_immediately() {
        let queue = WorkQueue::new(2);
        queue.try_put("a").unwrap();
        queue.try_put("b").unwrap();

        assert_eq!(queue.try_put("c"), Err(QueueError::Full { capacity: 2 }));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn items_come_out_in_fifo_order() {
        let queue = WorkQueue::new(3);
        for n in 1..=3 {
            queue.try_put(n).unwrap();
        }

        assert_eq!(queue.get().await, Some(1));
        assert_eq!(queue.get().await, Some(2));
        assert_eq!(queue.get().await, Some(3));
    }

    #[tokio::test]
    async fn dequeued_items_free_their_slot() {
        let queue = WorkQueue::new(1);
        queue.try_put(1).unwrap();
        assert!(queue.try_put(2).is_err());

        queue.get().await;
        queue.try_put(2).unwrap();
    }

    #[tokio::test]
    async fn join_waits_for_task_done() {
        let queue = Arc::new(WorkQueue::new(4));
        queue.try_put(1).unwrap();
        queue.try_put(2).unwrap();

        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for _ in 0..2 {
                    queue.get().await;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    queue.task_done();
                }
            })
        };

        tokio::time::timeout(Duration::from_secs(2), queue.join())
            .await
            .expect("join should resolve once both items are done");
        assert_eq!(queue.unfinished(), 0);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn get_wakes_when_item_arrives() {
        let queue = Arc::new(WorkQueue::new(1));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::task::yield_now().await;
        queue.try_put(7).unwrap();

        assert_eq!(waiter.await.unwrap(), Some(7));
    }

    #[test]
    fn control_messages_bypass_capacity_and_close() {
        let queue = WorkQueue::new(1);
        queue.try_put(1).unwrap();
        queue.close();

        assert_eq!(queue.try_put(2), Err(QueueError::Closed));
        queue.push_control(0);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.unfinished(), 1);
    }

    #[test]
    fn drain_empties_queue() {
        let queue = WorkQueue::new(3);
        queue.try_put(1).unwrap();
        queue.try_put(2).unwrap();

        assert_eq!(queue.drain(), vec![1, 2]);
        assert!(queue.is_empty());
        assert!(queue.try_get().is_none());
    }

    proptest! {
        /// Property: after `capacity` successful puts with no gets, the next
        /// put fails with `Full`.
        #[test]
        fn put_beyond_capacity_fails(capacity in 1usize..64) {
            let queue = WorkQueue::new(capacity);
            for n in 0..capacity {
                prop_assert!(queue.try_put(n).is_ok());
            }
            prop_assert_eq!(queue.try_put(capacity), Err(QueueError::Full { capacity }));
            prop_assert_eq!(queue.len(), capacity);
        }
    }
}
