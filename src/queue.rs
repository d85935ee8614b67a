//! A bounded, two-lock blocking FIFO queue.
//!
//! The design follows the classic two-lock linked queue: a `put_lock`
//! serializes producers, a `take_lock` serializes consumers, and the two
//! paths only ever meet when an operation needs a consistent view of the
//! whole structure (`remove`, `drain_to`, `clear`, `contains`, iteration,
//! `to_vec`/`from_vec`), in which case both locks are taken in the fixed
//! order put-then-take to avoid deadlock.
//!
//! Nodes are heap-allocated and linked with raw pointers rather than nested
//! `Box`es: the put side and the take side can observe and link the very
//! same node without either ever holding Rust-level ownership (`Box`) of a
//! node the other side is touching, which would make the two fields below
//! alias in a way the aliasing model does not allow. `item` and `next` are
//! therefore each wrapped in an `UnsafeCell`, and visibility between the two
//! sides is established through `count`, an `AtomicUsize` updated with
//! `Release` on insert and observed with `Acquire` before a removal reads
//! anything reachable from the node it just saw.

use core::cell::UnsafeCell;
use core::fmt;
use core::ptr::NonNull;
use std::error;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct Node<T> {
    item: UnsafeCell<Option<T>>,
    next: UnsafeCell<Option<NonNull<Node<T>>>>,
}

impl<T> Node<T> {
    fn alloc(item: Option<T>) -> NonNull<Node<T>> {
        let boxed = Box::new(Node {
            item: UnsafeCell::new(item),
            next: UnsafeCell::new(None),
        });
        NonNull::from(Box::leak(boxed))
    }

    /// # Safety
    /// `ptr` must not be dereferenced or freed again by anyone.
    unsafe fn free(ptr: NonNull<Node<T>>) {
        drop(unsafe { Box::from_raw(ptr.as_ptr()) });
    }
}

/// Returned by [`BlockingQueue::iter`]'s [`Iter::try_next`] when the queue was
/// structurally mutated after the iterator was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrentModification;

impl fmt::Display for ConcurrentModification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue was modified while being iterated")
    }
}

impl error::Error for ConcurrentModification {}

/// A bounded blocking FIFO queue.
///
/// Cloning a [`BlockingQueue`] is cheap and yields a handle to the same
/// underlying queue (it is `Arc`-like internally); all handles observe the
/// same elements.
pub struct BlockingQueue<T> {
    inner: std::sync::Arc<Inner<T>>,
}

struct Inner<T> {
    capacity: usize,
    count: AtomicUsize,
    version: AtomicU64,
    // Owns the sentinel; the take side frees nodes as it advances this
    // pointer past them.
    head: Mutex<NonNull<Node<T>>>,
    // Points at the last real node, or at the sentinel when empty. Never
    // used to free anything; freeing is always driven from `head`.
    tail: Mutex<NonNull<Node<T>>>,
    not_empty: Condvar,
    not_full: Condvar,
}

// SAFETY: `Node<T>`'s raw pointers are only ever dereferenced while holding
// `head` or `tail` (or both), and `T` itself is required to be `Send` by the
// bounds below, so the whole structure may cross and be shared across
// threads like any other `Mutex`-guarded data.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let mut cursor = *self.head.get_mut().unwrap();
        loop {
            // SAFETY: every node from `head` onward is owned by this queue
            // and nothing else can be observing it once `Inner` is dropping.
            let next = unsafe { *cursor.as_ref().next.get() };
            unsafe { Node::free(cursor) };
            match next {
                Some(next) => cursor = next,
                None => break,
            }
        }
    }
}

impl<T> BlockingQueue<T> {
    /// Creates a queue that holds at most `capacity` elements.
    ///
    /// # Panics
    /// Panics if `capacity == 0`; a queue that can never hold an element is
    /// never useful and every signaling rule below assumes `capacity >= 1`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "BlockingQueue capacity must be positive");
        let sentinel = Node::alloc(None);
        Self {
            inner: std::sync::Arc::new(Inner {
                capacity,
                count: AtomicUsize::new(0),
                version: AtomicU64::new(0),
                head: Mutex::new(sentinel),
                tail: Mutex::new(sentinel),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
            }),
        }
    }

    /// Creates a queue with effectively no capacity limit.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// Rebuilds a queue from a previously captured snapshot (see
    /// [`BlockingQueue::to_vec`]), preserving order.
    pub fn from_vec(items: Vec<T>, capacity: usize) -> Self {
        let queue = Self::new(capacity);
        for item in items {
            queue.offer(item);
        }
        queue
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remaining_capacity(&self) -> usize {
        self.inner.capacity - self.len()
    }

    /// Inserts `item`, blocking the calling thread while the queue is full.
    pub fn put(&self, item: T) {
        let mut tail = self.inner.tail.lock().unwrap();
        loop {
            if self.len() < self.inner.capacity {
                break;
            }
            tail = self.inner.not_full.wait(tail).unwrap();
        }
        self.enqueue(&mut tail, item);
    }

    /// Inserts `item` if there is room, without blocking.
    pub fn offer(&self, item: T) -> bool {
        let mut tail = self.inner.tail.lock().unwrap();
        if self.len() >= self.inner.capacity {
            return false;
        }
        self.enqueue(&mut tail, item);
        true
    }

    /// Inserts `item`, blocking up to `timeout` while the queue is full.
    /// Returns `false` if the deadline passed before room became available.
    pub fn offer_timeout(&self, item: T, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut tail = self.inner.tail.lock().unwrap();
        loop {
            if self.len() < self.inner.capacity {
                break;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (guard, timed_out) = self.inner.not_full.wait_timeout(tail, remaining).unwrap();
            tail = guard;
            if timed_out.timed_out() && self.len() >= self.inner.capacity {
                return false;
            }
        }
        self.enqueue(&mut tail, item);
        true
    }

    fn enqueue(&self, tail: &mut NonNull<Node<T>>, item: T) {
        let new = Node::alloc(Some(item));
        // SAFETY: `*tail` is always a live node owned by this queue: either
        // the sentinel, or a node reachable from it. Only a put-lock holder
        // ever writes a node's `next` field, so there is no concurrent
        // writer of this same field.
        unsafe {
            *(*tail.as_ptr()).next.get() = Some(new);
        }
        *tail = new;
        let previous = self.inner.count.fetch_add(1, Ordering::Release);
        self.inner.version.fetch_add(1, Ordering::Relaxed);
        if previous + 1 < self.inner.capacity {
            self.inner.not_full.notify_one();
        }
        if previous == 0 {
            self.signal_not_empty();
        }
    }

    /// Removes and returns the head element, blocking while the queue is
    /// empty.
    pub fn take(&self) -> T {
        let mut head = self.inner.head.lock().unwrap();
        loop {
            if self.len() > 0 {
                break;
            }
            head = self.inner.not_empty.wait(head).unwrap();
        }
        self.dequeue(&mut head)
    }

    /// Removes and returns the head element without blocking, or `None` if
    /// the queue is empty.
    pub fn poll(&self) -> Option<T> {
        if self.len() == 0 {
            return None;
        }
        let mut head = self.inner.head.lock().unwrap();
        if self.len() == 0 {
            return None;
        }
        Some(self.dequeue(&mut head))
    }

    /// Removes and returns the head element, blocking up to `timeout`.
    pub fn poll_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut head = self.inner.head.lock().unwrap();
        loop {
            if self.len() > 0 {
                break;
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, timed_out) = self.inner.not_empty.wait_timeout(head, remaining).unwrap();
            head = guard;
            if timed_out.timed_out() && self.len() == 0 {
                return None;
            }
        }
        Some(self.dequeue(&mut head))
    }

    fn dequeue(&self, head: &mut NonNull<Node<T>>) -> T {
        // `len() > 0` was just checked by the caller under `head`'s lock.
        // SAFETY: Acquire ordering on `count` synchronizes with the Release
        // increment in `enqueue`, so the `next` link and item written there
        // are visible here.
        atomic_fence_acquire();
        let old_head = *head;
        let next = unsafe { (*old_head.as_ptr()).next.get().read() }
            .expect("count > 0 implies a next node exists");
        let item = unsafe { (*next.as_ptr()).item.get().replace(None) }
            .expect("non-sentinel node always holds an item");
        *head = next;
        // SAFETY: the old sentinel is unreachable from both `head` (just
        // advanced past it) and `tail` (which, since `count` was > 0 before
        // this removal, pointed at `next` or beyond, never at `old_head`).
        unsafe { Node::free(old_head) };

        let previous = self.inner.count.fetch_sub(1, Ordering::AcqRel);
        self.inner.version.fetch_add(1, Ordering::Relaxed);
        if previous > 1 {
            self.inner.not_empty.notify_one();
        }
        if previous == self.inner.capacity {
            self.signal_not_full();
        }
        item
    }

    fn signal_not_empty(&self) {
        let _guard = self.inner.head.lock().unwrap();
        self.inner.not_empty.notify_one();
    }

    fn signal_not_full(&self) {
        let _guard = self.inner.tail.lock().unwrap();
        self.inner.not_full.notify_one();
    }

    /// Acquires both locks, in put-then-take order, for operations that need
    /// a consistent view of the whole queue.
    fn full_lock(&self) -> (std::sync::MutexGuard<'_, NonNull<Node<T>>>, std::sync::MutexGuard<'_, NonNull<Node<T>>>) {
        let tail = self.inner.tail.lock().unwrap();
        let head = self.inner.head.lock().unwrap();
        (tail, head)
    }

    /// Removes the first element equal to `item`, if any, returning whether
    /// one was found.
    pub fn remove(&self, item: &T) -> bool
    where
        T: PartialEq,
    {
        let (mut tail, head) = self.full_lock();
        let mut removed = false;
        let mut previous = *head;
        // SAFETY: both locks are held, so no producer or consumer can link
        // or unlink a node underneath us.
        let mut current = unsafe { (*previous.as_ptr()).next.get().read() };
        while let Some(node) = current {
            let matches = unsafe { &*(*node.as_ptr()).item.get() }
                .as_ref()
                .map(|value| value == item)
                .unwrap_or(false);
            let next = unsafe { (*node.as_ptr()).next.get().read() };
            if matches {
                unsafe {
                    *(*previous.as_ptr()).next.get() = next;
                }
                if *tail == node {
                    *tail = previous;
                }
                unsafe { Node::free(node) };
                self.inner.count.fetch_sub(1, Ordering::Relaxed);
                self.inner.version.fetch_add(1, Ordering::Relaxed);
                removed = true;
                break;
            }
            previous = node;
            current = next;
        }
        if removed {
            self.inner.not_full.notify_one();
        }
        removed
    }

    /// Returns `true` if some element equals `item`.
    pub fn contains(&self, item: &T) -> bool
    where
        T: PartialEq,
    {
        let (_tail, head) = self.full_lock();
        let mut current = unsafe { (*head.as_ptr()).next.get().read() };
        while let Some(node) = current {
            let found = unsafe { &*(*node.as_ptr()).item.get() }
                .as_ref()
                .map(|value| value == item)
                .unwrap_or(false);
            if found {
                return true;
            }
            current = unsafe { (*node.as_ptr()).next.get().read() };
        }
        false
    }

    /// Returns the head element without removing it, cloning it.
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        if self.len() == 0 {
            return None;
        }
        let head = self.inner.head.lock().unwrap();
        if self.len() == 0 {
            return None;
        }
        // SAFETY: `len() > 0` was just observed with Acquire ordering, which
        // synchronizes with the Release increment in `enqueue`; the fence
        // makes the producer's write to `next` visible before we read it.
        atomic_fence_acquire();
        let first = unsafe { (*head.as_ptr()).next.get().read() }?;
        unsafe { &*(*first.as_ptr()).item.get() }.clone()
    }

    /// Empties the queue, dropping every element.
    pub fn clear(&self) {
        let mut discarded = Vec::new();
        self.drain_to(&mut discarded, usize::MAX, |_| true);
    }

    /// Snapshots the queue's contents in order, cloning each element.
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        let (_tail, head) = self.full_lock();
        let mut items = Vec::with_capacity(self.len());
        let mut current = unsafe { (*head.as_ptr()).next.get().read() };
        while let Some(node) = current {
            if let Some(item) = unsafe { &*(*node.as_ptr()).item.get() } {
                items.push(item.clone());
            }
            current = unsafe { (*node.as_ptr()).next.get().read() };
        }
        items
    }

    /// Transfers up to `max` elements matching `predicate` into `sink`,
    /// atomically with respect to every other queue operation, and returns
    /// how many were transferred.
    ///
    /// With the defaults (`max == usize::MAX`, `predicate` accepting
    /// everything), the whole chain is detached under lock and walked
    /// outside the locks, so a full drain never holds both locks for longer
    /// than a pointer swap.
    pub fn drain_to<S: Extend<T>>(
        &self,
        sink: &mut S,
        max: usize,
        mut predicate: impl FnMut(&T) -> bool,
    ) -> usize {
        let full_drain = max == usize::MAX;

        let (mut tail, head) = self.full_lock();
        if full_drain {
            // Fast path: detach everything after the sentinel in one swap,
            // leave a fresh empty list behind, then walk the detached chain
            // outside the locks.
            let sentinel = *head;
            let detached = unsafe { (*sentinel.as_ptr()).next.get().replace(None) };
            *tail = sentinel;
            let removed = self.inner.count.swap(0, Ordering::AcqRel);
            self.inner.version.fetch_add(1, Ordering::Relaxed);
            drop(head);
            drop(tail);
            if removed > 0 {
                self.signal_not_full();
            }

            let mut transferred = 0;
            let mut current = detached;
            while let Some(node) = current {
                let next = unsafe { (*node.as_ptr()).next.get().read() };
                let item = unsafe { (*node.as_ptr()).item.get().replace(None) };
                unsafe { Node::free(node) };
                if let Some(item) = item {
                    if predicate(&item) {
                        sink.extend(std::iter::once(item));
                        transferred += 1;
                    }
                }
                current = next;
            }
            debug_assert_eq!(transferred <= removed, true);
            return transferred;
        }

        // Bounded / predicated path: walk and unlink matching nodes in
        // place, still under both locks.
        let mut transferred = 0;
        let mut previous = *head;
        let mut current = unsafe { (*previous.as_ptr()).next.get().read() };
        while let Some(node) = current {
            let next = unsafe { (*node.as_ptr()).next.get().read() };
            let should_take = transferred < max
                && unsafe { &*(*node.as_ptr()).item.get() }
                    .as_ref()
                    .map(|item| predicate(item))
                    .unwrap_or(false);
            if should_take {
                unsafe {
                    *(*previous.as_ptr()).next.get() = next;
                }
                if *tail == node {
                    *tail = previous;
                }
                let item = unsafe { (*node.as_ptr()).item.get().replace(None) };
                unsafe { Node::free(node) };
                if let Some(item) = item {
                    sink.extend(std::iter::once(item));
                    transferred += 1;
                }
                self.inner.count.fetch_sub(1, Ordering::Relaxed);
                self.inner.version.fetch_add(1, Ordering::Relaxed);
            } else {
                previous = node;
            }
            current = next;
            if transferred >= max {
                break;
            }
        }
        if transferred > 0 {
            self.inner.not_full.notify_one();
        }
        transferred
    }

    /// Returns a snapshot iterator. Every structural mutation after the
    /// iterator was created is detected (not necessarily attributed) the
    /// next time [`Iter::try_next`] is called.
    pub fn iter(&self) -> Iter<'_, T>
    where
        T: Clone,
    {
        let (_tail, head) = self.full_lock();
        Iter {
            queue: self,
            version: self.inner.version.load(Ordering::Acquire),
            next: unsafe { (*head.as_ptr()).next.get().read() },
        }
    }
}

impl<T> Clone for BlockingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// A fail-fast snapshot iterator returned by [`BlockingQueue::iter`].
pub struct Iter<'a, T> {
    queue: &'a BlockingQueue<T>,
    version: u64,
    next: Option<NonNull<Node<T>>>,
}

impl<T: Clone> Iter<'_, T> {
    /// Advances the iterator, distinguishing "exhausted" from "invalidated
    /// by a concurrent structural change".
    pub fn try_next(&mut self) -> Result<Option<T>, ConcurrentModification> {
        let (_tail, head) = self.queue.full_lock();
        if self.queue.inner.version.load(Ordering::Acquire) != self.version {
            return Err(ConcurrentModification);
        }
        let _ = &head;
        let Some(node) = self.next else {
            return Ok(None);
        };
        let item = unsafe { &*(*node.as_ptr()).item.get() }.clone();
        self.next = unsafe { (*node.as_ptr()).next.get().read() };
        Ok(item)
    }
}

impl<T: Clone> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.try_next().ok().flatten()
    }
}

fn atomic_fence_acquire() {
    std::sync::atomic::fence(Ordering::Acquire);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_single_producer_single_consumer() {
        let queue = BlockingQueue::new(16);
        for value in 0..10 {
            assert!(queue.offer(value));
        }
        let drained: Vec<_> = (0..10).map(|_| queue.poll().unwrap()).collect();
        assert_eq!(drained, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn offer_fails_when_full() {
        let queue = BlockingQueue::new(1);
        assert!(queue.offer(1));
        assert!(!queue.offer(2));
        assert_eq!(queue.take(), 1);
        assert!(queue.offer(2));
    }

    #[test]
    fn capacity_one_put_take_across_threads() {
        let queue = Arc::new(BlockingQueue::new(1));
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                queue.put('a');
                queue.put('b');
            })
        };
        assert_eq!(queue.take(), 'a');
        assert_eq!(queue.take(), 'b');
        producer.join().unwrap();
    }

    #[test]
    fn full_drain_is_atomic_and_empties_the_queue() {
        let queue = BlockingQueue::new(64);
        for value in 0..32 {
            queue.offer(value);
        }
        let mut drained = Vec::new();
        let count = queue.drain_to(&mut drained, usize::MAX, |_| true);
        assert_eq!(count, 32);
        assert_eq!(drained, (0..32).collect::<Vec<_>>());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn predicated_drain_leaves_non_matching_items() {
        let queue = BlockingQueue::new(64);
        for value in 0..10 {
            queue.offer(value);
        }
        let mut evens = Vec::new();
        let count = queue.drain_to(&mut evens, usize::MAX, |value| value % 2 == 0);
        assert_eq!(count, 5);
        assert_eq!(evens, vec![0, 2, 4, 6, 8]);
        assert_eq!(queue.to_vec(), vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn iterator_fails_fast_on_concurrent_modification() {
        let queue = BlockingQueue::new(8);
        queue.offer(1);
        queue.offer(2);
        let mut iter = queue.iter();
        assert_eq!(iter.try_next(), Ok(Some(1)));
        queue.offer(3);
        assert_eq!(iter.try_next(), Err(ConcurrentModification));
    }

    #[test]
    fn remove_drops_matching_middle_element() {
        let queue = BlockingQueue::new(8);
        for value in 0..5 {
            queue.offer(value);
        }
        assert!(queue.remove(&2));
        assert!(!queue.remove(&99));
        assert_eq!(queue.to_vec(), vec![0, 1, 3, 4]);
    }

    #[test]
    fn snapshot_round_trip() {
        let queue = BlockingQueue::new(8);
        for value in 0..4 {
            queue.offer(value);
        }
        let snapshot = queue.to_vec();
        let restored = BlockingQueue::from_vec(snapshot, 8);
        assert_eq!(restored.to_vec(), vec![0, 1, 2, 3]);
    }
}
