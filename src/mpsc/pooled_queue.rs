// src/mpsc/pooled_queue.rs

use std::convert::Infallible;
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use super::pool::{self, GlobalPool, Node};
use crate::MpscQueue;

// Blocking-dequeue shim. Stable Rust has no raw atomic wait/notify, so the
// consumer parks on a condvar; producers touch the lock only after a
// consumer announced itself, keeping the enqueue fast path lock-free.
struct Sleeper {
    waiting: AtomicUsize,
    lock: Mutex<()>,
    cv: Condvar,
}

/// Unbounded MPSC FIFO queue. Any number of threads may enqueue; exactly
/// one thread at a time may dequeue. All instances with the same `T` and
/// `CHUNK` share one global node pool, torn down when the last instance
/// drops.
///
/// After the last instance's drop returns, no thread may touch any queue
/// of this monomorphization again; doing so is undefined behavior. This is
/// the cost of the shared pool.
pub struct PooledQueue<T: Send + 'static, const CHUNK: usize = 256> {
    // Producer side: the most recently enqueued node.
    head: CachePadded<AtomicPtr<Node<T>>>,
    // Consumer side: the current dummy. Owned by the single consumer;
    // stored atomically (Relaxed) so `is_empty` stays defined behavior
    // from any thread.
    tail: CachePadded<AtomicPtr<Node<T>>>,
    sleep: Sleeper,
    pool: &'static GlobalPool<T, CHUNK>,
}

unsafe impl<T: Send + 'static, const CHUNK: usize> Send for PooledQueue<T, CHUNK> {}
unsafe impl<T: Send + 'static, const CHUNK: usize> Sync for PooledQueue<T, CHUNK> {}

impl<T: Send + 'static, const CHUNK: usize> PooledQueue<T, CHUNK> {
    const CHUNK_IS_POWER_OF_TWO: () =
        assert!(CHUNK.is_power_of_two(), "CHUNK must be a power of two");

    pub fn new() -> Self {
        let () = Self::CHUNK_IS_POWER_OF_TWO;
        let pool = pool::global::<T, CHUNK>();
        pool.retain();
        let dummy = pool.allocate();
        PooledQueue {
            head: CachePadded::new(AtomicPtr::new(dummy)),
            tail: CachePadded::new(AtomicPtr::new(dummy)),
            sleep: Sleeper {
                waiting: AtomicUsize::new(0),
                lock: Mutex::new(()),
                cv: Condvar::new(),
            },
            pool,
        }
    }

    /// Enqueues one value. Callable from any number of threads.
    pub fn enqueue(&self, value: T) {
        let node = self.pool.allocate();
        unsafe {
            ptr::addr_of_mut!((*node).value).cast::<T>().write(value);
        }
        self.publish(node, node);
    }

    /// Enqueues `n` items drained from `values`. The whole batch becomes
    /// visible to the consumer atomically and in iterator order.
    ///
    /// Panics when `values` yields fewer than `n` items.
    pub fn enqueue_bulk<I>(&self, values: I, n: usize)
    where
        I: IntoIterator<Item = T>,
    {
        if n == 0 {
            return;
        }
        let mut values = values.into_iter();
        let first = self.node_from(&mut values);
        let mut last = first;
        for _ in 1..n {
            let node = self.node_from(&mut values);
            unsafe {
                (*last).next.store(node, Ordering::Relaxed);
            }
            last = node;
        }
        self.publish(first, last);
    }

    /// Enqueues `n` clones of `value` as one batch.
    pub fn enqueue_bulk_fill(&self, value: &T, n: usize)
    where
        T: Clone,
    {
        self.enqueue_bulk(std::iter::repeat_with(|| value.clone()), n);
    }

    fn node_from<I: Iterator<Item = T>>(&self, values: &mut I) -> *mut Node<T> {
        match values.next() {
            Some(value) => {
                let node = self.pool.allocate();
                unsafe {
                    ptr::addr_of_mut!((*node).value).cast::<T>().write(value);
                }
                node
            }
            None => panic!("enqueue_bulk: iterator ran out before `n` items"),
        }
    }

    // Links a privately built chain `first -> .. -> last` into the queue.
    // `last.next` must already be null. The chain is invisible to the
    // consumer until the single release store below.
    fn publish(&self, first: *mut Node<T>, last: *mut Node<T>) {
        // Acquire side matters for a producer that goes on to read through
        // the previous head's fields; release publishes the value writes.
        let old_head = self.head.swap(last, Ordering::AcqRel);
        unsafe {
            (*old_head).next.store(first, Ordering::Release);
        }
        self.wake_consumer();
    }

    /// Dequeues one item, or `None` when the queue is observed empty.
    /// Consumer-side: must only be called from one thread at a time.
    pub fn try_dequeue(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        unsafe {
            // Pairs with the producer's release store in `publish`.
            let next = (*tail).next.load(Ordering::Acquire);
            if next.is_null() {
                return None;
            }
            let value = ptr::addr_of!((*next).value).cast::<T>().read();
            self.tail.store(next, Ordering::Relaxed);
            self.pool.deallocate(tail);
            Some(value)
        }
    }

    /// Dequeues up to `max` items into `sink`; returns the count drained.
    pub fn try_dequeue_bulk<E>(&self, sink: &mut E, max: usize) -> usize
    where
        E: Extend<T>,
    {
        let mut drained = 0;
        while drained < max {
            match self.try_dequeue() {
                Some(value) => {
                    sink.extend(Some(value));
                    drained += 1;
                }
                None => break,
            }
        }
        drained
    }

    /// Dequeues one item, blocking while the queue is empty.
    pub fn dequeue(&self) -> T {
        loop {
            if let Some(value) = self.try_dequeue() {
                return value;
            }
            self.wait_for_item();
        }
    }

    /// Dequeues exactly `n` items into `sink`, blocking as needed.
    pub fn dequeue_bulk<E>(&self, sink: &mut E, n: usize)
    where
        E: Extend<T>,
    {
        let mut drained = 0;
        while drained < n {
            drained += self.try_dequeue_bulk(sink, n - drained);
            if drained < n {
                self.wait_for_item();
            }
        }
    }

    /// True when no item is ready. Approximate under concurrent enqueues: a
    /// producer may have exchanged `head` but not yet published the link.
    pub fn is_empty(&self) -> bool {
        let tail = self.tail.load(Ordering::Acquire);
        unsafe { (*tail).next.load(Ordering::Acquire).is_null() }
    }

    /// Pre-warms the shared pool to at least `k` chunks (`k * CHUNK`
    /// nodes). Takes the pool mutex briefly.
    pub fn reserve_global_chunks(k: usize) {
        pool::global::<T, CHUNK>().reserve_chunks(k);
    }

    /// Total nodes owned by the shared pool of this monomorphization.
    /// Informational.
    pub fn global_node_count() -> usize {
        pool::global::<T, CHUNK>().node_count()
    }

    fn wait_for_item(&self) {
        let mut guard = self.sleep.lock.lock();
        self.sleep.waiting.store(1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        // Re-check after announcing the waiter, otherwise a publish landing
        // between the failed dequeue and the store above would be lost.
        if !self.has_next() {
            self.sleep.cv.wait(&mut guard);
        }
        self.sleep.waiting.store(0, Ordering::Relaxed);
    }

    fn has_next(&self) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        unsafe { !(*tail).next.load(Ordering::Acquire).is_null() }
    }

    fn wake_consumer(&self) {
        // Orders the release link in `publish` before the flag read; pairs
        // with the fence in `wait_for_item`. One wake per empty-to-non-empty
        // transition suffices, there is at most one consumer.
        fence(Ordering::SeqCst);
        if self.sleep.waiting.load(Ordering::Relaxed) != 0 {
            let _guard = self.sleep.lock.lock();
            self.sleep.cv.notify_one();
        }
    }
}

impl<T: Send + 'static, const CHUNK: usize> Default for PooledQueue<T, CHUNK> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static, const CHUNK: usize> Drop for PooledQueue<T, CHUNK> {
    // Does not drain. Values still enqueued are leaked; their node storage
    // is reclaimed when the last instance tears the pool down. Callers that
    // need destructors to run must drain first.
    fn drop(&mut self) {
        self.pool.release();
    }
}

impl<T: Send + 'static, const CHUNK: usize> MpscQueue<T> for PooledQueue<T, CHUNK> {
    type PushError = Infallible;
    type PopError = ();

    fn push(&self, item: T) -> Result<(), Self::PushError> {
        self.enqueue(item);
        Ok(())
    }

    fn pop(&self) -> Result<T, Self::PopError> {
        self.try_dequeue().ok_or(())
    }

    fn is_empty(&self) -> bool {
        self.is_empty()
    }
}
