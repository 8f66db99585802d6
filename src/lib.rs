//! Unbounded MPSC queues backed by a shared global node pool.
//!
//! ```text
//!         SC                MP
//! [tail]->[]->[]->[]->[]->[head]
//! ```
//!
//! Producers publish by exchanging `head`; the single consumer follows
//! `next` links from `tail`, behind one permanent dummy node. Nodes come
//! from a two-tier allocator: a per-thread free list refilled one chunk at
//! a time from a lock-free global stack, which grows by doubling slab
//! pages under a mutex. Every queue instance of one monomorphization
//! shares that pool; the last instance to drop tears it down.

pub mod mpsc;

pub use mpsc::PooledQueue;

// Common interface for MPSC queues.
pub trait MpscQueue<T: Send>: Send + Sync + 'static {
    // Error on push, e.g., when the queue is full or allocation fails.
    // Using T allows the producer to retrieve the item if push fails.
    type PushError;
    // Error on pop, e.g., when the queue is empty.
    type PopError;

    // Attempts to push an item into the queue.
    // Called by producers.
    fn push(&self, item: T) -> Result<(), Self::PushError>;

    // Attempts to pop an item from the queue.
    // Called by the single consumer.
    fn pop(&self) -> Result<T, Self::PopError>;

    // Returns `true` if the queue is empty.
    // Typically called by the consumer.
    fn is_empty(&self) -> bool;
}
