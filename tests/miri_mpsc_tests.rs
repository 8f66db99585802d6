#![cfg(miri)]

// Scaled-down copies of the integration tests so miri finishes in
// reasonable time. Small CHUNK values keep slab pages tiny.

use pooled_mpsc::PooledQueue;
use std::sync::{Arc, Barrier};
use std::thread;

const MIRI_PRODUCERS: usize = 2;
const MIRI_ITEMS_PER_PRODUCER: usize = 50;

#[test]
fn test_miri_basic() {
    let queue = PooledQueue::<i32, 8>::new();
    assert!(queue.is_empty());
    queue.enqueue(42);
    assert_eq!(queue.try_dequeue(), Some(42));
    assert_eq!(queue.try_dequeue(), None);
}

#[test]
fn test_miri_values_drop_exactly_once() {
    let queue = PooledQueue::<String, 8>::new();
    for i in 0..20 {
        queue.enqueue(format!("item-{}", i));
    }
    for i in 0..20 {
        assert_eq!(queue.try_dequeue(), Some(format!("item-{}", i)));
    }
    assert!(queue.is_empty());
}

#[test]
fn test_miri_bulk() {
    let queue = PooledQueue::<u32, 8>::new();
    queue.enqueue_bulk(0..20, 20);
    let mut sink = Vec::new();
    assert_eq!(queue.try_dequeue_bulk(&mut sink, 32), 20);
    assert_eq!(sink, (0..20).collect::<Vec<_>>());
}

#[test]
fn test_miri_mpsc_concurrent() {
    let queue = Arc::new(PooledQueue::<usize, 16>::new());
    let barrier = Arc::new(Barrier::new(MIRI_PRODUCERS + 1));
    let total = MIRI_PRODUCERS * MIRI_ITEMS_PER_PRODUCER;

    let mut handles = vec![];
    for producer_id in 0..MIRI_PRODUCERS {
        let queue = queue.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            barrier.wait();
            for i in 0..MIRI_ITEMS_PER_PRODUCER {
                queue.enqueue(producer_id * MIRI_ITEMS_PER_PRODUCER + i);
            }
        }));
    }
    barrier.wait();

    let mut items = Vec::with_capacity(total);
    while items.len() < total {
        match queue.try_dequeue() {
            Some(item) => items.push(item),
            None => thread::yield_now(),
        }
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(queue.is_empty());
    items.sort();
    for (i, &item) in items.iter().enumerate() {
        assert_eq!(item, i);
    }
}

#[test]
fn test_miri_pool_teardown() {
    #[derive(Clone)]
    struct Payload(#[allow(dead_code)] u16);
    type Queue = PooledQueue<Payload, 8>;

    let a = Queue::new();
    let b = Queue::new();
    assert_eq!(Queue::global_node_count(), 8);
    drop(a);
    assert_eq!(Queue::global_node_count(), 8);
    drop(b);
    assert_eq!(Queue::global_node_count(), 0);

    let c = Queue::new();
    assert_eq!(Queue::global_node_count(), 8);
    drop(c);
}
