#![cfg(not(miri))]

// Lifecycle tests observe global node counts, so every test gets its own
// element type: pools are per-monomorphization and process-wide, and the
// test harness runs tests in parallel.

use pooled_mpsc::PooledQueue;

#[test]
fn test_shared_pool_lifecycle() {
    #[derive(Clone)]
    struct Payload(#[allow(dead_code)] f64);
    type Queue = PooledQueue<Payload, 128>;

    let a = Queue::new();
    let b = Queue::new();
    // Both dummies come out of the one chunk the first growth produced.
    assert_eq!(Queue::global_node_count(), 128);

    Queue::reserve_global_chunks(5);
    let reserved = Queue::global_node_count();
    assert!(reserved >= 5 * 128);

    drop(a);
    // A surviving instance keeps the pool intact.
    assert_eq!(Queue::global_node_count(), reserved);

    drop(b);
    assert_eq!(Queue::global_node_count(), 0);

    // A fresh first instance forces exactly one growth of one chunk.
    let c = Queue::new();
    assert_eq!(Queue::global_node_count(), 128);
    drop(c);
}

#[test]
fn test_reserve_is_idempotent_for_smaller_requests() {
    #[derive(Clone)]
    struct Payload(#[allow(dead_code)] i64);
    type Queue = PooledQueue<Payload, 64>;

    let queue = Queue::new();
    assert_eq!(Queue::global_node_count(), 64);

    Queue::reserve_global_chunks(10);
    let reserved = Queue::global_node_count();
    assert!(reserved >= 10 * 64);

    Queue::reserve_global_chunks(5);
    assert_eq!(Queue::global_node_count(), reserved);
    drop(queue);
}

#[test]
fn test_survivor_keeps_pool_alive() {
    #[derive(Clone)]
    struct Payload(#[allow(dead_code)] u8);
    type Queue = PooledQueue<Payload, 256>;

    let survivor = Queue::new();
    let mut last_count = Queue::global_node_count();
    assert!(last_count >= 256);

    for _ in 0..3 {
        let transient = Queue::new();
        transient.enqueue(Payload(1));
        assert!(Queue::global_node_count() >= last_count);
        drop(transient);
        let count = Queue::global_node_count();
        assert!(count >= last_count);
        last_count = count;
    }

    drop(survivor);
    assert_eq!(Queue::global_node_count(), 0);
}

#[test]
fn test_fresh_instance_after_teardown() {
    #[derive(Clone)]
    struct Payload(#[allow(dead_code)] u32);
    type Queue = PooledQueue<Payload, 512>;

    let queue = Queue::new();
    queue.enqueue(Payload(5));
    assert_eq!(queue.try_dequeue().map(|p| p.0), Some(5));
    drop(queue);
    assert_eq!(Queue::global_node_count(), 0);

    let queue = Queue::new();
    assert_eq!(Queue::global_node_count(), 512);
    drop(queue);
}

#[test]
fn test_growth_doubles_pages() {
    #[derive(Clone)]
    struct Payload(#[allow(dead_code)] u64);
    type Queue = PooledQueue<Payload, 64>;

    let queue = Queue::new();
    // Hold 200 live items: the pool must have grown past its first page,
    // and every page is a whole number of chunks.
    for i in 0..200 {
        queue.enqueue(Payload(i));
    }
    let count = Queue::global_node_count();
    assert!(count >= 200);
    assert_eq!(count % 64, 0);

    for _ in 0..200 {
        assert!(queue.try_dequeue().is_some());
    }
    assert!(queue.is_empty());
    drop(queue);
}

#[test]
fn test_chunk_recycling_reaches_steady_state() {
    #[derive(Clone)]
    struct Payload(#[allow(dead_code)] usize);
    type Queue = PooledQueue<Payload, 64>;

    let queue = Queue::new();
    for i in 0..500 {
        queue.enqueue(Payload(i));
    }
    while queue.try_dequeue().is_some() {}
    let after_first_wave = Queue::global_node_count();

    // Chunks flushed back by the consumer get reused; the pool must not
    // grow again for an identical second wave.
    for i in 0..500 {
        queue.enqueue(Payload(i));
    }
    while queue.try_dequeue().is_some() {}
    assert_eq!(Queue::global_node_count(), after_first_wave);
    drop(queue);
}
