// src/mpsc/pool.rs
//
// Two-tier node allocator shared by every `PooledQueue` instance of one
// element type: a thread-local free list in front of a lock-free global
// stack of chunks, refilled by slab pages grown under a mutex.

use std::any::{Any, TypeId};
use std::cell::{RefCell, UnsafeCell};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;
use portable_atomic::AtomicU128;

// One pool cell. `value` is initialized only while the node carries a live
// item; `next` links the node into a queue, a thread cache, or its chunk;
// `next_chunk` is meaningful only while the node is the head of a chunk
// sitting on the global stack.
#[repr(C)]
pub(crate) struct Node<T> {
    pub(crate) value: MaybeUninit<T>,
    pub(crate) next: AtomicPtr<Node<T>>,
    next_chunk: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Node {
            value: MaybeUninit::uninit(),
            next: AtomicPtr::new(ptr::null_mut()),
            next_chunk: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

// Treiber stack of chunk heads. The top is a (pointer, tag) pair packed into
// one 16-byte word so a single CAS covers both; the tag advances on every
// successful update, which defeats ABA when the top chunk is popped and
// pushed back between a reader's load and its CAS.
struct ChunkStack<T> {
    top: AtomicU128,
    _marker: PhantomData<*mut Node<T>>,
}

fn pack<T>(node: *mut Node<T>, tag: u64) -> u128 {
    ((tag as u128) << 64) | node as usize as u128
}

fn unpack<T>(word: u128) -> (*mut Node<T>, u64) {
    (word as u64 as usize as *mut Node<T>, (word >> 64) as u64)
}

impl<T> ChunkStack<T> {
    const fn new() -> Self {
        ChunkStack {
            top: AtomicU128::new(0),
            _marker: PhantomData,
        }
    }

    fn push(&self, chunk: *mut Node<T>) {
        let mut old = self.top.load(Ordering::Relaxed);
        loop {
            let (old_ptr, old_tag) = unpack::<T>(old);
            unsafe {
                (*chunk).next_chunk.store(old_ptr, Ordering::Relaxed);
            }
            match self.top.compare_exchange_weak(
                old,
                pack(chunk, old_tag.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => old = current,
            }
        }
    }

    fn try_pop(&self) -> Option<*mut Node<T>> {
        let mut old = self.top.load(Ordering::Relaxed);
        loop {
            let (old_ptr, old_tag) = unpack::<T>(old);
            if old_ptr.is_null() {
                return None;
            }
            // Another thread may have popped `old_ptr` and started reusing
            // it; a stale read here is discarded because the tag-guarded CAS
            // below fails. Nodes are never freed while the pool is live, so
            // the load always targets valid memory.
            let next = unsafe { (*old_ptr).next_chunk.load(Ordering::Relaxed) };
            match self.top.compare_exchange_weak(
                old,
                pack(next, old_tag.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(old_ptr),
                Err(current) => old = current,
            }
        }
    }

    fn has_chunks(&self) -> bool {
        let (top, _) = unpack::<T>(self.top.load(Ordering::Acquire));
        !top.is_null()
    }

    fn reset(&self) {
        self.top.store(0, Ordering::Release);
    }
}

// Thread-local free list for one pool. `head` and `count` are only written
// by the owning thread, except during teardown, which runs under the
// contract that no queue operation is concurrently executing.
pub(crate) struct ThreadCache<T> {
    head: *mut Node<T>,
    count: usize,
    registered: AtomicBool,
}

impl<T> ThreadCache<T> {
    fn new() -> Self {
        ThreadCache {
            head: ptr::null_mut(),
            count: 0,
            registered: AtomicBool::new(false),
        }
    }
}

struct Page<T> {
    nodes: *mut Node<T>,
    len: usize,
}

struct PoolInner<T> {
    pages: Vec<Page<T>>,
    // Cache handles of every thread that ever touched this pool, so
    // teardown can reset them even when those threads are idle.
    threads: Vec<*mut ThreadCache<T>>,
}

pub(crate) struct GlobalPool<T: Send + 'static, const CHUNK: usize> {
    instances: AtomicUsize,
    node_count: AtomicUsize,
    stack: ChunkStack<T>,
    inner: Mutex<PoolInner<T>>,
}

unsafe impl<T: Send + 'static, const CHUNK: usize> Send for GlobalPool<T, CHUNK> {}
unsafe impl<T: Send + 'static, const CHUNK: usize> Sync for GlobalPool<T, CHUNK> {}

impl<T: Send + 'static, const CHUNK: usize> GlobalPool<T, CHUNK> {
    fn new() -> Self {
        GlobalPool {
            instances: AtomicUsize::new(0),
            node_count: AtomicUsize::new(0),
            stack: ChunkStack::new(),
            inner: Mutex::new(PoolInner {
                pages: Vec::new(),
                threads: Vec::new(),
            }),
        }
    }

    pub(crate) fn retain(&self) {
        self.instances.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        if self.instances.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut inner = self.inner.lock();
            // A new instance may have been created between the decrement
            // and the lock.
            if self.instances.load(Ordering::Acquire) == 0 {
                self.teardown(&mut inner);
            }
        }
    }

    // Frees all node memory and resets every registered thread cache, so a
    // later first instance starts from a blank pool.
    fn teardown(&self, inner: &mut PoolInner<T>) {
        for handle in inner.threads.drain(..) {
            unsafe {
                (*handle).head = ptr::null_mut();
                (*handle).count = 0;
                (*handle).registered.store(false, Ordering::Relaxed);
            }
        }
        for page in inner.pages.drain(..) {
            unsafe {
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                    page.nodes, page.len,
                )));
            }
        }
        self.node_count.store(0, Ordering::Release);
        self.stack.reset();
    }

    // Pops one node from the calling thread's cache, refilling it with a
    // chunk from the global stack when empty. The returned node has a null
    // `next`. Fast path is O(1) with no shared-state contact.
    pub(crate) fn allocate(&'static self) -> *mut Node<T> {
        with_cache(self, |cache| unsafe {
            if (*cache).head.is_null() {
                if !(*cache).registered.load(Ordering::Relaxed) {
                    self.register_thread(cache);
                }
                let chunk = loop {
                    match self.stack.try_pop() {
                        Some(chunk) => break chunk,
                        None => self.grow(),
                    }
                };
                (*cache).head = chunk;
                (*cache).count = CHUNK;
            }
            let node = (*cache).head;
            (*cache).head = (*node).next.load(Ordering::Relaxed);
            (*cache).count -= 1;
            (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
            node
        })
    }

    // Returns `node` to the calling thread's cache; once the cache holds a
    // full chunk it is pushed to the global stack in one pointer swap.
    pub(crate) fn deallocate(&'static self, node: *mut Node<T>) {
        with_cache(self, |cache| unsafe {
            if (*cache).count == 0 && !(*cache).registered.load(Ordering::Relaxed) {
                self.register_thread(cache);
            }
            (*node).next.store((*cache).head, Ordering::Relaxed);
            (*cache).head = node;
            (*cache).count += 1;
            debug_assert!((*cache).count <= CHUNK);
            if (*cache).count == CHUNK {
                self.stack.push((*cache).head);
                (*cache).head = ptr::null_mut();
                (*cache).count = 0;
            }
        })
    }

    // Slab growth: one page of max(CHUNK, total) nodes, so page sizes double
    // and the mutex is taken O(log N) times over the pool's lifetime.
    fn grow(&self) {
        let mut inner = self.inner.lock();
        // Lost the race: someone else refilled while we waited on the lock.
        if self.stack.has_chunks() {
            return;
        }
        let len = CHUNK.max(self.node_count.load(Ordering::Relaxed));
        self.grow_locked(&mut inner, len);
    }

    fn grow_locked(&self, inner: &mut PoolInner<T>, len: usize) {
        debug_assert!(len % CHUNK == 0 && len > 0);
        let nodes: Box<[Node<T>]> = (0..len).map(|_| Node::new()).collect();
        let base = Box::into_raw(nodes) as *mut Node<T>;
        unsafe {
            for start in (0..len).step_by(CHUNK) {
                for i in start..start + CHUNK - 1 {
                    (*base.add(i)).next.store(base.add(i + 1), Ordering::Relaxed);
                }
                // Every chunk holds exactly CHUNK nodes and ends with a null
                // `next`.
                (*base.add(start + CHUNK - 1))
                    .next
                    .store(ptr::null_mut(), Ordering::Relaxed);
            }
        }
        // The mutex does not synchronize with lock-free poppers; order the
        // links above before the runs become reachable through the stack.
        fence(Ordering::AcqRel);
        for start in (0..len).step_by(CHUNK) {
            self.stack.push(unsafe { base.add(start) });
        }
        inner.pages.push(Page { nodes: base, len });
        self.node_count.fetch_add(len, Ordering::Release);
    }

    // Pre-warms the pool to at least `chunks` chunks worth of nodes. A
    // no-op when the pool already reached that size.
    pub(crate) fn reserve_chunks(&self, chunks: usize) {
        let mut inner = self.inner.lock();
        let want = chunks.saturating_mul(CHUNK);
        let have = self.node_count.load(Ordering::Relaxed);
        if have >= want {
            return;
        }
        let len = (want - have + CHUNK - 1) & !(CHUNK - 1);
        self.grow_locked(&mut inner, len);
    }

    pub(crate) fn node_count(&self) -> usize {
        self.node_count.load(Ordering::Acquire)
    }

    fn register_thread(&self, handle: *mut ThreadCache<T>) {
        let mut inner = self.inner.lock();
        if !inner.threads.contains(&handle) {
            inner.threads.push(handle);
        }
        unsafe {
            (*handle).registered.store(true, Ordering::Relaxed);
        }
    }

    fn forget_thread(&self, handle: *mut ThreadCache<T>) {
        let mut inner = self.inner.lock();
        inner.threads.retain(|&h| h != handle);
    }
}

// Key type standing in for the (T, CHUNK) monomorphization in `TypeId`
// lookups.
struct PoolKey<T: 'static, const CHUNK: usize>(PhantomData<fn() -> T>);

// Type-erased address of a leaked pool. Kept as a pointer (not usize) so
// the shell stays reachable through the registry.
struct PoolAddr(*const ());

unsafe impl Send for PoolAddr {}

// Rust has no per-monomorphization statics, so each pool is created lazily,
// leaked, and found again through a process-wide TypeId registry. Teardown
// empties a pool but the (tiny) shell persists for reuse.
static POOLS: OnceLock<Mutex<HashMap<TypeId, PoolAddr>>> = OnceLock::new();

pub(crate) fn global<T: Send + 'static, const CHUNK: usize>() -> &'static GlobalPool<T, CHUNK> {
    let pools = POOLS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = pools.lock();
    let addr = map
        .entry(TypeId::of::<PoolKey<T, CHUNK>>())
        .or_insert_with(|| {
            PoolAddr(Box::into_raw(Box::new(GlobalPool::<T, CHUNK>::new())) as *const ())
        })
        .0;
    unsafe { &*(addr as *const GlobalPool<T, CHUNK>) }
}

// Per-thread cache slot. Dropped with the thread's TLS map: deregisters the
// handle so teardown never writes through a dangling pointer. Nodes still
// cached at that point stay unreachable until page teardown; a partial
// chunk must never be pushed, a popped chunk is assumed to hold exactly
// CHUNK nodes.
struct CacheSlot<T: Send + 'static, const CHUNK: usize> {
    cache: UnsafeCell<ThreadCache<T>>,
    pool: &'static GlobalPool<T, CHUNK>,
}

impl<T: Send + 'static, const CHUNK: usize> Drop for CacheSlot<T, CHUNK> {
    fn drop(&mut self) {
        let cache = self.cache.get();
        if unsafe { (*cache).registered.load(Ordering::Relaxed) } {
            self.pool.forget_thread(cache);
        }
    }
}

thread_local! {
    static CACHES: RefCell<HashMap<TypeId, Box<dyn Any>>> = RefCell::new(HashMap::new());
}

fn with_cache<T: Send + 'static, const CHUNK: usize, R>(
    pool: &'static GlobalPool<T, CHUNK>,
    f: impl FnOnce(*mut ThreadCache<T>) -> R,
) -> R {
    CACHES.with(|caches| {
        let mut map = caches.borrow_mut();
        let slot = map
            .entry(TypeId::of::<PoolKey<T, CHUNK>>())
            .or_insert_with(|| {
                Box::new(CacheSlot::<T, CHUNK> {
                    cache: UnsafeCell::new(ThreadCache::new()),
                    pool,
                })
            });
        match slot.downcast_ref::<CacheSlot<T, CHUNK>>() {
            Some(slot) => f(slot.cache.get()),
            // The entry under this key is always a CacheSlot<T, CHUNK>.
            None => unreachable!(),
        }
    })
}
