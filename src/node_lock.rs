//! Per-node reader/writer lock with a writer-preferred wake policy and a
//! stamped optimistic-read mode. Built on `parking_lot::{Mutex, Condvar}`
//! rather than `std::sync::RwLock` because the stamp counter and the
//! writer-preference bookkeeping both need to live inside the same critical
//! section as the reader/writer counts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::arena::NodeId;

struct State {
    readers: u32,
    writer: bool,
    waiting_writers: u32,
}

/// One lock per tree node. Readers never block other readers; a waiting
/// writer blocks new readers from entering, so a steady trickle of short
/// reads cannot starve a writer indefinitely.
pub struct NodeLock {
    state: Mutex<State>,
    read_possible: Condvar,
    write_possible: Condvar,
    /// Bumped on every `write()` release. A reader can snapshot this before
    /// an unguarded read and compare it afterward to detect a concurrent
    /// mutation.
    stamp: AtomicU64,
}

impl NodeLock {
    pub fn new() -> Self {
        NodeLock {
            state: Mutex::new(State {
                readers: 0,
                writer: false,
                waiting_writers: 0,
            }),
            read_possible: Condvar::new(),
            write_possible: Condvar::new(),
            stamp: AtomicU64::new(0),
        }
    }

    /// The current write stamp. Pair with `validate` to implement an
    /// optimistic read: read the stamp, read the data without holding any
    /// lock, then confirm the stamp hasn't moved.
    pub fn stamp(&self) -> u64 {
        self.stamp.load(Ordering::Acquire)
    }

    /// True if no write has completed since `stamp` was taken.
    pub fn validate(&self, stamp: u64) -> bool {
        self.stamp.load(Ordering::Acquire) == stamp
    }

    /// No readers, no writer, nothing queued — safe to return to the pool.
    pub fn is_free(&self) -> bool {
        let state = self.state.lock();
        state.readers == 0 && !state.writer && state.waiting_writers == 0
    }

    /// Thread-held read. Blocks while a writer holds the lock, and also
    /// while a writer is queued, unless `prior` bypasses that second check,
    /// which hot ancestor nodes use during traversal so a slow writer deep
    /// in the tree can't starve readers passing through on their way to an
    /// unrelated sibling.
    pub fn read(&self, prior: bool) -> ReadGuard<'_> {
        let mut state = self.state.lock();
        while state.writer || (!prior && state.waiting_writers > 0) {
            self.read_possible.wait(&mut state);
        }
        state.readers += 1;
        ReadGuard { lock: self }
    }

    pub fn write(&self) -> WriteGuard<'_> {
        let mut state = self.state.lock();
        state.waiting_writers += 1;
        while state.writer || state.readers > 0 {
            self.write_possible.wait(&mut state);
        }
        state.waiting_writers -= 1;
        state.writer = true;
        WriteGuard { lock: self }
    }

    fn release_read(&self) {
        let mut state = self.state.lock();
        state.readers -= 1;
        if state.readers == 0 {
            self.write_possible.notify_one();
        }
    }

    fn release_write(&self) {
        let mut state = self.state.lock();
        state.writer = false;
        self.stamp.fetch_add(1, Ordering::AcqRel);
        if state.waiting_writers > 0 {
            self.write_possible.notify_one();
        } else {
            self.read_possible.notify_all();
        }
    }
}

impl Default for NodeLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ReadGuard<'a> {
    lock: &'a NodeLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

pub struct WriteGuard<'a> {
    lock: &'a NodeLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

/// A bounded, LRU-reclaimed pool of `NodeLock`s keyed by `NodeId`, so the
/// engine doesn't keep one heap allocation per node forever. Reclaiming a
/// lock that's currently held would be unsound, so eviction only considers
/// entries with no outstanding `Arc` clones.
pub struct LockPool {
    inner: Mutex<LockPoolInner>,
    capacity: usize,
}

struct LockPoolInner {
    locks: std::collections::HashMap<NodeId, Arc<NodeLock>>,
    /// Recency order, most-recently-used at the back.
    order: Vec<NodeId>,
}

impl LockPool {
    pub fn new(capacity: usize) -> Self {
        LockPool {
            inner: Mutex::new(LockPoolInner {
                locks: std::collections::HashMap::new(),
                order: Vec::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn get_or_create(&self, id: NodeId) -> Arc<NodeLock> {
        let mut inner = self.inner.lock();
        if let Some(lock) = inner.locks.get(&id) {
            let lock = lock.clone();
            Self::touch(&mut inner.order, id);
            return lock;
        }

        if inner.locks.len() >= self.capacity {
            Self::evict_one(&mut inner);
        }

        let lock = Arc::new(NodeLock::new());
        inner.locks.insert(id, lock.clone());
        inner.order.push(id);
        lock
    }

    fn touch(order: &mut Vec<NodeId>, id: NodeId) {
        if let Some(pos) = order.iter().position(|&x| x == id) {
            order.remove(pos);
        }
        order.push(id);
    }

    /// Evict the least-recently-used lock with no outstanding clone. If
    /// every entry is currently held elsewhere, the pool temporarily grows
    /// past `capacity` rather than evicting a lock out from under a holder.
    fn evict_one(inner: &mut LockPoolInner) {
        if let Some(pos) = inner
            .order
            .iter()
            .position(|id| Arc::strong_count(&inner.locks[id]) == 1)
        {
            let id = inner.order.remove(pos);
            inner.locks.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn readers_run_concurrently() {
        let lock = NodeLock::new();
        let r1 = lock.read(false);
        let r2 = lock.read(false);
        drop(r1);
        drop(r2);
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = Arc::new(NodeLock::new());
        let _w = lock.write();
        let lock2 = lock.clone();
        let entered = Arc::new(AtomicUsize::new(0));
        let entered2 = entered.clone();
        let handle = thread::spawn(move || {
            let _r = lock2.read(false);
            entered2.store(1, Ordering::SeqCst);
        });
        thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(entered.load(Ordering::SeqCst), 0);
        drop(_w);
        handle.join().unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queued_writer_blocks_new_non_prior_readers() {
        let lock = Arc::new(NodeLock::new());
        let r0 = lock.read(false);
        let lock_w = lock.clone();
        let writer_waiting = Arc::new(AtomicUsize::new(0));
        let writer_waiting2 = writer_waiting.clone();
        let handle = thread::spawn(move || {
            writer_waiting2.store(1, Ordering::SeqCst);
            let _w = lock_w.write();
        });
        thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(writer_waiting.load(Ordering::SeqCst), 1);

        let lock2 = lock.clone();
        let entered = Arc::new(AtomicUsize::new(0));
        let entered2 = entered.clone();
        let reader = thread::spawn(move || {
            let _r = lock2.read(false);
            entered2.store(1, Ordering::SeqCst);
        });
        thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(entered.load(Ordering::SeqCst), 0);

        drop(r0);
        handle.join().unwrap();
        reader.join().unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prior_read_bypasses_waiting_writer() {
        let lock = Arc::new(NodeLock::new());
        let r0 = lock.read(false);
        let lock_w = lock.clone();
        let handle = thread::spawn(move || {
            let _w = lock_w.write();
        });
        thread::sleep(std::time::Duration::from_millis(20));
        // A prior read must not block behind the queued writer.
        let r1 = lock.read(true);
        drop(r1);
        drop(r0);
        handle.join().unwrap();
    }

    #[test]
    fn stamp_changes_only_on_write() {
        let lock = NodeLock::new();
        let s0 = lock.stamp();
        {
            let _r = lock.read(false);
        }
        assert_eq!(lock.stamp(), s0);
        {
            let _w = lock.write();
        }
        assert_ne!(lock.stamp(), s0);
        assert!(!lock.validate(s0));
    }

    #[test]
    fn is_free_reflects_outstanding_guards() {
        let lock = NodeLock::new();
        assert!(lock.is_free());
        let r = lock.read(false);
        assert!(!lock.is_free());
        drop(r);
        assert!(lock.is_free());
    }

    #[test]
    fn lock_pool_reuses_same_lock_for_same_node() {
        let pool = LockPool::new(4);
        let a = pool.get_or_create(NodeId(1));
        let b = pool.get_or_create(NodeId(1));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn lock_pool_evicts_unheld_entries_beyond_capacity() {
        let pool = LockPool::new(2);
        let _a = pool.get_or_create(NodeId(1));
        drop(_a);
        pool.get_or_create(NodeId(2));
        pool.get_or_create(NodeId(3));
        assert!(pool.len() <= 2);
    }
}
