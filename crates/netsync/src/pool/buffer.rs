use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::object::ObjectPool;

pub const DEFAULT_BUFFER_CAPACITY: usize = 2048;

const MAX_RETAINED_CAPACITY: usize = 64 * 1024;

/// Shared transmission buffer pool. Safe to borrow from any thread; the
/// admission limit is driven by the pool scaler on the simulation thread.
#[derive(Debug)]
pub struct BufferPool {
    buffers: ObjectPool<Vec<u8>>,
    borrowed: AtomicUsize,
    peak: AtomicUsize,
    limit: AtomicUsize,
}

impl BufferPool {
    pub fn new(retained: usize, limit: usize) -> Self {
        Self {
            buffers: ObjectPool::with_capacity(retained, retained.min(64), || {
                Vec::with_capacity(DEFAULT_BUFFER_CAPACITY)
            }),
            borrowed: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            limit: AtomicUsize::new(limit),
        }
    }

    /// Borrows regardless of the admission limit. Used for reliable traffic,
    /// which must not be dropped locally.
    pub fn borrow(&self) -> PooledBuffer<'_> {
        let now = self.borrowed.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::Relaxed);
        self.wrap(self.buffers.acquire_or_create())
    }

    /// Borrows only while fewer than `limit()` buffers are out.
    pub fn try_borrow(&self) -> Option<PooledBuffer<'_>> {
        let limit = self.limit.load(Ordering::Acquire);
        let prev = self
            .borrowed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .ok()?;
        self.peak.fetch_max(prev + 1, Ordering::Relaxed);
        Some(self.wrap(self.buffers.acquire_or_create()))
    }

    fn wrap(&self, mut buf: Vec<u8>) -> PooledBuffer<'_> {
        buf.clear();
        PooledBuffer { buf, pool: self }
    }

    fn give_back(&self, mut buf: Vec<u8>) {
        if buf.capacity() <= MAX_RETAINED_CAPACITY {
            buf.clear();
            let _ = self.buffers.release(buf);
        }
        self.borrowed.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn borrowed(&self) -> usize {
        self.borrowed.load(Ordering::Acquire)
    }

    /// Highest concurrent borrow count since the previous call.
    pub fn take_peak(&self) -> usize {
        let current = self.borrowed();
        self.peak.swap(current, Ordering::AcqRel).max(current)
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Release);
    }

    pub fn is_saturated(&self) -> bool {
        self.borrowed() >= self.limit()
    }
}

/// A buffer on loan from a [`BufferPool`]; returned when dropped.
pub struct PooledBuffer<'a> {
    buf: Vec<u8>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.give_back(mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn borrow_counts_and_returns() {
        let pool = BufferPool::new(8, 100);
        {
            let mut a = pool.borrow();
            a.extend_from_slice(b"hello");
            let _b = pool.borrow();
            assert_eq!(pool.borrowed(), 2);
        }
        assert_eq!(pool.borrowed(), 0);
        assert!(pool.borrow().is_empty());
    }

    #[test]
    fn try_borrow_respects_limit() {
        let pool = BufferPool::new(8, 2);
        let a = pool.try_borrow();
        let b = pool.try_borrow();
        assert!(a.is_some() && b.is_some());
        assert!(pool.try_borrow().is_none());
        assert!(pool.is_saturated());

        let _forced = pool.borrow();
        assert_eq!(pool.borrowed(), 3);

        drop(a);
        drop(_forced);
        assert!(pool.try_borrow().is_some());
    }

    #[test]
    fn peak_tracks_high_water() {
        let pool = BufferPool::new(8, 100);
        {
            let _a = pool.borrow();
            let _b = pool.borrow();
            let _c = pool.borrow();
        }
        let _d = pool.borrow();
        assert_eq!(pool.take_peak(), 3);
        assert_eq!(pool.take_peak(), 1);
    }

    #[test]
    fn concurrent_borrowers_balance() {
        let pool = Arc::new(BufferPool::new(16, 1000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for i in 0..500 {
                        let mut buf = pool.borrow();
                        buf.push(i as u8);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.borrowed(), 0);
    }
}
