//! Bounded pool of reusable frame buffers.
//!
//! The pool is filled once at construction and never grows. `acquire` blocks
//! while every buffer is in flight, which is what throttles a producer that
//! runs ahead of the encoder. A buffer comes back to the pool when its
//! [`Pooled`] guard is dropped, so every exit path of a worker job (success,
//! encode error, unwinding) returns it.

use std::{
    ops::{Deref, DerefMut},
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub in_use: usize,
    pub acquisitions: u64,
    /// Acquisitions that found the pool empty and had to wait.
    pub waits: u64,
}

struct PoolInner<T> {
    items: Mutex<Vec<T>>,
    returned: Condvar,
    capacity: usize,
    acquisitions: AtomicU64,
    waits: AtomicU64,
}

impl<T> PoolInner<T> {
    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, item: T) {
        self.lock().push(item);
        self.returned.notify_one();
    }
}

pub struct BufferPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for BufferPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> BufferPool<T> {
    pub fn new(capacity: usize, make: impl Fn() -> T) -> Self {
        let items = (0..capacity).map(|_| make()).collect();
        Self {
            inner: Arc::new(PoolInner {
                items: Mutex::new(items),
                returned: Condvar::new(),
                capacity,
                acquisitions: AtomicU64::new(0),
                waits: AtomicU64::new(0),
            }),
        }
    }

    /// Takes a buffer, blocking until one is returned if the pool is empty.
    pub fn acquire(&self) -> Pooled<T> {
        let mut items = self.inner.lock();
        if items.is_empty() {
            self.inner.waits.fetch_add(1, Ordering::Relaxed);
        }
        loop {
            if let Some(item) = items.pop() {
                return self.wrap(item);
            }
            items = self
                .inner
                .returned
                .wait(items)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn try_acquire(&self) -> Option<Pooled<T>> {
        let item = self.inner.lock().pop()?;
        Some(self.wrap(item))
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<Pooled<T>> {
        let deadline = Instant::now() + timeout;
        let mut items = self.inner.lock();
        if items.is_empty() {
            self.inner.waits.fetch_add(1, Ordering::Relaxed);
        }
        loop {
            if let Some(item) = items.pop() {
                return Some(self.wrap(item));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self
                .inner
                .returned
                .wait_timeout(items, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            items = guard;
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn available(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn stats(&self) -> PoolStats {
        let available = self.available();
        PoolStats {
            capacity: self.inner.capacity,
            available,
            in_use: self.inner.capacity.saturating_sub(available),
            acquisitions: self.inner.acquisitions.load(Ordering::Relaxed),
            waits: self.inner.waits.load(Ordering::Relaxed),
        }
    }

    fn wrap(&self, item: T) -> Pooled<T> {
        self.inner.acquisitions.fetch_add(1, Ordering::Relaxed);
        Pooled {
            item: Some(item),
            pool: Arc::clone(&self.inner),
        }
    }
}

/// A buffer checked out of a [`BufferPool`]. Move-only; returns home on drop.
pub struct Pooled<T> {
    item: Option<T>,
    pool: Arc<PoolInner<T>>,
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("pooled item present until drop")
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("pooled item present until drop")
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(item);
        }
    }
}

#[cfg(test)]
#[path = "pool_test.rs"]
mod pool_test;
