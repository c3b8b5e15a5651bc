//! Bounded pool of reusable byte buffers.
//!
//! Every connection acquires its read and write buffers here and holds
//! them for the connection's lifetime; dropping the handle returns the
//! storage, including when the owning task is cancelled mid-response.
//! The pool is bounded: once every buffer is out, `acquire` waits until
//! one comes back instead of allocating further.

use crossbeam::queue::SegQueue;
use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub(crate) struct BufferPool {
    free: SegQueue<Vec<u8>>,
    permits: Arc<Semaphore>,
    initial_capacity: usize,
    /// A buffer that grew past this is discarded instead of pooled, so
    /// one oversized request cannot pin memory for the pool's lifetime.
    retain_capacity: usize,
}

impl BufferPool {
    pub(crate) fn new(count: usize, initial_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            free: SegQueue::new(),
            permits: Arc::new(Semaphore::new(count)),
            initial_capacity,
            retain_capacity: initial_capacity * 8,
        })
    }

    /// Take a buffer out of the pool, waiting if all are in use.
    pub(crate) async fn acquire(self: &Arc<Self>) -> PooledBuf {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("buffer pool semaphore closed");

        let buf = self
            .free
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.initial_capacity));

        PooledBuf {
            buf,
            pool: self.clone(),
            _permit: permit,
        }
    }
}

/// A buffer checked out of the pool. Dereferences to `Vec<u8>`; the
/// storage goes back to the pool on drop.
pub(crate) struct PooledBuf {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    #[inline]
    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if self.buf.capacity() <= self.pool.retain_capacity {
            let mut buf = std::mem::take(&mut self.buf);
            buf.clear();
            self.pool.free.push(buf);
        }
        // The permit drops afterwards, waking one waiting acquirer.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_and_return() {
        let pool = BufferPool::new(2, 64);

        let mut a = pool.acquire().await;
        a.extend_from_slice(b"hello");
        assert_eq!(&a[..], b"hello");
        drop(a);

        // The returned buffer is cleared before reuse.
        let b = pool.acquire().await;
        assert!(b.is_empty());
        assert!(b.capacity() >= 64);
    }

    #[tokio::test]
    async fn exhaustion_blocks_until_release() {
        let pool = BufferPool::new(1, 16);
        let held = pool.acquire().await;

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "acquire must block while exhausted");

        drop(held);
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("acquire should wake after release")
            .unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn oversized_buffers_are_not_pooled() {
        let pool = BufferPool::new(1, 16);

        let mut a = pool.acquire().await;
        a.reserve(16 * 64);
        drop(a);

        let b = pool.acquire().await;
        assert!(b.capacity() < 16 * 64);
    }
}
