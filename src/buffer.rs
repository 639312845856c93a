//! Fixed-size DMA-style block pool and refcounted block handles.
//!
//! The pool owns a fixed set of equally sized blocks. Acquiring yields a
//! [`BufferHandle`]; the last handle referring to a block returns it to the
//! pool. Handles never copy: sharing is an explicit refcount clone
//! ([`BufferHandle::clone_ref`]), moving transfers the release duty.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{MediaError, MediaResult};

/// Backing allocation type, mirroring the vendor pool API. The software
/// pool treats both the same; the distinction matters to real hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocKind {
    /// DMA-capable memory reachable by the media blocks.
    #[default]
    Dma,
    /// Plain heap memory, CPU-only.
    Heap,
}

struct PoolShared {
    name: String,
    block_bytes: usize,
    total: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    available: Condvar,
    outstanding: AtomicUsize,
    closed: AtomicBool,
}

impl PoolShared {
    fn release(&self, block: Box<[u8]>) {
        let mut free = self.free.lock();
        free.push(block);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.available.notify_one();
    }
}

/// Fixed-capacity block pool. Cloning the pool value shares the same
/// underlying pool; the blocks are freed when the last clone and the last
/// outstanding handle are gone.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolShared>,
}

impl BufferPool {
    /// Allocates `count` DMA-capable blocks of `block_bytes` each.
    pub fn create(name: &str, block_bytes: usize, count: usize) -> MediaResult<Self> {
        Self::create_kind(name, block_bytes, count, AllocKind::Dma)
    }

    pub fn create_kind(
        name: &str,
        block_bytes: usize,
        count: usize,
        alloc: AllocKind,
    ) -> MediaResult<Self> {
        if block_bytes == 0 || count == 0 {
            return Err(MediaError::ResourceExhausted(format!(
                "pool '{}': invalid geometry {}x{}",
                name, count, block_bytes
            )));
        }
        let free: Vec<Box<[u8]>> = (0..count)
            .map(|_| vec![0u8; block_bytes].into_boxed_slice())
            .collect();
        debug!(pool = %name, blocks = count, block_bytes, kind = ?alloc, "buffer pool created");
        Ok(Self {
            inner: Arc::new(PoolShared {
                name: name.to_string(),
                block_bytes,
                total: count,
                free: Mutex::new(free),
                available: Condvar::new(),
                outstanding: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Acquires a block. With `blocking = false` an empty pool reports
    /// [`MediaError::WouldBlock`]; with `blocking = true` the call waits
    /// until a block is released or the pool is closed.
    pub fn acquire(&self, bytes: usize, blocking: bool) -> MediaResult<BufferHandle> {
        if blocking {
            self.acquire_inner(bytes, None)
        } else {
            self.acquire_inner(bytes, Some(Duration::ZERO))
        }
    }

    /// Bounded-wait acquire; an exhausted wait reports `WouldBlock`.
    pub fn acquire_timeout(&self, bytes: usize, timeout: Duration) -> MediaResult<BufferHandle> {
        self.acquire_inner(bytes, Some(timeout))
    }

    fn acquire_inner(&self, bytes: usize, timeout: Option<Duration>) -> MediaResult<BufferHandle> {
        if bytes > self.inner.block_bytes {
            return Err(MediaError::ResourceExhausted(format!(
                "pool '{}': requested {} > block size {}",
                self.inner.name, bytes, self.inner.block_bytes
            )));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut free = self.inner.free.lock();
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(MediaError::Cancelled);
            }
            if let Some(block) = free.pop() {
                self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
                return Ok(BufferHandle {
                    slot: Arc::new(Slot {
                        pool: Arc::clone(&self.inner),
                        storage: Some(block),
                        len: bytes,
                        vir: OnceCell::new(),
                    }),
                });
            }
            match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(MediaError::WouldBlock);
                    }
                    if self.inner.available.wait_for(&mut free, d - now).timed_out()
                        && free.is_empty()
                    {
                        return Err(MediaError::WouldBlock);
                    }
                }
                None => self.inner.available.wait(&mut free),
            }
        }
    }

    /// Wakes every blocked acquirer with `Cancelled`. Outstanding handles
    /// stay valid and still return their blocks on drop.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.available.notify_all();
    }

    /// Number of blocks currently held by handles.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.inner.total
    }

    pub fn block_bytes(&self) -> usize {
        self.inner.block_bytes
    }
}

struct Slot {
    pool: Arc<PoolShared>,
    storage: Option<Box<[u8]>>,
    len: usize,
    vir: OnceCell<usize>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(block) = self.storage.take() {
            self.pool.release(block);
        }
    }
}

/// Refcounted handle to one pool block. The block returns to its pool when
/// the last handle referring to it drops.
pub struct BufferHandle {
    slot: Arc<Slot>,
}

impl BufferHandle {
    /// Shares the block by cloning the refcount. The underlying block is
    /// released only once, by the last surviving handle.
    pub fn clone_ref(&self) -> BufferHandle {
        BufferHandle {
            slot: Arc::clone(&self.slot),
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.slot.len
    }

    pub fn data(&self) -> &[u8] {
        match self.slot.storage.as_deref() {
            Some(b) => &b[..self.slot.len],
            None => &[],
        }
    }

    /// Mutable access; available only while the handle is unshared.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        let slot = Arc::get_mut(&mut self.slot)?;
        let len = slot.len;
        slot.storage.as_deref_mut().map(|b| &mut b[..len])
    }

    /// Mapped address of the block, resolved once and cached.
    pub fn virtual_address(&self) -> usize {
        *self.slot.vir.get_or_init(|| {
            self.slot
                .storage
                .as_deref()
                .map(|b| b.as_ptr() as usize)
                .unwrap_or(0)
        })
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHandle")
            .field("len", &self.slot.len)
            .field("pool", &self.slot.pool.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn acquire_release_conserves_blocks() {
        let pool = BufferPool::create("t", 64, 4).unwrap();
        {
            let a = pool.acquire(64, true).unwrap();
            let b = pool.acquire(32, true).unwrap();
            assert_eq!(pool.outstanding(), 2);
            drop(a);
            drop(b);
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn nonblocking_empty_pool_would_block() {
        let pool = BufferPool::create("t", 16, 1).unwrap();
        let _held = pool.acquire(16, true).unwrap();
        match pool.acquire(16, false) {
            Err(MediaError::WouldBlock) => {}
            other => panic!("expected WouldBlock, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn oversized_request_rejected() {
        let pool = BufferPool::create("t", 16, 1).unwrap();
        assert!(matches!(
            pool.acquire(17, true),
            Err(MediaError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn clone_ref_releases_once_on_last_drop() {
        let pool = BufferPool::create("t", 16, 1).unwrap();
        let a = pool.acquire(16, true).unwrap();
        let b = a.clone_ref();
        drop(a);
        assert_eq!(pool.outstanding(), 1, "shared block must stay out");
        drop(b);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn data_mut_requires_unique_handle() {
        let pool = BufferPool::create("t", 16, 1).unwrap();
        let mut a = pool.acquire(16, true).unwrap();
        assert!(a.data_mut().is_some());
        let b = a.clone_ref();
        assert!(a.data_mut().is_none());
        drop(b);
        assert!(a.data_mut().is_some());
    }

    #[test]
    fn virtual_address_is_cached_and_stable() {
        let pool = BufferPool::create("t", 16, 1).unwrap();
        let h = pool.acquire(16, true).unwrap();
        let first = h.virtual_address();
        assert_ne!(first, 0);
        assert_eq!(first, h.virtual_address());
    }

    #[test]
    fn capacity_one_under_concurrent_acquire() {
        let pool = BufferPool::create("t", 16, 1).unwrap();
        let held = pool.acquire(16, true).unwrap();
        let p2 = pool.clone();
        let waiter = thread::spawn(move || p2.acquire_timeout(16, Duration::from_secs(2)));
        thread::sleep(Duration::from_millis(50));
        drop(held);
        let got = waiter.join().unwrap();
        assert!(got.is_ok(), "waiter must win the released block");
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn timed_acquire_expires() {
        let pool = BufferPool::create("t", 16, 1).unwrap();
        let _held = pool.acquire(16, true).unwrap();
        let start = Instant::now();
        let r = pool.acquire_timeout(16, Duration::from_millis(50));
        assert!(matches!(r, Err(MediaError::WouldBlock)));
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn close_unblocks_waiters() {
        let pool = BufferPool::create("t", 16, 1).unwrap();
        let _held = pool.acquire(16, true).unwrap();
        let p2 = pool.clone();
        let waiter = thread::spawn(move || p2.acquire(16, true));
        thread::sleep(Duration::from_millis(50));
        pool.close();
        assert!(matches!(waiter.join().unwrap(), Err(MediaError::Cancelled)));
    }

    #[test]
    fn randomized_cross_thread_conservation() {
        let pool = BufferPool::create("t", 128, 8) .unwrap();
        let mut joins = Vec::new();
        for t in 0..4 {
            let p = pool.clone();
            joins.push(thread::spawn(move || {
                for i in 0..200 {
                    if let Ok(mut h) = p.acquire_timeout(64, Duration::from_millis(100)) {
                        if let Some(d) = h.data_mut() {
                            d[0] = (t * i) as u8;
                        }
                        if i % 3 == 0 {
                            let extra = h.clone_ref();
                            drop(h);
                            drop(extra);
                        }
                    }
                }
            }));
        }
        for j in joins {
            j.join().unwrap();
        }
        assert_eq!(pool.outstanding(), 0, "all blocks must return at steady state");
    }
}
