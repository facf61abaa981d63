//! Size-keyed buffer pool for the I/O hot path.
//!
//! The pool is an append-only list of buffers. [`BufferPool::acquire`] hands
//! out a free buffer of exactly the requested size and only allocates when
//! no buffer of that size exists yet. Once a size is known, callers wait for
//! a [`BufferPool::release`] instead of growing the pool, which bounds steady
//! state memory to a few recurring sizes. During startup the pool always
//! grows so that preallocation can fill it.
//!
//! # Example
//!
//! ```
//! use secure_cryptor_queue::memory::pool::BufferPool;
//!
//! let pool = BufferPool::new();
//! pool.preallocate(4096, 2).unwrap();
//! pool.finish_startup();
//!
//! let buffer = pool.acquire(4096).unwrap();
//! assert_eq!(buffer.len(), 4096);
//! pool.release(buffer);
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};

use zeroize::Zeroize;

use crate::error::{QueueError, Result};

/// Buffer handed out by a [`BufferPool`].
///
/// Must be given back with [`BufferPool::release`]. A buffer that is dropped
/// instead keeps its slot marked in use.
pub struct PoolBuffer {
    slot: usize,
    data: Vec<u8>,
}

impl PoolBuffer {
    /// Index of the pool slot this buffer belongs to.
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Deref for PoolBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PoolBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("slot", &self.slot)
            .field("len", &self.data.len())
            .finish()
    }
}

struct PoolEntry {
    size: usize,
    /// `None` while the buffer is handed out.
    data: Option<Vec<u8>>,
}

struct PoolState {
    entries: Vec<PoolEntry>,
    starting: bool,
    waits: u64,
}

/// Statistics about pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of buffers ever allocated.
    pub buffers: usize,
    /// Buffers currently handed out.
    pub in_use: usize,
    /// Total bytes held by the pool.
    pub bytes_allocated: usize,
    /// Number of times a caller had to wait for a release.
    pub waits: u64,
}

/// Size-keyed freelist of reusable buffers.
pub struct BufferPool {
    state: Mutex<PoolState>,
    freed: Condvar,
}

impl BufferPool {
    /// Creates an empty pool in its starting phase.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState {
                entries: Vec::new(),
                starting: true,
                waits: 0,
            }),
            freed: Condvar::new(),
        }
    }

    /// Allocates `count` buffers of `size` bytes and leaves them free.
    ///
    /// Must be called before [`BufferPool::finish_startup`].
    pub fn preallocate(&self, size: usize, count: usize) -> Result<()> {
        let mut buffers = Vec::with_capacity(count);
        let mut result = Ok(());

        for _ in 0..count {
            match self.acquire(size) {
                Ok(buffer) => buffers.push(buffer),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        for buffer in buffers {
            self.release(buffer);
        }
        result
    }

    /// Ends the starting phase. From now on, a known size never grows the pool.
    pub fn finish_startup(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.starting = false;
        }
    }

    /// Returns a free buffer of exactly `size` bytes.
    ///
    /// Blocks while every buffer of that size is in use, unless the pool is
    /// still starting.
    ///
    /// # Errors
    ///
    /// [`QueueError::ResourceExhaustion`] if a new buffer cannot be allocated.
    pub fn acquire(&self, size: usize) -> Result<PoolBuffer> {
        let mut state = self.state.lock().map_err(|_| QueueError::LockPoisoned)?;

        loop {
            let mut size_known = false;
            for (slot, entry) in state.entries.iter_mut().enumerate() {
                if entry.size != size {
                    continue;
                }
                size_known = true;
                if let Some(data) = entry.data.take() {
                    return Ok(PoolBuffer { slot, data });
                }
            }

            if !size_known || state.starting {
                let data = Self::allocate(size)?;
                let slot = state.entries.len();
                state.entries.push(PoolEntry { size, data: None });
                return Ok(PoolBuffer { slot, data });
            }

            state.waits += 1;
            state = self.freed.wait(state).map_err(|_| QueueError::LockPoisoned)?;
        }
    }

    /// Returns a buffer to the pool and wakes waiters.
    pub fn release(&self, buffer: PoolBuffer) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(entry) = state.entries.get_mut(buffer.slot) {
                entry.data = Some(buffer.data);
            }
        }
        self.freed.notify_all();
    }

    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        match self.state.lock() {
            Ok(state) => PoolStats {
                buffers: state.entries.len(),
                in_use: state.entries.iter().filter(|e| e.data.is_none()).count(),
                bytes_allocated: state.entries.iter().map(|e| e.size).sum(),
                waits: state.waits,
            },
            Err(_) => PoolStats {
                buffers: 0,
                in_use: 0,
                bytes_allocated: 0,
                waits: 0,
            },
        }
    }

    fn allocate(size: usize) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| QueueError::ResourceExhaustion(size))?;
        data.resize(size, 0);
        Ok(data)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            for entry in state.entries.iter_mut() {
                if let Some(data) = entry.data.as_mut() {
                    data.zeroize();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_reuses_released_buffer() {
        let pool = BufferPool::new();
        pool.finish_startup();

        let buffer = pool.acquire(1024).unwrap();
        let slot = buffer.slot();
        pool.release(buffer);

        let buffer = pool.acquire(1024).unwrap();
        assert_eq!(buffer.slot(), slot);
        assert_eq!(pool.stats().buffers, 1);
        pool.release(buffer);
    }

    #[test]
    fn test_new_size_grows_pool() {
        let pool = BufferPool::new();
        pool.finish_startup();

        let a = pool.acquire(512).unwrap();
        let b = pool.acquire(1024).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.buffers, 2);
        assert_eq!(stats.in_use, 2);
        assert_eq!(stats.bytes_allocated, 1536);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn test_starting_pool_always_grows() {
        let pool = BufferPool::new();
        let a = pool.acquire(512).unwrap();
        let b = pool.acquire(512).unwrap();
        assert_ne!(a.slot(), b.slot());
        pool.release(a);
        pool.release(b);
    }

    #[test]
    fn test_preallocate() {
        let pool = BufferPool::new();
        pool.preallocate(4096, 8).unwrap();
        pool.finish_startup();

        let stats = pool.stats();
        assert_eq!(stats.buffers, 8);
        assert_eq!(stats.in_use, 0);
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let pool = Arc::new(BufferPool::new());
        pool.preallocate(512, 1).unwrap();
        pool.finish_startup();

        let held = pool.acquire(512).unwrap();

        let waiter_pool = Arc::clone(&pool);
        let waiter = thread::spawn(move || {
            let buffer = waiter_pool.acquire(512).unwrap();
            let slot = buffer.slot();
            waiter_pool.release(buffer);
            slot
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        let slot = held.slot();
        pool.release(held);
        assert_eq!(waiter.join().unwrap(), slot);
        assert_eq!(pool.stats().buffers, 1);
        assert!(pool.stats().waits >= 1);
    }

    #[test]
    fn test_allocation_failure() {
        let pool = BufferPool::new();
        let result = pool.acquire(usize::MAX);
        assert!(matches!(result, Err(QueueError::ResourceExhaustion(usize::MAX))));
        assert_eq!(pool.stats().buffers, 0);
    }
}
