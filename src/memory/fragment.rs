//! Ring of in-flight fragment buffers.
//!
//! Submission stages the payload of one fragment in a buffer of the ring and
//! hands it to the device I/O stage. Buffers are taken in strict rotation, so
//! with the default depth of two, encryption of fragment N+1 overlaps the
//! device access of fragment N and nothing more is ever in flight.

use std::sync::{Condvar, Mutex};

use zeroize::Zeroize;

use crate::error::{QueueError, Result};

/// One buffer of the ring, owned by exactly one pipeline stage.
pub struct FragmentBuffer {
    index: usize,
    data: Vec<u8>,
}

impl FragmentBuffer {
    /// Position of the buffer in the ring.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The first `len` bytes.
    pub fn slice(&self, len: usize) -> &[u8] {
        &self.data[..len]
    }

    /// The first `len` bytes, mutable.
    pub fn slice_mut(&mut self, len: usize) -> &mut [u8] {
        &mut self.data[..len]
    }
}

impl std::fmt::Debug for FragmentBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentBuffer")
            .field("index", &self.index)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Fixed-depth ring of fragment buffers.
pub struct FragmentBuffers {
    slots: Mutex<Vec<Option<Vec<u8>>>>,
    freed: Condvar,
    buffer_size: usize,
}

impl FragmentBuffers {
    /// Allocates `depth` buffers of `buffer_size` bytes.
    ///
    /// # Errors
    ///
    /// [`QueueError::ResourceExhaustion`] if any buffer cannot be allocated.
    pub fn new(depth: usize, buffer_size: usize) -> Result<Self> {
        let depth = depth.max(1);
        let mut slots = Vec::with_capacity(depth);
        for _ in 0..depth {
            let mut data = Vec::new();
            data.try_reserve_exact(buffer_size)
                .map_err(|_| QueueError::ResourceExhaustion(buffer_size))?;
            data.resize(buffer_size, 0);
            slots.push(Some(data));
        }

        Ok(Self {
            slots: Mutex::new(slots),
            freed: Condvar::new(),
            buffer_size,
        })
    }

    /// Number of buffers in the ring.
    pub fn depth(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Size of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Index following `index` in the rotation.
    pub fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.depth().max(1)
    }

    /// Takes buffer `index`, blocking until it is free.
    pub fn acquire(&self, index: usize) -> Result<FragmentBuffer> {
        let mut slots = self.slots.lock().map_err(|_| QueueError::LockPoisoned)?;
        if index >= slots.len() {
            return Err(QueueError::InvalidState("fragment buffer index out of range"));
        }

        loop {
            if let Some(data) = slots[index].take() {
                return Ok(FragmentBuffer { index, data });
            }
            slots = self.freed.wait(slots).map_err(|_| QueueError::LockPoisoned)?;
        }
    }

    /// Returns a buffer to the ring.
    pub fn release(&self, buffer: FragmentBuffer) {
        if let Ok(mut slots) = self.slots.lock() {
            slots[buffer.index] = Some(buffer.data);
        }
        self.freed.notify_all();
    }

    /// Number of buffers currently free.
    pub fn free_count(&self) -> usize {
        self.slots
            .lock()
            .map(|s| s.iter().filter(|b| b.is_some()).count())
            .unwrap_or(0)
    }
}

impl Drop for FragmentBuffers {
    fn drop(&mut self) {
        if let Ok(slots) = self.slots.get_mut() {
            for data in slots.iter_mut().flatten() {
                data.zeroize();
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
    fn test_rotation() {
        let buffers = FragmentBuffers::new(2, 1024).unwrap();
        assert_eq!(buffers.depth(), 2);
        assert_eq!(buffers.next_index(0), 1);
        assert_eq!(buffers.next_index(1), 0);
    }

    #[test]
    fn test_acquire_release() {
        let buffers = FragmentBuffers::new(2, 1024).unwrap();
        let a = buffers.acquire(0).unwrap();
        let b = buffers.acquire(1).unwrap();
        assert_eq!(buffers.free_count(), 0);
        assert_eq!(a.slice(1024).len(), 1024);

        buffers.release(a);
        buffers.release(b);
        assert_eq!(buffers.free_count(), 2);
    }

    #[test]
    fn test_acquire_waits_for_same_index() {
        let buffers = Arc::new(FragmentBuffers::new(2, 512).unwrap());
        let held = buffers.acquire(0).unwrap();

        let waiter_buffers = Arc::clone(&buffers);
        let waiter = thread::spawn(move || {
            let buffer = waiter_buffers.acquire(0).unwrap();
            let index = buffer.index();
            waiter_buffers.release(buffer);
            index
        });

        // The other buffer stays available meanwhile
        let other = buffers.acquire(1).unwrap();
        buffers.release(other);

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        buffers.release(held);
        assert_eq!(waiter.join().unwrap(), 0);
    }

    #[test]
    fn test_index_out_of_range() {
        let buffers = FragmentBuffers::new(2, 512).unwrap();
        assert!(matches!(buffers.acquire(2), Err(QueueError::InvalidState(_))));
    }

    #[test]
    fn test_allocation_failure() {
        let result = FragmentBuffers::new(2, usize::MAX);
        assert!(matches!(result, Err(QueueError::ResourceExhaustion(_))));
    }
}
