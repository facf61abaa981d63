//! Single-slot read-ahead cache.
//!
//! The slot holds raw device bytes (ciphertext where the area is encrypted)
//! and is keyed by device offset. Decryption always happens after a read, so
//! a hit is indistinguishable from a device read. Writes, holds and
//! conversion steps invalidate the slot.

use std::sync::Mutex;

use log::debug;

use crate::error::{QueueError, Result};
use crate::volume::BlockDevice;

struct SlotState {
    valid: bool,
    offset: u64,
    length: usize,
    buffer: Vec<u8>,
    last_read_offset: u64,
    last_read_length: usize,
    hits: u64,
}

/// Read-ahead slot shared by the device I/O stage and the quiescence controller.
pub(crate) struct ReadAheadCache {
    state: Mutex<SlotState>,
}

impl ReadAheadCache {
    pub fn new(capacity: usize) -> Result<Self> {
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(capacity)
            .map_err(|_| QueueError::ResourceExhaustion(capacity))?;
        buffer.resize(capacity, 0);

        Ok(Self {
            state: Mutex::new(SlotState {
                valid: false,
                offset: 0,
                length: 0,
                buffer,
                last_read_offset: 0,
                last_read_length: 0,
                hits: 0,
            }),
        })
    }

    pub fn invalidate(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.valid = false;
        }
    }

    /// Offset and length of the most recent read.
    pub fn last_read(&self) -> (u64, usize) {
        self.state
            .lock()
            .map(|s| (s.last_read_offset, s.last_read_length))
            .unwrap_or((0, 0))
    }

    pub fn hits(&self) -> u64 {
        self.state.lock().map(|s| s.hits).unwrap_or(0)
    }

    /// Reads `buf.len()` bytes at `offset`, from the slot when it matches.
    ///
    /// Returns the number of bytes read.
    pub fn cached_read(&self, device: &dyn BlockDevice, offset: u64, buf: &mut [u8]) -> Result<usize> {
        {
            let mut state = self.state.lock().map_err(|_| QueueError::LockPoisoned)?;
            state.last_read_offset = offset;
            state.last_read_length = buf.len();

            if state.valid && state.offset == offset && state.length >= buf.len() {
                buf.copy_from_slice(&state.buffer[..buf.len()]);
                state.hits += 1;
                return Ok(buf.len());
            }
        }

        Ok(device.read_at(offset, buf)?)
    }

    /// Prefetches the region following the last read, if it ends at or
    /// before `max_offset`.
    pub fn prefetch(&self, device: &dyn BlockDevice, max_offset: u64) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };

        state.valid = false;
        let offset = state.last_read_offset + state.last_read_length as u64;
        let length = state.last_read_length.min(state.buffer.len());
        state.offset = offset;
        state.length = length;

        if offset + length as u64 > max_offset {
            return;
        }

        match device.read_at(offset, &mut state.buffer[..length]) {
            Ok(read) => {
                state.length = read;
                state.valid = read > 0;
            }
            Err(e) => debug!("Read-ahead at offset {} failed: {}", offset, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::MemoryDevice;

    fn device() -> MemoryDevice {
        let data: Vec<u8> = (0..8192u32).map(|i| (i / 512) as u8).collect();
        MemoryDevice::from_data(data)
    }

    #[test]
    fn test_miss_then_hit() {
        let device = device();
        let cache = ReadAheadCache::new(4096).unwrap();

        let mut buf = vec![0u8; 1024];
        cache.cached_read(&device, 0, &mut buf).unwrap();
        assert_eq!(cache.last_read(), (0, 1024));

        cache.prefetch(&device, 8192);
        let reads = device.read_count();

        cache.cached_read(&device, 1024, &mut buf).unwrap();
        assert_eq!(device.read_count(), reads);
        assert_eq!(cache.hits(), 1);
        assert_eq!(buf[0], 2);
        assert_eq!(buf[1023], 3);
    }

    #[test]
    fn test_offset_mismatch_misses() {
        let device = device();
        let cache = ReadAheadCache::new(4096).unwrap();

        let mut buf = vec![0u8; 512];
        cache.cached_read(&device, 0, &mut buf).unwrap();
        cache.prefetch(&device, 8192);

        cache.cached_read(&device, 1024, &mut buf).unwrap();
        assert_eq!(cache.hits(), 0);
        assert_eq!(buf[0], 2);
    }

    #[test]
    fn test_longer_request_misses() {
        let device = device();
        let cache = ReadAheadCache::new(4096).unwrap();

        let mut small = vec![0u8; 512];
        cache.cached_read(&device, 0, &mut small).unwrap();
        cache.prefetch(&device, 8192);

        let mut large = vec![0u8; 1024];
        cache.cached_read(&device, 512, &mut large).unwrap();
        assert_eq!(cache.hits(), 0);
    }

    #[test]
    fn test_prefetch_respects_limit() {
        let device = device();
        let cache = ReadAheadCache::new(4096).unwrap();

        let mut buf = vec![0u8; 1024];
        cache.cached_read(&device, 0, &mut buf).unwrap();
        cache.prefetch(&device, 1500);

        cache.cached_read(&device, 1024, &mut buf).unwrap();
        assert_eq!(cache.hits(), 0);
    }

    #[test]
    fn test_invalidate() {
        let device = device();
        let cache = ReadAheadCache::new(4096).unwrap();

        let mut buf = vec![0u8; 1024];
        cache.cached_read(&device, 0, &mut buf).unwrap();
        cache.prefetch(&device, 8192);
        cache.invalidate();

        cache.cached_read(&device, 1024, &mut buf).unwrap();
        assert_eq!(cache.hits(), 0);
    }
}
