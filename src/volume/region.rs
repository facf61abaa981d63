//! Encrypted area bounds and the address arithmetic around them.
//!
//! An area is an inclusive byte range `[start, end]`. The value `-1` in
//! either bound marks the area as empty; the conversion engine relies on
//! `start` being set while `end` is still `-1` at the beginning of an
//! encryption run.

use std::sync::RwLock;

use crate::config::DATA_UNIT_SIZE;
use crate::error::{QueueError, Result};

/// Bound value marking an empty area.
pub const AREA_EMPTY: i64 = -1;

/// Inclusive byte range on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AreaBounds {
    pub start: i64,
    pub end: i64,
}

impl AreaBounds {
    /// The empty area.
    pub const EMPTY: AreaBounds = AreaBounds {
        start: AREA_EMPTY,
        end: AREA_EMPTY,
    };

    /// Area covering `[start, end]`.
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start: start as i64,
            end: end as i64,
        }
    }

    /// Area covering `length` bytes from `start`. Empty when `length` is 0.
    pub fn with_length(start: u64, length: u64) -> Self {
        if length == 0 {
            return Self::EMPTY;
        }
        Self::new(start, start + length - 1)
    }

    /// True when either bound carries the empty marker.
    pub fn is_empty(&self) -> bool {
        self.start == AREA_EMPTY || self.end == AREA_EMPTY
    }

    /// The bounds as unsigned offsets, or `None` when empty.
    pub fn range(&self) -> Option<(u64, u64)> {
        if self.is_empty() || self.start > self.end {
            return None;
        }
        Some((self.start as u64, self.end as u64))
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.range().map(|(s, e)| e - s + 1).unwrap_or(0)
    }
}

/// Area bounds shared between the pipeline stages and the conversion engine.
///
/// Readers take a copy. Writers only update while the queue is held.
#[derive(Debug)]
pub struct SharedBounds {
    inner: RwLock<AreaBounds>,
}

impl SharedBounds {
    pub fn new(bounds: AreaBounds) -> Self {
        Self {
            inner: RwLock::new(bounds),
        }
    }

    /// Snapshot of the current bounds.
    pub fn get(&self) -> Result<AreaBounds> {
        self.inner
            .read()
            .map(|b| *b)
            .map_err(|_| QueueError::LockPoisoned)
    }

    pub fn set(&self, bounds: AreaBounds) -> Result<()> {
        let mut guard = self.inner.write().map_err(|_| QueueError::LockPoisoned)?;
        *guard = bounds;
        Ok(())
    }

    pub fn set_start(&self, start: i64) -> Result<()> {
        let mut guard = self.inner.write().map_err(|_| QueueError::LockPoisoned)?;
        guard.start = start;
        Ok(())
    }

    pub fn set_end(&self, end: i64) -> Result<()> {
        let mut guard = self.inner.write().map_err(|_| QueueError::LockPoisoned)?;
        guard.end = end;
        Ok(())
    }
}

/// Whether `[start1, end1]` and `[start2, end2]` share at least one byte.
pub fn regions_overlap(start1: u64, end1: u64, start2: u64, end2: u64) -> bool {
    if start1 < start2 {
        end1 >= start2
    } else {
        start1 <= end2
    }
}

/// Intersection of `length1` bytes at `start1` with `[start2, end2]`.
///
/// Returns `(start, length)`. When the ranges do not intersect the length is
/// 0 and the start is `start1`, not a clipped value.
pub fn get_intersection(start1: u64, length1: u64, start2: u64, end2: u64) -> (u64, u64) {
    if length1 == 0 {
        return (start1, 0);
    }

    let end1 = start1 + length1 - 1;
    let intersect_end = end1.min(end2);
    let intersect_start = start1.max(start2);

    if intersect_start > intersect_end {
        (start1, 0)
    } else {
        (intersect_start, intersect_end + 1 - intersect_start)
    }
}

/// Data unit index of an absolute byte offset.
pub fn data_unit_index(offset: u64) -> u64 {
    offset / DATA_UNIT_SIZE as u64
}

/// Whether `value` is a multiple of the data unit size.
pub fn is_unit_aligned(value: u64) -> bool {
    value % DATA_UNIT_SIZE as u64 == 0
}

/// One physical access of a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalAccess {
    /// Offset within the fragment buffer.
    pub buffer_offset: usize,
    /// Absolute device offset.
    pub device_offset: u64,
    /// Length in bytes.
    pub length: usize,
}

/// Splits a fragment into physical accesses when the encrypted area is remapped.
///
/// Only the encrypted sub-range `[encrypted_offset, encrypted_offset + encrypted_length)`
/// of the fragment is shifted by `remapped_offset`. The leading and trailing
/// plaintext parts keep their address. Empty parts are omitted.
pub fn split_remapped(
    offset: u64,
    length: usize,
    encrypted_offset: usize,
    encrypted_length: usize,
    remapped_offset: i64,
) -> Result<Vec<PhysicalAccess>> {
    let shift = |device_offset: u64| {
        device_offset
            .checked_add_signed(remapped_offset)
            .ok_or(QueueError::OutOfRange)
    };

    if encrypted_length == 0 {
        return Ok(vec![PhysicalAccess {
            buffer_offset: 0,
            device_offset: offset,
            length,
        }]);
    }

    if encrypted_length == length {
        return Ok(vec![PhysicalAccess {
            buffer_offset: 0,
            device_offset: shift(offset)?,
            length,
        }]);
    }

    let mut accesses = Vec::with_capacity(3);
    if encrypted_offset > 0 {
        accesses.push(PhysicalAccess {
            buffer_offset: 0,
            device_offset: offset,
            length: encrypted_offset,
        });
    }

    accesses.push(PhysicalAccess {
        buffer_offset: encrypted_offset,
        device_offset: shift(offset + encrypted_offset as u64)?,
        length: encrypted_length,
    });

    let tail = encrypted_offset + encrypted_length;
    if tail < length {
        accesses.push(PhysicalAccess {
            buffer_offset: tail,
            device_offset: offset + tail as u64,
            length: length - tail,
        });
    }

    Ok(accesses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_bounds() {
        assert!(AreaBounds::EMPTY.is_empty());
        assert_eq!(AreaBounds::EMPTY.len(), 0);

        let half = AreaBounds { start: 0, end: AREA_EMPTY };
        assert!(half.is_empty());
        assert_eq!(half.range(), None);

        assert_eq!(AreaBounds::with_length(512, 0), AreaBounds::EMPTY);
    }

    #[test]
    fn test_bounds_range() {
        let bounds = AreaBounds::with_length(1024, 2048);
        assert_eq!(bounds.range(), Some((1024, 3071)));
        assert_eq!(bounds.len(), 2048);
    }

    #[test]
    fn test_regions_overlap() {
        assert!(regions_overlap(0, 511, 511, 1023));
        assert!(!regions_overlap(0, 511, 512, 1023));
        assert!(regions_overlap(600, 700, 512, 1023));
        assert!(!regions_overlap(1024, 2047, 0, 1023));
        assert!(regions_overlap(0, u64::MAX, 10, 10));
    }

    #[test]
    fn test_intersection_inside() {
        assert_eq!(get_intersection(1024, 1024, 0, 10_000), (1024, 1024));
        assert_eq!(get_intersection(0, 4096, 1024, 2047), (1024, 1024));
        assert_eq!(get_intersection(0, 2048, 1024, 8191), (1024, 1024));
    }

    #[test]
    fn test_intersection_empty_keeps_fragment_start() {
        assert_eq!(get_intersection(4096, 512, 0, 1023), (4096, 0));
        assert_eq!(get_intersection(0, 512, 1024, 2047), (0, 0));
    }

    #[test]
    fn test_data_unit_index() {
        assert_eq!(data_unit_index(0), 0);
        assert_eq!(data_unit_index(511), 0);
        assert_eq!(data_unit_index(1536), 3);
        assert!(is_unit_aligned(4096));
        assert!(!is_unit_aligned(100));
    }

    #[test]
    fn test_split_remapped_partial() {
        let accesses = split_remapped(1024, 4096, 1024, 2048, 1 << 20).unwrap();
        assert_eq!(
            accesses,
            vec![
                PhysicalAccess { buffer_offset: 0, device_offset: 1024, length: 1024 },
                PhysicalAccess { buffer_offset: 1024, device_offset: 2048 + (1 << 20), length: 2048 },
                PhysicalAccess { buffer_offset: 3072, device_offset: 4096, length: 1024 },
            ]
        );
    }

    #[test]
    fn test_split_remapped_whole_fragment() {
        let accesses = split_remapped(8192, 2048, 0, 2048, -4096).unwrap();
        assert_eq!(
            accesses,
            vec![PhysicalAccess { buffer_offset: 0, device_offset: 4096, length: 2048 }]
        );
    }

    #[test]
    fn test_split_remapped_underflow() {
        let result = split_remapped(0, 1024, 512, 512, -1 << 20);
        assert!(matches!(result, Err(QueueError::OutOfRange)));
    }

    #[test]
    fn test_shared_bounds() {
        let shared = SharedBounds::new(AreaBounds::EMPTY);
        shared.set_start(0).unwrap();
        assert!(shared.get().unwrap().is_empty());
        shared.set_end(4095).unwrap();
        assert_eq!(shared.get().unwrap().range(), Some((0, 4095)));
    }
}
