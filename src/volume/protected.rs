//! Protected system sectors of a filtered drive.
//!
//! Some sectors of a system drive (the GPT area on a drive booted through a
//! pre-boot environment) must look to the running system as they did when
//! the drive was set up. Their saved contents are substituted into every
//! read that touches them and writes over them are refused.

use crate::error::{QueueError, Result};
use crate::volume::region::{get_intersection, is_unit_aligned, regions_overlap};

/// Saved contents of one protected sector range.
#[derive(Clone, PartialEq, Eq)]
struct SavedSectors {
    start: u64,
    end: u64,
    data: Vec<u8>,
}

impl std::fmt::Debug for SavedSectors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SavedSectors")
            .field("start", &self.start)
            .field("end", &self.end)
            .finish()
    }
}

/// Sector ranges whose reads are served from saved contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtectedSectors {
    ranges: Vec<SavedSectors>,
}

impl ProtectedSectors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Protects `data.len()` bytes at device offset `start`.
    ///
    /// # Errors
    ///
    /// [`QueueError::Alignment`] unless both are data unit aligned,
    /// [`QueueError::OutOfRange`] for an empty range or one past the end of
    /// the address space.
    pub fn add(&mut self, start: u64, data: Vec<u8>) -> Result<()> {
        let length = data.len() as u64;
        if length == 0 {
            return Err(QueueError::OutOfRange);
        }
        if !is_unit_aligned(start) || !is_unit_aligned(length) {
            return Err(QueueError::Alignment);
        }
        let end = start
            .checked_add(length - 1)
            .ok_or(QueueError::OutOfRange)?;

        self.ranges.push(SavedSectors { start, end, data });
        Ok(())
    }

    pub fn with_range(mut self, start: u64, data: Vec<u8>) -> Result<Self> {
        self.add(start, data)?;
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Whether `length` bytes at `offset` touch a protected sector.
    pub fn overlaps(&self, offset: u64, length: u64) -> bool {
        if length == 0 {
            return false;
        }
        let end = offset.saturating_add(length - 1);
        self.ranges
            .iter()
            .any(|range| regions_overlap(offset, end, range.start, range.end))
    }

    /// Copies the saved contents over the protected parts of `buffer`, which
    /// holds the device bytes at `offset`.
    ///
    /// Returns true if any byte was replaced.
    pub fn substitute(&self, buffer: &mut [u8], offset: u64) -> bool {
        let mut replaced = false;

        for range in &self.ranges {
            let (start, length) = get_intersection(offset, buffer.len() as u64, range.start, range.end);
            if length == 0 {
                continue;
            }

            let at = (start - offset) as usize;
            let from = (start - range.start) as usize;
            let length = length as usize;
            buffer[at..at + length].copy_from_slice(&range.data[from..from + length]);
            replaced = true;
        }

        replaced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sectors() -> ProtectedSectors {
        ProtectedSectors::new()
            .with_range(1024, vec![0xAA; 1024])
            .unwrap()
    }

    #[test]
    fn test_add_validation() {
        let mut sectors = ProtectedSectors::new();
        assert!(matches!(sectors.add(0, Vec::new()), Err(QueueError::OutOfRange)));
        assert!(matches!(sectors.add(100, vec![0; 512]), Err(QueueError::Alignment)));
        assert!(matches!(sectors.add(0, vec![0; 100]), Err(QueueError::Alignment)));
        assert!(matches!(
            sectors.add(u64::MAX - 511, vec![0; 1024]),
            Err(QueueError::OutOfRange)
        ));
        assert!(sectors.is_empty());
    }

    #[test]
    fn test_overlaps() {
        let sectors = sectors();
        assert!(!sectors.overlaps(0, 1024));
        assert!(sectors.overlaps(0, 1536));
        assert!(sectors.overlaps(1536, 512));
        assert!(!sectors.overlaps(2048, 4096));
        assert!(!sectors.overlaps(1024, 0));
    }

    #[test]
    fn test_substitute_partial_overlap() {
        let sectors = ProtectedSectors::new()
            .with_range(1024, (0..1024).map(|i| (i / 512) as u8 + 1).collect())
            .unwrap();

        // Buffer covers [1536, 3071]: the second protected sector, then plain data
        let mut buffer = vec![0u8; 1536];
        assert!(sectors.substitute(&mut buffer, 1536));
        assert!(buffer[..512].iter().all(|b| *b == 2));
        assert!(buffer[512..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_substitute_outside_is_untouched() {
        let sectors = sectors();
        let mut buffer = vec![7u8; 1024];
        assert!(!sectors.substitute(&mut buffer, 4096));
        assert!(buffer.iter().all(|b| *b == 7));
    }
}
