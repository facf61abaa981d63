//! Durable record of the encrypted area bound.
//!
//! The conversion engine persists the area every few megabytes of progress
//! so that an interrupted run resumes where it stopped. The record layout is
//! fixed:
//!
//! | Offset | Size | Field                      |
//! |--------|------|----------------------------|
//! | 0      | 8    | area start (LE)            |
//! | 8      | 8    | area end, inclusive (LE)   |
//! | 16     | 4    | CRC32C of bytes 0..16 (LE) |
//!
//! An all-zero record means no encrypted area.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use super::Result;
use crate::error::ConversionError;
use crate::volume::{AreaBounds, BlockDevice};

/// Size of an encoded [`RegionRecord`].
pub const REGION_RECORD_SIZE: usize = 20;

/// Persisted bounds of the encrypted area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionRecord {
    pub start: u64,
    pub end: u64,
}

impl RegionRecord {
    /// Record of a non-empty area with `end > start`, as the header stores it.
    pub fn from_bounds(bounds: AreaBounds) -> Option<Self> {
        if bounds.is_empty() || bounds.end <= bounds.start {
            return None;
        }
        Some(Self {
            start: bounds.start as u64,
            end: bounds.end as u64,
        })
    }

    pub fn bounds(&self) -> AreaBounds {
        AreaBounds::new(self.start, self.end)
    }

    /// Number of encrypted bytes.
    pub fn length(&self) -> u64 {
        self.end + 1 - self.start
    }

    pub fn to_bytes(&self) -> [u8; REGION_RECORD_SIZE] {
        let mut bytes = [0u8; REGION_RECORD_SIZE];
        bytes[0..8].copy_from_slice(&self.start.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.end.to_le_bytes());
        let checksum = crc32c::crc32c(&bytes[0..16]);
        bytes[16..20].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }

    /// Decodes a record. An all-zero record decodes to `None`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Option<Self>> {
        let bytes: &[u8; REGION_RECORD_SIZE] = bytes
            .get(..REGION_RECORD_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| ConversionError::Persist("region record truncated".to_string()))?;

        if bytes.iter().all(|&b| b == 0) {
            return Ok(None);
        }

        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[0..8]);
        let start = u64::from_le_bytes(word);
        word.copy_from_slice(&bytes[8..16]);
        let end = u64::from_le_bytes(word);

        let stored = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        if stored != crc32c::crc32c(&bytes[0..16]) {
            return Err(ConversionError::Checksum);
        }

        Ok(Some(Self { start, end }))
    }
}

/// Durable store of the encrypted area record.
pub trait PersistHeader: Send + Sync {
    /// Records `record`; `None` removes the encrypted area marker.
    fn persist_region(&self, record: Option<RegionRecord>) -> Result<()>;

    /// Loads the last persisted record.
    fn load_region(&self) -> Result<Option<RegionRecord>>;
}

/// In-memory store, with a switch to make persisting fail.
#[derive(Debug, Default)]
pub struct MemoryHeaderStore {
    record: Mutex<Option<RegionRecord>>,
    writes: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryHeaderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: RegionRecord) -> Self {
        let store = Self::new();
        if let Ok(mut slot) = store.record.lock() {
            *slot = Some(record);
        }
        store
    }

    /// Makes subsequent persists fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful persists.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl PersistHeader for MemoryHeaderStore {
    fn persist_region(&self, record: Option<RegionRecord>) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConversionError::Persist("header store unavailable".to_string()));
        }
        let mut slot = self
            .record
            .lock()
            .map_err(|_| ConversionError::Persist("header store lock poisoned".to_string()))?;
        *slot = record;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load_region(&self) -> Result<Option<RegionRecord>> {
        self.record
            .lock()
            .map(|slot| *slot)
            .map_err(|_| ConversionError::Persist("header store lock poisoned".to_string()))
    }
}

/// Store writing the record at a fixed offset of a block device.
///
/// The record is written within a full sector so that devices which only
/// accept sector-sized I/O can host it.
pub struct DeviceHeaderStore {
    device: Arc<dyn BlockDevice>,
    offset: u64,
}

impl DeviceHeaderStore {
    pub fn new(device: Arc<dyn BlockDevice>, offset: u64) -> Self {
        Self { device, offset }
    }
}

impl PersistHeader for DeviceHeaderStore {
    fn persist_region(&self, record: Option<RegionRecord>) -> Result<()> {
        let mut sector = vec![0u8; self.device.sector_size().max(REGION_RECORD_SIZE)];
        if let Some(record) = record {
            sector[..REGION_RECORD_SIZE].copy_from_slice(&record.to_bytes());
        }

        debug!("Persisting encrypted area {:?} at offset {}", record, self.offset);
        self.device
            .write_at(self.offset, &sector)
            .and_then(|()| self.device.flush())
            .map_err(|e| ConversionError::Persist(e.to_string()))
    }

    fn load_region(&self) -> Result<Option<RegionRecord>> {
        let mut bytes = [0u8; REGION_RECORD_SIZE];
        let read = self
            .device
            .read_at(self.offset, &mut bytes)
            .map_err(|e| ConversionError::Persist(e.to_string()))?;
        if read < REGION_RECORD_SIZE {
            return Ok(None);
        }
        RegionRecord::from_bytes(&bytes)
    }
}
