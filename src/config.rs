//! Configuration for the encrypted I/O queue and the conversion engine.
//!
//! This module defines the fixed constants of the on-device layout and the
//! tunable parameters of a queue instance.

use std::time::Duration;

use crate::volume::region::AreaBounds;

/// Size of one encryption data unit in bytes.
pub const DATA_UNIT_SIZE: usize = 512;

/// Largest fragment a request is split into (256 KiB).
pub const MAX_FRAGMENT_SIZE: usize = 256 * 1024;

/// Number of in-flight fragment buffers (A/B).
pub const FRAGMENT_BUFFER_DEPTH: usize = 2;

/// Fragment-size scratch buffers preallocated when a queue starts.
pub const PREALLOCATED_ITEM_COUNT: usize = 8;

/// Upper bound for a configured preallocation count.
pub const PREALLOCATED_ITEM_MAX_COUNT: usize = 8192;

/// Block size used by the conversion and wipe loops (1.5 MiB).
pub const SETUP_IO_BLOCK_SIZE: usize = 1536 * 1024;

/// Bytes converted between two region record updates (64 MiB).
pub const HEADER_UPDATE_THRESHOLD: u64 = 64 * 1024 * 1024;

/// Sectors reserved for the boot loader at the start of a system drive.
pub const BOOT_LOADER_AREA_SECTOR_COUNT: u64 = 63;

/// Byte offset of the boot volume header sector.
pub const BOOT_VOLUME_HEADER_OFFSET: u64 = 62 * DATA_UNIT_SIZE as u64;

/// Number of random characters chained between wipe passes.
pub const WIPE_RAND_CHAR_COUNT: usize = 3;

/// Hold timeout for the first quiescence request of a conversion.
pub const CONVERSION_START_HOLD_TIMEOUT: Duration = Duration::from_millis(1000);

/// Hold timeout for each conversion step.
pub const CONVERSION_STEP_HOLD_TIMEOUT: Duration = Duration::from_millis(500);

/// Hidden volume located inside a mounted outer volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectedRange {
    /// First protected byte (absolute device offset).
    pub offset: u64,
    /// Protected length in bytes.
    pub size: u64,
}

/// Parameters of a queue serving a mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeParams {
    /// Offset of the data area inside the container.
    pub data_area_offset: u64,
    /// Addressable length exposed to callers.
    pub virtual_length: u64,
    /// When set, the data area is only partially encrypted and the
    /// encrypted area bound applies. Otherwise every fragment is encrypted.
    pub partial_encryption: bool,
    /// Mounted as a hidden volume at this offset instead of the data area.
    pub hidden_volume_offset: Option<u64>,
    /// Hidden volume write protection for an outer volume mount.
    pub protection: Option<ProtectedRange>,
}

impl VolumeParams {
    /// A fully encrypted volume whose data area starts at `data_area_offset`.
    pub fn new(data_area_offset: u64, virtual_length: u64) -> Self {
        Self {
            data_area_offset,
            virtual_length,
            partial_encryption: false,
            hidden_volume_offset: None,
            protection: None,
        }
    }
}

/// Parameters of a queue filtering a whole system drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterParams {
    /// A hidden operating system is running from this drive.
    pub hidden_system: bool,
    /// Length of the drive area visible to the hidden system.
    pub drive_length: u64,
    /// Offset of the boot volume header sector.
    pub header_offset: u64,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            hidden_system: false,
            drive_length: u64::MAX,
            header_offset: BOOT_VOLUME_HEADER_OFFSET,
        }
    }
}

/// What kind of device the queue sits in front of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Drive filter. Offsets are absolute device offsets.
    Filter(FilterParams),
    /// Mounted volume. Offsets are relative to the data area.
    Volume(VolumeParams),
}

/// Address remapping of the encrypted area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapConfig {
    /// Byte delta applied to the physical offset of encrypted data.
    pub remapped_area_offset: i64,
    /// Data unit delta applied to the cipher tweak of encrypted data.
    pub remapped_area_data_unit_offset: i64,
}

/// Configuration of a queue instance.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Device kind.
    pub kind: QueueKind,
    /// Largest fragment size in bytes (multiple of [`DATA_UNIT_SIZE`]).
    pub fragment_size: usize,
    /// Number of fragment buffers in the ring.
    pub fragment_depth: usize,
    /// Scratch buffers preallocated at start.
    pub preallocated_item_count: usize,
    /// Read-ahead never reads past this offset. Zero disables read-ahead.
    pub max_read_ahead_offset: u64,
    /// Remapping of the encrypted area, if any.
    pub remap: Option<RemapConfig>,
    /// First data unit of the partition when it lies in the inactive scope
    /// of a larger encrypted drive. Takes precedence over remapping.
    pub first_data_unit: Option<u64>,
    /// Encrypted area at mount time.
    pub encrypted_area: AreaBounds,
    /// Target area of a conversion.
    pub configured_area: AreaBounds,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            kind: QueueKind::Filter(FilterParams::default()),
            fragment_size: MAX_FRAGMENT_SIZE,
            fragment_depth: FRAGMENT_BUFFER_DEPTH,
            preallocated_item_count: PREALLOCATED_ITEM_COUNT,
            max_read_ahead_offset: 0,
            remap: None,
            first_data_unit: None,
            encrypted_area: AreaBounds::EMPTY,
            configured_area: AreaBounds::EMPTY,
        }
    }
}

impl QueueConfig {
    /// Creates a configuration for the given device kind with default tuning.
    pub fn new(kind: QueueKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// Drive filter configuration.
    pub fn filter() -> Self {
        Self::new(QueueKind::Filter(FilterParams::default()))
    }

    /// Volume configuration.
    pub fn volume(params: VolumeParams) -> Self {
        Self::new(QueueKind::Volume(params))
    }

    /// Small fragments and few preallocated buffers.
    ///
    /// Suitable for tests that want many fragments per request.
    pub fn small(mut self) -> Self {
        self.fragment_size = 4 * DATA_UNIT_SIZE;
        self.preallocated_item_count = 2;
        self
    }

    /// Sets the fragment size.
    pub fn with_fragment_size(mut self, fragment_size: usize) -> Self {
        self.fragment_size = fragment_size;
        self
    }

    /// Sets the encrypted and configured areas.
    pub fn with_areas(mut self, encrypted: AreaBounds, configured: AreaBounds) -> Self {
        self.encrypted_area = encrypted;
        self.configured_area = configured;
        self
    }

    /// Enables remapping of the encrypted area.
    pub fn with_remap(mut self, remap: RemapConfig) -> Self {
        self.remap = Some(remap);
        self
    }

    /// Enables read-ahead up to `max_offset`.
    pub fn with_read_ahead(mut self, max_offset: u64) -> Self {
        self.max_read_ahead_offset = max_offset;
        self
    }

    /// Whether remapping is active.
    pub fn remap_encrypted_area(&self) -> bool {
        self.remap.is_some()
    }

    /// Fragment size rounded down to a data unit multiple, never zero.
    pub fn effective_fragment_size(&self) -> usize {
        let aligned = self.fragment_size - self.fragment_size % DATA_UNIT_SIZE;
        aligned.max(DATA_UNIT_SIZE)
    }
}

/// Configuration of the conversion engine and the decoy wipe task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionConfig {
    /// Bytes converted per step (multiple of [`DATA_UNIT_SIZE`]).
    pub block_size: usize,
    /// Bytes converted between two region record updates.
    pub header_update_threshold: u64,
    /// Hold timeout before the first step.
    pub start_hold_timeout: Duration,
    /// Hold timeout of every step.
    pub step_hold_timeout: Duration,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            block_size: SETUP_IO_BLOCK_SIZE,
            header_update_threshold: HEADER_UPDATE_THRESHOLD,
            start_hold_timeout: CONVERSION_START_HOLD_TIMEOUT,
            step_hold_timeout: CONVERSION_STEP_HOLD_TIMEOUT,
        }
    }
}

impl ConversionConfig {
    /// Creates a configuration with a custom block size and header threshold.
    pub fn new(block_size: usize, header_update_threshold: u64) -> Self {
        Self {
            block_size,
            header_update_threshold,
            ..Self::default()
        }
    }

    /// Block size rounded down to a data unit multiple, never zero.
    pub fn effective_block_size(&self) -> u64 {
        let aligned = self.block_size - self.block_size % DATA_UNIT_SIZE;
        aligned.max(DATA_UNIT_SIZE) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.fragment_size, 256 * 1024);
        assert_eq!(config.fragment_depth, 2);
        assert_eq!(config.preallocated_item_count, 8);
        assert!(config.encrypted_area.is_empty());
        assert!(!config.remap_encrypted_area());
    }

    #[test]
    fn test_small_config() {
        let config = QueueConfig::filter().small();
        assert_eq!(config.fragment_size, 2048);
        assert!(config.preallocated_item_count < PREALLOCATED_ITEM_COUNT);
    }

    #[test]
    fn test_effective_fragment_size() {
        let config = QueueConfig::filter().with_fragment_size(1000);
        assert_eq!(config.effective_fragment_size(), 512);
        let config = QueueConfig::filter().with_fragment_size(100);
        assert_eq!(config.effective_fragment_size(), 512);
    }

    #[test]
    fn test_conversion_config() {
        let config = ConversionConfig::default();
        assert_eq!(config.effective_block_size(), 1536 * 1024);
        let config = ConversionConfig::new(4 * 512 + 7, 0);
        assert_eq!(config.effective_block_size(), 2048);
    }

    #[test]
    fn test_constants() {
        assert_eq!(DATA_UNIT_SIZE, 512);
        assert_eq!(BOOT_VOLUME_HEADER_OFFSET, 31744);
        assert_eq!(HEADER_UPDATE_THRESHOLD, 67_108_864);
    }
}
