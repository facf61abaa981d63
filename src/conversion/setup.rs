//! Encrypt-in-place and decrypt-in-place task.
//!
//! Encryption walks the configured area upwards from the end of the
//! encrypted area; decryption walks the encrypted area downwards from its
//! end. Every block is read, transformed and written back while the queue is
//! held, then the encrypted area bound is moved over it and the queue is
//! resumed. A failed write is undone before the task reports the failure.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::RngCore;
use zeroize::Zeroizing;

use super::header::{PersistHeader, RegionRecord};
use super::wipe::{wipe_buffer, WipeAlgorithm};
use super::{hold_queue, ConversionMode, ConversionRequest, Result, TaskState, HOLD_RETRY_DELAY};
use crate::config::{ConversionConfig, QueueKind, DATA_UNIT_SIZE, WIPE_RAND_CHAR_COUNT};
use crate::crypto::CryptoContext;
use crate::error::{ConversionError, QueueError};
use crate::progress::format_bytes;
use crate::queue::EncryptedIoQueue;
use crate::volume::{
    read_exact_at, read_skipping_unreadable, zero_unreadable_sectors, AreaBounds, BlockDevice, AREA_EMPTY,
};

const UNIT: u64 = DATA_UNIT_SIZE as u64;

pub(crate) fn allocate_block(size: usize) -> Result<Zeroizing<Vec<u8>>> {
    let mut block = Vec::new();
    block
        .try_reserve_exact(size)
        .map_err(|_| QueueError::ResourceExhaustion(size))?;
    block.resize(size, 0);
    Ok(Zeroizing::new(block))
}

/// Maps a failed device read onto a conversion error for `offset`.
pub(crate) fn read_error(offset: u64, e: QueueError) -> ConversionError {
    match e {
        QueueError::Device(source) => ConversionError::Read { offset, source },
        other => other.into(),
    }
}

/// Validated, data unit aligned configured area.
pub(crate) fn configured_range(queue: &EncryptedIoQueue) -> Result<(u64, u64)> {
    let area = queue.configured_area()?;
    let (start, end) = area
        .range()
        .ok_or_else(|| ConversionError::InvalidArea("no area configured".to_string()))?;
    if start % UNIT != 0 || (end + 1) % UNIT != 0 {
        return Err(ConversionError::InvalidArea(format!(
            "[{}, {}] is not data unit aligned",
            start, end
        )));
    }
    Ok((start, end))
}

/// Rejects queues whose cipher tweak differs from the plain data unit index.
///
/// Conversion transforms blocks at their device offset with the unbiased
/// index, which only matches what a drive filter without remapping or an
/// inactive-scope bias reads back.
fn check_unbiased(queue: &EncryptedIoQueue) -> Result<()> {
    let config = queue.config();
    if !matches!(config.kind, QueueKind::Filter(_)) {
        return Err(ConversionError::InvalidArea(
            "in-place conversion needs a drive filter queue".to_string(),
        ));
    }
    if config.first_data_unit.is_some_and(|first| first != 0) || config.remap_encrypted_area() {
        return Err(ConversionError::InvalidArea(
            "in-place conversion cannot run on a remapped or biased queue".to_string(),
        ));
    }
    Ok(())
}

pub(crate) struct Converter {
    queue: Arc<EncryptedIoQueue>,
    header: Arc<dyn PersistHeader>,
    device: Arc<dyn BlockDevice>,
    crypto: Arc<dyn CryptoContext>,
    config: ConversionConfig,
    request: ConversionRequest,
    task: Arc<TaskState>,
    block: Zeroizing<Vec<u8>>,
    wipe_block: Zeroizing<Vec<u8>>,
    rand_chars: [u8; WIPE_RAND_CHAR_COUNT],
    rand_update: [u8; WIPE_RAND_CHAR_COUNT],
    offset: u64,
    /// This task holds the queue.
    held: bool,
    header_update_required: bool,
    bytes_since_update: u64,
}

impl Converter {
    pub fn new(
        queue: Arc<EncryptedIoQueue>,
        header: Arc<dyn PersistHeader>,
        config: ConversionConfig,
        request: ConversionRequest,
        task: Arc<TaskState>,
    ) -> Result<Self> {
        check_unbiased(&queue)?;
        if request.mode == ConversionMode::Encrypt {
            configured_range(&queue)?;
        }

        let block_size = config.effective_block_size() as usize;
        let block = allocate_block(block_size)?;
        let wipe_block = match (request.mode, request.wipe_algorithm) {
            (ConversionMode::Encrypt, Some(_)) => allocate_block(block_size)?,
            _ => Zeroizing::new(Vec::new()),
        };

        let mut rng = rand::rng();
        let mut rand_chars = [0u8; WIPE_RAND_CHAR_COUNT];
        let mut rand_update = [0u8; WIPE_RAND_CHAR_COUNT];
        rng.fill_bytes(&mut rand_chars);
        rng.fill_bytes(&mut rand_update);

        Ok(Self {
            device: Arc::clone(queue.device()),
            crypto: Arc::clone(queue.crypto()),
            queue,
            header,
            config,
            request,
            task,
            block,
            wipe_block,
            rand_chars,
            rand_update,
            offset: 0,
            held: false,
            header_update_required: false,
            bytes_since_update: 0,
        })
    }

    /// Runs the whole task. An abort is a success.
    pub fn run(&mut self) -> Result<()> {
        let result = self.convert();
        self.finish(result)
    }

    fn convert(&mut self) -> Result<()> {
        if !self.hold(self.config.start_hold_timeout) {
            return Ok(());
        }
        if !self.prepare()? {
            return Ok(());
        }
        self.resume()?;

        while !self.task.abort_requested() {
            if !self.step()? {
                break;
            }
        }
        Ok(())
    }

    fn hold(&mut self, timeout: Duration) -> bool {
        self.held = hold_queue(&self.queue, &self.task, timeout);
        self.held
    }

    fn resume(&mut self) -> Result<()> {
        self.held = false;
        Ok(self.queue.resume_from_hold()?)
    }

    /// Positions the cursor while the queue is held.
    ///
    /// Returns false when there is nothing to convert.
    fn prepare(&mut self) -> Result<bool> {
        let area = self.queue.encrypted_area()?;

        match self.request.mode {
            ConversionMode::Encrypt => {
                let (start, end) = configured_range(&self.queue)?;
                if area.is_empty() {
                    self.queue.encrypted_area_cell().set(AreaBounds {
                        start: start as i64,
                        end: AREA_EMPTY,
                    })?;
                    self.offset = start;
                } else if area.end == end as i64 {
                    return Err(QueueError::InvalidState("configured area is already fully encrypted").into());
                } else {
                    self.offset = (area.end + 1) as u64;
                }
                self.task
                    .start_progress((end + 1).saturating_sub(self.offset));
            }
            ConversionMode::Decrypt => {
                if area.is_empty() {
                    return Ok(false);
                }
                self.offset = (area.end + 1) as u64;
                self.task.start_progress(area.len());
            }
        }

        debug!(
            "Converting from offset {} (encrypted area {:?}, configured {:?})",
            self.offset,
            area,
            self.queue.configured_area()?
        );
        Ok(true)
    }

    /// Size of the next block, moving the cursor downwards when decrypting.
    fn next_block(&mut self) -> Result<u64> {
        let block_size = self.config.effective_block_size();

        match self.request.mode {
            ConversionMode::Encrypt => {
                let (_, end) = configured_range(&self.queue)?;
                if self.offset > end {
                    return Ok(0);
                }
                Ok(block_size.min(end + 1 - self.offset))
            }
            ConversionMode::Decrypt => {
                let start = self.queue.encrypted_area()?.start;
                if start < 0 {
                    return Ok(0);
                }
                let size = block_size.min(self.offset.saturating_sub(start as u64));
                self.offset -= size;
                Ok(size)
            }
        }
    }

    /// Converts one block. Returns false when the run is complete or aborted.
    pub(crate) fn step(&mut self) -> Result<bool> {
        let size = self.next_block()?;
        if size == 0 {
            return Ok(false);
        }

        if !self.hold(self.config.step_hold_timeout) {
            return Ok(false);
        }

        let offset = self.offset;
        let length = size as usize;
        self.read_block(offset, length)?;

        let first_unit = offset / UNIT;
        let unit_count = length / DATA_UNIT_SIZE;

        match self.request.mode {
            ConversionMode::Encrypt => {
                self.crypto
                    .encrypt_data_units(&mut self.block[..length], first_unit, unit_count)
                    .map_err(QueueError::from)?;
                if let Some(algorithm) = self.request.wipe_algorithm {
                    self.wipe_passes(algorithm, offset, length)?;
                }
            }
            ConversionMode::Decrypt => {
                self.crypto
                    .decrypt_data_units(&mut self.block[..length], first_unit, unit_count)
                    .map_err(QueueError::from)?;
            }
        }

        if let Err(source) = self.device.write_at(offset, &self.block[..length]) {
            self.rollback(offset, length);
            return Err(ConversionError::Write { offset, source });
        }

        if self.request.mode == ConversionMode::Encrypt {
            self.offset += size;
        }

        let end = self.offset as i64 - 1;
        self.queue.encrypted_area_cell().set_end(end)?;
        self.header_update_required = true;
        self.resume()?;

        self.task.publish_end(end);
        self.task.advance(size);

        self.bytes_since_update += size;
        if self.bytes_since_update >= self.config.header_update_threshold {
            match self.persist() {
                Ok(()) => {
                    debug!("Encrypted area end {} persisted", end);
                    self.header_update_required = false;
                    self.bytes_since_update = 0;
                }
                Err(e) => error!("Failed to persist encrypted area: {}", e),
            }
        }

        Ok(true)
    }

    fn read_block(&mut self, offset: u64, length: usize) -> Result<()> {
        let device = self.device.as_ref();
        let buffer = &mut self.block[..length];

        let Err(e) = read_exact_at(device, offset, buffer) else {
            return Ok(());
        };

        match self.request.mode {
            ConversionMode::Encrypt if self.request.zero_unreadable => {
                warn!("Read of {} at offset {} failed ({}), zeroing unreadable sectors", format_bytes(length as u64), offset, e);
                zero_unreadable_sectors(device, offset, length as u64, device.sector_size())
                    .map_err(|source| ConversionError::Read { offset, source })?;
                read_exact_at(device, offset, buffer).map_err(|e| read_error(offset, e))
            }
            ConversionMode::Decrypt if self.request.skip_unreadable => {
                read_skipping_unreadable(device, offset, buffer, device.sector_size())
                    .map_err(|source| ConversionError::Read { offset, source })?;
                Ok(())
            }
            _ => Err(read_error(offset, e)),
        }
    }

    /// Overwrites the block with the wipe passes before its final write.
    fn wipe_passes(&mut self, algorithm: WipeAlgorithm, offset: u64, length: usize) -> Result<()> {
        let first_unit = offset / UNIT;
        let unit_count = length / DATA_UNIT_SIZE;

        for pass in 1..=algorithm.pass_count() {
            let wipe = &mut self.wipe_block[..length];

            if !wipe_buffer(algorithm, &self.rand_chars, pass, wipe) {
                for (w, b) in wipe.iter_mut().zip(self.block[..length].iter()) {
                    *w = b.wrapping_add(pass as u8);
                }
                self.crypto
                    .encrypt_data_units(wipe, first_unit, unit_count)
                    .map_err(QueueError::from)?;
                self.rand_update.copy_from_slice(&wipe[..WIPE_RAND_CHAR_COUNT]);
            }

            if let Err(source) = self.device.write_at(offset, &self.wipe_block[..length]) {
                self.rollback(offset, length);
                return Err(ConversionError::Write { offset, source });
            }
        }

        self.rand_chars = self.rand_update;
        Ok(())
    }

    /// Restores the block's previous form on the device, best effort.
    fn rollback(&mut self, offset: u64, length: usize) {
        let buffer = &mut self.block[..length];
        let first_unit = offset / UNIT;
        let unit_count = length / DATA_UNIT_SIZE;

        let undone = match self.request.mode {
            ConversionMode::Encrypt => self.crypto.decrypt_data_units(buffer, first_unit, unit_count),
            ConversionMode::Decrypt => self.crypto.encrypt_data_units(buffer, first_unit, unit_count),
        };

        let restored = undone
            .map_err(|e| e.to_string())
            .and_then(|()| self.device.write_at(offset, buffer).map_err(|e| e.to_string()));

        match restored {
            Ok(()) => warn!("Rolled back block at offset {}", offset),
            Err(e) => warn!("Rollback of block at offset {} failed: {}", offset, e),
        }
    }

    fn persist(&self) -> Result<()> {
        let area = self.queue.encrypted_area()?;
        match RegionRecord::from_bounds(area) {
            Some(record) => self.header.persist_region(Some(record)),
            None if self.request.mode == ConversionMode::Decrypt => self.header.persist_region(None),
            None => Ok(()),
        }
    }

    /// Leaves the queue running and the area consistent, whatever the result.
    fn finish(&mut self, mut result: Result<()>) -> Result<()> {
        let queue = Arc::clone(&self.queue);
        let cell = queue.encrypted_area_cell();

        if let Ok(area) = cell.get() {
            if area.end == AREA_EMPTY {
                let _ = cell.set_start(AREA_EMPTY);
            }
        }

        if self.held {
            let _ = self.resume();
        }

        if self.request.mode == ConversionMode::Decrypt {
            if let Ok(area) = cell.get() {
                if area.start >= area.end {
                    while self.queue.hold_when_idle(Duration::ZERO).is_err() {
                        thread::sleep(HOLD_RETRY_DELAY);
                    }
                    let reset = cell
                        .set(AreaBounds::EMPTY)
                        .and_then(|()| self.queue.configured_area_cell().set(AreaBounds::EMPTY));
                    let _ = self.queue.resume_from_hold();
                    if let Err(e) = reset {
                        if result.is_ok() {
                            result = Err(e.into());
                        }
                    }
                    self.header_update_required = true;
                    info!("Device fully decrypted");
                }
            }
        }

        if self.header_update_required {
            match self.persist() {
                Ok(()) => self.header_update_required = false,
                Err(e) => {
                    error!("Failed to persist encrypted area: {}", e);
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }

        if let Ok(area) = cell.get() {
            self.task.publish_end(area.end);
            info!("Conversion stopped, encrypted area {:?}", area);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::conversion::MemoryHeaderStore;
    use crate::crypto::XtsCryptoContext;
    use crate::volume::MemoryDevice;

    const UNITS: usize = 10;

    fn plaintext() -> Vec<u8> {
        (0..UNITS * DATA_UNIT_SIZE).map(|i| (i / DATA_UNIT_SIZE) as u8 + 1).collect()
    }

    fn setup(request: ConversionRequest) -> (Converter, Arc<EncryptedIoQueue>, Arc<MemoryDevice>, Arc<MemoryHeaderStore>) {
        let device = Arc::new(MemoryDevice::from_data(plaintext()));
        let configured = AreaBounds::with_length(0, (UNITS * DATA_UNIT_SIZE) as u64);
        let config = QueueConfig::filter().small().with_areas(AreaBounds::EMPTY, configured);
        let queue = Arc::new(
            EncryptedIoQueue::start(config, Arc::new(XtsCryptoContext::random()), device.clone()).unwrap(),
        );
        let header = Arc::new(MemoryHeaderStore::new());
        let converter = Converter::new(
            queue.clone(),
            header.clone(),
            ConversionConfig::new(4 * DATA_UNIT_SIZE, u64::MAX),
            request,
            Arc::new(TaskState::new(AREA_EMPTY, None)),
        )
        .unwrap();
        (converter, queue, device, header)
    }

    #[test]
    fn test_single_step_moves_bound() {
        let (mut converter, queue, device, _header) = setup(ConversionRequest::encrypt());

        assert!(hold_queue(&queue, &converter.task, converter.config.start_hold_timeout));
        assert!(converter.prepare().unwrap());
        queue.resume_from_hold().unwrap();
        assert!(converter.step().unwrap());

        let area = queue.encrypted_area().unwrap();
        assert_eq!(area, AreaBounds::new(0, 4 * UNIT - 1));
        assert!(!queue.is_suspended());

        let original = plaintext();
        assert_ne!(device.raw(2 * UNIT, DATA_UNIT_SIZE), original[1024..1536]);
        assert_eq!(queue.read(2 * UNIT, DATA_UNIT_SIZE).data, original[1024..1536]);
        assert_eq!(device.raw(7 * UNIT, DATA_UNIT_SIZE), original[3584..4096]);
        assert_eq!(queue.read(7 * UNIT, DATA_UNIT_SIZE).data, original[3584..4096]);
    }

    #[test]
    fn test_full_run_persists_final_bound() {
        let (mut converter, queue, _device, header) = setup(ConversionRequest::encrypt());
        converter.run().unwrap();

        assert_eq!(queue.encrypted_area().unwrap(), AreaBounds::new(0, 10 * UNIT - 1));
        assert_eq!(
            header.load_region().unwrap(),
            Some(RegionRecord { start: 0, end: 10 * UNIT - 1 })
        );
        assert_eq!(queue.read(0, UNITS * DATA_UNIT_SIZE).data, plaintext());
    }

    #[test]
    fn test_read_failure_aborts_step() {
        let (mut converter, queue, device, _header) = setup(ConversionRequest::encrypt());
        device.fail_reads(UNIT..2 * UNIT);

        let result = converter.run();
        assert!(matches!(result, Err(ConversionError::Read { offset: 0, .. })));
        assert!(queue.encrypted_area().unwrap().is_empty());
        assert!(!queue.is_suspended());
    }

    #[test]
    fn test_read_error_mapping() {
        let err = read_error(512, QueueError::Device(std::io::Error::other("bad")));
        assert!(matches!(err, ConversionError::Read { offset: 512, .. }));
        let err = read_error(512, QueueError::EndOfFile(600));
        assert!(matches!(err, ConversionError::Queue(QueueError::EndOfFile(600))));
    }
}
