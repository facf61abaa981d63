//! Submission stage: validation, address translation, write guards,
//! fragmentation and encryption of write payloads.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_channel as chan;
use log::debug;
use zeroize::Zeroize;

use super::request::{Fragment, Item, StageMessage, SubmitMessage};
use super::QueueShared;
use crate::config::{FilterParams, QueueKind, VolumeParams, BOOT_LOADER_AREA_SECTOR_COUNT, DATA_UNIT_SIZE};
use crate::error::{IoStatus, QueueError, Result};
use crate::volume::{data_unit_index, get_intersection, read_exact_at, regions_overlap};

const UNIT: u64 = DATA_UNIT_SIZE as u64;

pub(super) fn run(shared: Arc<QueueShared>, rx: chan::Receiver<SubmitMessage>, tx: chan::Sender<StageMessage>) {
    let mut next_buffer = 0;

    while let Ok(message) = rx.recv() {
        match message {
            SubmitMessage::Item { item, payload } => {
                shared.submit_item(&item, payload, &mut next_buffer, &tx);
            }
            SubmitMessage::Shutdown => break,
        }
    }

    let _ = tx.send(StageMessage::Shutdown);
}

impl QueueShared {
    fn submit_item(
        &self,
        item: &Arc<Item>,
        payload: Vec<u8>,
        next_buffer: &mut usize,
        tx: &chan::Sender<StageMessage>,
    ) {
        if let Err(e) = self.suspend.wait_while_suspended() {
            item.set_payload(payload);
            self.fail_item(item, e.status());
            return;
        }

        if item.is_cancelled() {
            item.set_payload(payload);
            self.fail_item(item, IoStatus::Cancelled);
            return;
        }

        let offset = item.offset;
        let length = item.length as u64;

        if self.is_filter()
            && !item.is_write()
            && length > 0
            && length % UNIT == 0
            && offset % UNIT != 0
        {
            self.misaligned_read(item, payload);
            return;
        }

        let device_offset = match self.admit(item, &payload) {
            Ok(device_offset) => device_offset,
            Err(e) => {
                item.set_payload(payload);
                self.fail_item(item, e.status());
                return;
            }
        };

        let payload = if item.is_write() {
            payload
        } else {
            match Self::read_payload(payload, item.length) {
                Ok(payload) => payload,
                Err(e) => {
                    self.fail_item(item, e.status());
                    return;
                }
            }
        };

        // Fragments reach the completion stage through the item, so the
        // payload must be in place before the first one is sent
        item.set_payload(payload);
        self.fragment(item, device_offset, next_buffer, tx);
    }

    /// Turns the caller's buffer into the read assembly buffer.
    fn read_payload(mut payload: Vec<u8>, length: usize) -> Result<Vec<u8>> {
        payload.clear();
        payload
            .try_reserve_exact(length)
            .map_err(|_| QueueError::ResourceExhaustion(length))?;
        payload.resize(length, 0);
        Ok(payload)
    }

    /// Validates the request and returns its device offset.
    fn admit(&self, item: &Item, payload: &[u8]) -> Result<u64> {
        let offset = item.offset;
        let length = item.length as u64;

        if length == 0 || length % UNIT != 0 || offset % UNIT != 0 {
            return Err(QueueError::Alignment);
        }
        if item.is_write() && payload.len() < item.length {
            return Err(QueueError::OutOfRange);
        }

        match self.config.kind {
            QueueKind::Volume(volume) => self.admit_volume(item, &volume),
            QueueKind::Filter(filter) => {
                offset.checked_add(length).ok_or(QueueError::OutOfRange)?;
                if item.is_write() {
                    self.check_filter_write(&filter, offset, length)?;
                }
                Ok(offset)
            }
        }
    }

    fn admit_volume(&self, item: &Item, volume: &VolumeParams) -> Result<u64> {
        let length = item.length as u64;

        let end = item.offset.checked_add(length).ok_or(QueueError::OutOfRange)?;
        if end > volume.virtual_length {
            return Err(QueueError::OutOfRange);
        }

        let base = volume.hidden_volume_offset.unwrap_or(volume.data_area_offset);
        let offset = item.offset.checked_add(base).ok_or(QueueError::OutOfRange)?;

        if let (true, Some(protected)) = (item.is_write(), volume.protection) {
            // Once triggered, every later write fails as if the device were broken
            if self.protection_triggered.load(Ordering::SeqCst) {
                return Err(QueueError::ProtectionViolation);
            }

            let protected_end = protected.offset + protected.size.saturating_sub(1);
            if protected.size > 0
                && regions_overlap(offset, offset + length - 1, protected.offset, protected_end)
            {
                debug!(
                    "Write {}-{} denied (protected {}-{})",
                    offset,
                    offset + length - 1,
                    protected.offset,
                    protected_end
                );
                self.protection_triggered.store(true, Ordering::SeqCst);
                return Err(QueueError::ProtectionViolation);
            }
        }

        Ok(offset)
    }

    fn check_filter_write(&self, filter: &FilterParams, offset: u64, length: u64) -> Result<()> {
        let end = offset + length - 1;

        if regions_overlap(offset, end, filter.header_offset, filter.header_offset + UNIT - 1) {
            debug!("Write {}-{} overlaps the boot volume header", offset, end);
            return Err(QueueError::WriteProtected(offset));
        }

        if filter.hidden_system
            && (regions_overlap(offset, end, UNIT, BOOT_LOADER_AREA_SECTOR_COUNT * UNIT - 1)
                || regions_overlap(offset, end, filter.drive_length, i64::MAX as u64))
        {
            debug!("Write {}-{} outside the hidden system area", offset, end);
            return Err(QueueError::WriteProtected(offset));
        }

        if self.protected.overlaps(offset, length) {
            debug!("Write {}-{} overlaps protected system sectors", offset, end);
            return Err(QueueError::WriteProtected(offset));
        }

        Ok(())
    }

    fn fragment(
        &self,
        item: &Arc<Item>,
        device_offset: u64,
        next_buffer: &mut usize,
        tx: &chan::Sender<StageMessage>,
    ) {
        let fragment_size = self.config.fragment_size;
        let partial = match self.config.kind {
            QueueKind::Filter(_) => true,
            QueueKind::Volume(volume) => volume.partial_encryption,
        };

        let mut item_offset = 0;
        while item_offset < item.length {
            let length = (item.length - item_offset).min(fragment_size);
            let offset = device_offset + item_offset as u64;
            let complete_original = item_offset + length == item.length;

            let buffer_index = *next_buffer;
            *next_buffer = self.fragments.next_index(buffer_index);

            let (encrypted_offset, encrypted_length) = if partial {
                match self.encrypted_area.get() {
                    Ok(area) => match area.range() {
                        Some((start, end)) => {
                            let (intersect_start, intersect_length) =
                                get_intersection(offset, length as u64, start, end);
                            ((intersect_start - offset) as usize, intersect_length as usize)
                        }
                        None => (0, 0),
                    },
                    Err(e) => {
                        item.fail(e.status());
                        (0, 0)
                    }
                }
            } else {
                (0, length)
            };

            let mut buffer = match self.fragments.acquire(buffer_index) {
                Ok(buffer) => buffer,
                Err(e) => {
                    // An empty final fragment still carries the item to completion
                    item.fail(e.status());
                    self.io_pending.fetch_add(1, Ordering::SeqCst);
                    let _ = tx.send(StageMessage::Fragment(Fragment {
                        item: Arc::clone(item),
                        offset,
                        length: 0,
                        item_offset,
                        encrypted_offset: 0,
                        encrypted_length: 0,
                        buffer: None,
                        complete_original: true,
                    }));
                    return;
                }
            };

            if item.is_write() {
                let data = buffer.slice_mut(length);
                item.with_payload(|payload| data.copy_from_slice(&payload[item_offset..item_offset + length]));

                if encrypted_length > 0 {
                    let area = &mut data[encrypted_offset..encrypted_offset + encrypted_length];
                    let result = self
                        .biased_data_unit(data_unit_index(offset + encrypted_offset as u64))
                        .and_then(|unit| {
                            Ok(self.crypto.encrypt_data_units(area, unit, encrypted_length / DATA_UNIT_SIZE)?)
                        });
                    if let Err(e) = result {
                        item.fail(e.status());
                    }
                }
            }

            self.io_pending.fetch_add(1, Ordering::SeqCst);
            let fragment = Fragment {
                item: Arc::clone(item),
                offset,
                length,
                item_offset,
                encrypted_offset,
                encrypted_length,
                buffer: Some(buffer),
                complete_original,
            };

            if let Err(chan::SendError(StageMessage::Fragment(fragment))) =
                tx.send(StageMessage::Fragment(fragment))
            {
                self.io_pending.fetch_sub(1, Ordering::SeqCst);
                if let Some(buffer) = fragment.buffer {
                    self.fragments.release(buffer);
                }
                self.fail_item(item, IoStatus::DeviceNotReady);
                return;
            }

            item_offset += length;
        }
    }

    /// Serves a read whose offset is not data unit aligned by reading one
    /// extra unit from the aligned offset below it.
    ///
    /// The aligned range is processed in pool chunks of at most one fragment.
    fn misaligned_read(&self, item: &Item, payload: Vec<u8>) {
        let result = Self::read_payload(payload, item.length).and_then(|mut payload| {
            let filled = self.fill_misaligned(item, &mut payload);
            item.set_payload(payload);
            filled
        });

        if let Err(e) = result {
            item.fail(e.status());
        }
        self.complete_item(item);
    }

    fn fill_misaligned(&self, item: &Item, payload: &mut [u8]) -> Result<()> {
        let aligned_offset = item.offset & !(UNIT - 1);
        let aligned_length = item
            .length
            .checked_add(DATA_UNIT_SIZE)
            .ok_or(QueueError::OutOfRange)?;
        aligned_offset
            .checked_add(aligned_length as u64)
            .ok_or(QueueError::OutOfRange)?;

        let chunk_size = self.config.fragment_size;
        let mut chunk = self.pool.acquire(chunk_size)?;
        let mut result = Ok(());

        let mut done = 0;
        while done < aligned_length {
            let length = (aligned_length - done).min(chunk_size);
            let offset = aligned_offset + done as u64;
            let data = &mut chunk[..length];

            result = read_exact_at(self.device.as_ref(), offset, data)
                .and_then(|()| self.decrypt_aligned(data, offset));
            if result.is_err() {
                break;
            }
            if self.is_filter() {
                self.protected.substitute(data, offset);
            }

            // Bytes of this chunk that fall inside the caller's range
            let from = item.offset.max(offset);
            let to = (item.offset + item.length as u64).min(offset + length as u64);
            if from < to {
                let dst = (from - item.offset) as usize;
                let src = (from - offset) as usize;
                let count = (to - from) as usize;
                payload[dst..dst + count].copy_from_slice(&data[src..src + count]);
            }

            done += length;
        }

        chunk[..].zeroize();
        self.pool.release(chunk);
        result
    }

    fn decrypt_aligned(&self, buffer: &mut [u8], aligned_offset: u64) -> Result<()> {
        let Some((start, end)) = self.encrypted_area.get()?.range() else {
            return Ok(());
        };

        let (intersect_start, intersect_length) =
            get_intersection(aligned_offset, buffer.len() as u64, start, end);
        if intersect_length == 0 {
            return Ok(());
        }

        let from = (intersect_start - aligned_offset) as usize;
        let area = &mut buffer[from..from + intersect_length as usize];
        self.crypto.decrypt_data_units(
            area,
            data_unit_index(intersect_start),
            intersect_length as usize / DATA_UNIT_SIZE,
        )?;
        Ok(())
    }
}
