//! Decoy wipe task.
//!
//! Irreversibly overwrites the whole configured area with the passes of a
//! wipe algorithm. Pseudo-random passes come from a separate cipher keyed by
//! a one-time key, so nothing written can be related to the volume key.

use std::sync::Arc;

use log::{debug, info};
use zeroize::{Zeroize, Zeroizing};

use super::setup::{allocate_block, configured_range};
use super::wipe::{wipe_buffer, WipeAlgorithm};
use super::{hold_queue, Result, TaskState, WipeRequest};
use crate::config::{ConversionConfig, DATA_UNIT_SIZE, WIPE_RAND_CHAR_COUNT};
use crate::crypto::{CryptoContext, XtsCryptoContext};
use crate::error::{ConversionError, QueueError};
use crate::queue::EncryptedIoQueue;
use crate::volume::BlockDevice;

const UNIT: u64 = DATA_UNIT_SIZE as u64;

pub(crate) struct DecoyWiper {
    queue: Arc<EncryptedIoQueue>,
    device: Arc<dyn BlockDevice>,
    cipher: XtsCryptoContext,
    algorithm: WipeAlgorithm,
    config: ConversionConfig,
    task: Arc<TaskState>,
    area: (u64, u64),
    wipe_block: Zeroizing<Vec<u8>>,
    rand_block: Zeroizing<Vec<u8>>,
    rand_chars: [u8; WIPE_RAND_CHAR_COUNT],
    held: bool,
}

impl DecoyWiper {
    /// Loads the wipe key and burns the caller's copy.
    pub fn new(
        queue: Arc<EncryptedIoQueue>,
        config: ConversionConfig,
        request: WipeRequest,
        task: Arc<TaskState>,
    ) -> Result<Self> {
        let WipeRequest { mut key, algorithm } = request;
        let cipher = XtsCryptoContext::new(&key);
        key.zeroize();
        let cipher = cipher.map_err(QueueError::from)?;

        let area = configured_range(&queue)?;
        let block_size = config.effective_block_size() as usize;
        let wipe_block = allocate_block(block_size)?;
        let mut rand_block = allocate_block(block_size)?;

        cipher
            .encrypt_data_units(&mut rand_block, 0, block_size / DATA_UNIT_SIZE)
            .map_err(QueueError::from)?;
        let mut rand_chars = [0u8; WIPE_RAND_CHAR_COUNT];
        rand_chars.copy_from_slice(&rand_block[..WIPE_RAND_CHAR_COUNT]);

        Ok(Self {
            device: Arc::clone(queue.device()),
            queue,
            cipher,
            algorithm,
            config,
            task,
            area,
            wipe_block,
            rand_block,
            rand_chars,
            held: false,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        let result = self.wipe();

        if self.held {
            self.held = false;
            let _ = self.queue.resume_from_hold();
        }
        self.cipher.close();

        info!("Decoy wipe stopped, wiped up to {}", self.task.current_end());
        result
    }

    fn wipe(&mut self) -> Result<()> {
        let (start, end) = self.area;
        let block_size = self.config.effective_block_size();
        let mut offset = start;

        self.task.start_progress(end + 1 - start);
        debug!("Wiping [{}, {}] with {}", start, end, self.algorithm);

        while !self.task.abort_requested() {
            if offset > end {
                break;
            }
            let length = block_size.min(end + 1 - offset) as usize;

            for pass in 1..=self.algorithm.pass_count() {
                if !self.fill(pass, offset, length)? {
                    return Ok(());
                }
            }

            offset += length as u64;
            self.task.publish_end(offset as i64 - 1);
            self.task.advance(length as u64);
        }
        Ok(())
    }

    /// Writes one pass over the block at `offset`. Returns false on abort.
    fn fill(&mut self, pass: u32, offset: u64, length: usize) -> Result<bool> {
        let wipe = &mut self.wipe_block[..length];

        if !wipe_buffer(self.algorithm, &self.rand_chars, pass, wipe) {
            let rand = &mut self.rand_block[..length];
            self.cipher
                .encrypt_data_units(rand, offset / UNIT, length / DATA_UNIT_SIZE)
                .map_err(QueueError::from)?;
            wipe.copy_from_slice(rand);
        }

        self.held = hold_queue(&self.queue, &self.task, self.config.step_hold_timeout);
        if !self.held {
            return Ok(false);
        }

        self.device
            .write_at(offset, &self.wipe_block[..length])
            .map_err(|source| ConversionError::Write { offset, source })?;

        self.held = false;
        self.queue.resume_from_hold()?;
        Ok(true)
    }
}
