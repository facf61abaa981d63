//! Completion stage: decrypts read fragments, substitutes protected
//! sectors and retires items.

use std::sync::Arc;

use crossbeam_channel as chan;

use super::request::{Fragment, StageMessage};
use super::QueueShared;
use crate::config::DATA_UNIT_SIZE;
use crate::error::Result;
use crate::volume::data_unit_index;

pub(super) fn run(shared: Arc<QueueShared>, rx: chan::Receiver<StageMessage>) {
    while let Ok(message) = rx.recv() {
        match message {
            StageMessage::Fragment(fragment) => shared.complete_fragment(fragment),
            StageMessage::Shutdown => break,
        }
    }
}

impl QueueShared {
    fn complete_fragment(&self, fragment: Fragment) {
        let item = &fragment.item;

        if fragment.encrypted_length > 0 && item.is_ok() {
            if let Err(e) = self.decrypt_fragment(&fragment) {
                item.fail(e.status());
            }
        }

        if !self.protected.is_empty() && item.is_ok() {
            let (start, length) = (fragment.item_offset, fragment.length);
            item.with_payload(|payload| {
                self.protected
                    .substitute(&mut payload[start..start + length], fragment.offset)
            });
        }

        if fragment.complete_original {
            self.complete_item(item);
        }
    }

    fn decrypt_fragment(&self, fragment: &Fragment) -> Result<()> {
        let unit = self.biased_data_unit(data_unit_index(
            fragment.offset + fragment.encrypted_offset as u64,
        ))?;
        let start = fragment.item_offset + fragment.encrypted_offset;
        let length = fragment.encrypted_length;

        let result = fragment.item.with_payload(|buffer| {
            self.crypto
                .decrypt_data_units(&mut buffer[start..start + length], unit, length / DATA_UNIT_SIZE)
        });

        match result {
            Some(decrypted) => Ok(decrypted?),
            None => Ok(()),
        }
    }
}
