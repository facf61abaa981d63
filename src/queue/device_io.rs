//! Device I/O stage: physical access, remap splitting and read-ahead.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_channel as chan;
use log::trace;

use super::request::{Fragment, StageMessage};
use super::QueueShared;
use crate::config::QueueKind;
use crate::error::{QueueError, Result};
use crate::memory::FragmentBuffer;
use crate::volume::{split_remapped, PhysicalAccess};

pub(super) fn run(shared: Arc<QueueShared>, rx: chan::Receiver<StageMessage>, tx: chan::Sender<StageMessage>) {
    while let Ok(message) = rx.recv() {
        match message {
            StageMessage::Fragment(fragment) => shared.process_fragment_io(fragment, &tx),
            StageMessage::Shutdown => break,
        }
    }

    let _ = tx.send(StageMessage::Shutdown);
}

impl QueueShared {
    fn process_fragment_io(&self, mut fragment: Fragment, tx: &chan::Sender<StageMessage>) {
        self.io_pending.fetch_sub(1, Ordering::SeqCst);
        let item = Arc::clone(&fragment.item);

        let Some(mut buffer) = fragment.buffer.take() else {
            if fragment.complete_original {
                self.complete_item(&item);
            }
            return;
        };

        // Fragments of an already failed item are drained without I/O
        if item.is_ok() {
            if let Err(e) = self.perform_io(&fragment, &mut buffer, item.is_write()) {
                trace!("Fragment at {} failed: {}", fragment.offset, e);
                item.fail(e.status());
            }
        }

        if item.is_write() {
            self.read_ahead.invalidate();
            self.fragments.release(buffer);

            if fragment.complete_original {
                self.complete_item(&item);
            }
            return;
        }

        if item.is_ok() {
            let (start, length) = (fragment.item_offset, fragment.length);
            item.with_payload(|dst| dst[start..start + length].copy_from_slice(buffer.slice(length)));
        }
        self.fragments.release(buffer);

        let (_, last_read_length) = self.read_ahead.last_read();
        let read_ahead = fragment.complete_original
            && last_read_length > 0
            && item.is_ok()
            && self.io_pending.load(Ordering::SeqCst) == 0;

        // Keeps a hold from succeeding while the prefetch runs
        if read_ahead {
            self.outstanding.increment();
        }

        if let Err(chan::SendError(StageMessage::Fragment(fragment))) =
            tx.send(StageMessage::Fragment(fragment))
        {
            if fragment.complete_original {
                self.complete_item(&fragment.item);
            }
        }

        if read_ahead {
            self.read_ahead
                .prefetch(self.device.as_ref(), self.config.max_read_ahead_offset);
            self.outstanding.decrement();
        }
    }

    fn perform_io(&self, fragment: &Fragment, buffer: &mut FragmentBuffer, write: bool) -> Result<()> {
        let accesses = match (self.config.kind, self.config.remap) {
            (QueueKind::Filter(_), Some(remap)) if fragment.encrypted_length > 0 => split_remapped(
                fragment.offset,
                fragment.length,
                fragment.encrypted_offset,
                fragment.encrypted_length,
                remap.remapped_area_offset,
            )?,
            _ => vec![PhysicalAccess {
                buffer_offset: 0,
                device_offset: fragment.offset,
                length: fragment.length,
            }],
        };

        let data = buffer.slice_mut(fragment.length);
        for access in accesses {
            let part = &mut data[access.buffer_offset..access.buffer_offset + access.length];
            if write {
                self.device.write_at(access.device_offset, part)?;
            } else {
                let read = self
                    .read_ahead
                    .cached_read(self.device.as_ref(), access.device_offset, part)?;
                if read != access.length {
                    return Err(QueueError::EndOfFile(access.device_offset + read as u64));
                }
            }
        }

        Ok(())
    }
}
